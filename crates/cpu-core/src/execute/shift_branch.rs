//! Shift, bit, and small-displacement branch group.

use crate::api::ChannelBus;
use crate::cpu::Cpu;
use crate::fault::Trap;
use crate::memory::MemoryBus;
use crate::opcode::{bcc_mask, branch_displacement, BranchOp, ShiftOp};
use crate::state::{ConditionCode, STATUS_O};

pub(crate) fn execute<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let word = cpu.regs.cir;
    if word & 0o004_000 == 0 {
        execute_shift(cpu, word)
    } else {
        execute_branch(cpu, word)
    }
}

fn execute_shift<M: MemoryBus, C: ChannelBus>(
    cpu: &mut Cpu<M, C>,
    word: u16,
) -> Result<(), Trap> {
    let Some(op) = ShiftOp::from_field(((word >> 6) & 0o37) as u8) else {
        return Err(Trap::Undefined);
    };
    let count = u32::from(word & 0o77);

    match op {
        ShiftOp::Dasl | ShiftOp::Dasr | ShiftOp::Dlsl | ShiftOp::Dlsr => {
            cpu.adjust_sr(2)?;
            let value = (u32::from(cpu.regs.tos[0]) << 16) | u32::from(cpu.regs.tos[1]);
            let shifted = match op {
                ShiftOp::Dasr => ((value as i32) >> count.min(31)) as u32,
                ShiftOp::Dlsl => value.checked_shl(count).unwrap_or(0),
                ShiftOp::Dlsr => value.checked_shr(count).unwrap_or(0),
                _ => arithmetic_shift_left_32(value, count),
            };
            cpu.regs.tos[0] = (shifted >> 16) as u16;
            cpu.regs.tos[1] = shifted as u16;
            cpu.regs.set_condition(ConditionCode::from_double(shifted));
        }
        ShiftOp::Asl | ShiftOp::Asr | ShiftOp::Lsl | ShiftOp::Lsr | ShiftOp::Csl
        | ShiftOp::Csr => {
            cpu.adjust_sr(1)?;
            let value = cpu.regs.tos[0];
            let shifted = match op {
                ShiftOp::Asr => ((value as i16) >> count.min(15)) as u16,
                ShiftOp::Lsl => value.checked_shl(count).unwrap_or(0),
                ShiftOp::Lsr => value.checked_shr(count).unwrap_or(0),
                ShiftOp::Csl => value.rotate_left(count % 16),
                ShiftOp::Csr => value.rotate_right(count % 16),
                _ => arithmetic_shift_left_16(value, count),
            };
            cpu.regs.tos[0] = shifted;
            cpu.regs.set_condition_from(shifted);
        }
    }
    Ok(())
}

/// Arithmetic left shift: the sign bit is preserved, magnitude bits shift
/// beneath it.
const fn arithmetic_shift_left_16(value: u16, count: u32) -> u16 {
    let sign = value & 0o100_000;
    let magnitude = if count >= 16 {
        0
    } else {
        (value << count) & 0o077_777
    };
    sign | magnitude
}

const fn arithmetic_shift_left_32(value: u32, count: u32) -> u32 {
    let sign = value & 0x8000_0000;
    let magnitude = if count >= 32 {
        0
    } else {
        (value << count) & 0x7FFF_FFFF
    };
    sign | magnitude
}

fn execute_branch<M: MemoryBus, C: ChannelBus>(
    cpu: &mut Cpu<M, C>,
    word: u16,
) -> Result<(), Trap> {
    let Some(op) = BranchOp::from_field(((word >> 8) & 0o7) as u8) else {
        return Err(Trap::Undefined);
    };
    let target =
        (i32::from(cpu.regs.cir_address())).wrapping_add(branch_displacement(word)) as u16;

    let taken = match op {
        BranchOp::Bcc => {
            let mask = bcc_mask(word);
            let bit = match cpu.regs.condition() {
                ConditionCode::Greater => 0o4,
                ConditionCode::Less => 0o2,
                ConditionCode::Equal => 0o1,
            };
            mask & bit != 0
        }
        BranchOp::Ixbz => {
            cpu.regs.x = cpu.regs.x.wrapping_add(1);
            cpu.regs.x == 0
        }
        BranchOp::Dxbz => {
            cpu.regs.x = cpu.regs.x.wrapping_sub(1);
            cpu.regs.x == 0
        }
        BranchOp::Cprb => {
            cpu.adjust_sr(2)?;
            let upper = cpu.pop()? as i16;
            let lower = cpu.pop()? as i16;
            let x = cpu.regs.x as i16;
            let cc = if x < lower {
                ConditionCode::Less
            } else if x > upper {
                ConditionCode::Greater
            } else {
                ConditionCode::Equal
            };
            cpu.regs.set_condition(cc);
            cc == ConditionCode::Equal
        }
        BranchOp::Bov => {
            let set = cpu.regs.sta & STATUS_O != 0;
            cpu.regs.set_status_flag(STATUS_O, false);
            set
        }
        BranchOp::Bnov => {
            let set = cpu.regs.sta & STATUS_O != 0;
            cpu.regs.set_status_flag(STATUS_O, false);
            !set
        }
    };

    if taken {
        cpu.branch_to(target)?;
    }
    Ok(())
}

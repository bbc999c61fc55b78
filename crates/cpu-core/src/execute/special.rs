//! Move/special and immediate instruction groups, including procedure
//! call/exit and the privileged machine-control operations.

use crate::api::ChannelBus;
use crate::cpu::Cpu;
use crate::fault::{Trap, CPX2_RUN_FLIP_FLOP};
use crate::memory::{AccessClass, MemoryBus};
use crate::opcode::{
    decode_special_op, immediate_operand, ImmediateOp, SpecialOp, SPECIAL_EXTENSION_BASE,
};
use crate::segment::{label_is_external, INTERRUPT_MASK_CELL, LABEL_ADDRESS_MASK, LABEL_UNCALLABLE};
use crate::state::{
    ConditionCode, MachineState, STATUS_C, STATUS_CC_MASK, STATUS_I, STATUS_O, STATUS_R,
};

use super::arith;

/// Register selection bits of the PSHR/SETR mask, most significant first.
/// Bit `0o200` is reserved; SETR still consumes a stack word for it.
const MASK_RESERVED: u16 = 0o200;
const MASK_DB: u16 = 0o100;
const MASK_DL: u16 = 0o40;
const MASK_Z: u16 = 0o20;
const MASK_STA: u16 = 0o10;
const MASK_X: u16 = 0o4;
const MASK_Q: u16 = 0o2;
const MASK_S: u16 = 0o1;

/// STA bits a non-privileged SETR may replace.
const USER_STATUS_MASK: u16 = STATUS_O | STATUS_C | STATUS_CC_MASK | STATUS_R;

pub(crate) fn execute_special<M: MemoryBus, C: ChannelBus>(
    cpu: &mut Cpu<M, C>,
) -> Result<(), Trap> {
    let word = cpu.regs.cir;
    let code = ((word >> 6) & 0o77) as u8;
    let Some(op) = decode_special_op(code) else {
        if code >= SPECIAL_EXTENSION_BASE {
            // decimal/string firmware extension is not fitted
            return Err(Trap::Unimplemented);
        }
        return Err(Trap::Undefined);
    };

    match op {
        SpecialOp::Move => execute_move(cpu),
        SpecialOp::Mvb => execute_mvb(cpu),
        SpecialOp::Paus => {
            require_privilege(cpu)?;
            cpu.state = MachineState::Paused;
            Ok(())
        }
        SpecialOp::Halt => {
            require_privilege(cpu)?;
            cpu.regs.cpx2 &= !CPX2_RUN_FLIP_FLOP;
            cpu.state = MachineState::Halted;
            Ok(())
        }
        SpecialOp::Sed => {
            require_privilege(cpu)?;
            cpu.regs.set_status_flag(STATUS_I, word & 1 != 0);
            Ok(())
        }
        SpecialOp::Xchd => {
            require_privilege(cpu)?;
            cpu.adjust_sr(1)?;
            core::mem::swap(&mut cpu.regs.tos[0], &mut cpu.regs.db);
            Ok(())
        }
        SpecialOp::Smsk => {
            require_privilege(cpu)?;
            cpu.adjust_sr(1)?;
            let mask = cpu.pop()?;
            cpu.write_absolute(INTERRUPT_MASK_CELL, mask)
        }
        SpecialOp::Rmsk => {
            let mask = cpu.read_absolute(INTERRUPT_MASK_CELL)?;
            cpu.push(mask)
        }
        SpecialOp::Ixit => {
            cpu.exit_interrupt()
        }
        SpecialOp::Sio | SpecialOp::Rio | SpecialOp::Tio | SpecialOp::Cio => {
            // direct-I/O belongs to the channel collaborator
            require_privilege(cpu)?;
            Err(Trap::Unimplemented)
        }
    }
}

fn require_privilege<M: MemoryBus, C: ChannelBus>(cpu: &Cpu<M, C>) -> Result<(), Trap> {
    if cpu.regs.privileged() {
        Ok(())
    } else {
        Err(Trap::PrivilegeViolation)
    }
}

/// Word block move: RA = count, RB = source, RC = target, both DB-relative.
/// Each word is checked individually, so a mid-move trap leaves a partial
/// transfer, which the architecture permits.
fn execute_move<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    cpu.adjust_sr(3)?;
    let count = cpu.regs.tos[0];
    let source = cpu.regs.tos[1];
    let target = cpu.regs.tos[2];
    for index in 0..count {
        cpu.regs.cntr = count - index;
        let word = cpu.read(AccessClass::Data, cpu.regs.db.wrapping_add(source).wrapping_add(index))?;
        cpu.write(
            AccessClass::Data,
            cpu.regs.db.wrapping_add(target).wrapping_add(index),
            word,
        )?;
    }
    cpu.regs.cntr = 0;
    let _ = cpu.pop()?;
    let _ = cpu.pop()?;
    let _ = cpu.pop()?;
    cpu.regs.set_condition(ConditionCode::Equal);
    Ok(())
}

/// Byte block move with the byte-offset reinterpretation rule applied per
/// byte.
fn execute_mvb<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    cpu.adjust_sr(3)?;
    let count = cpu.regs.tos[0];
    let source = cpu.regs.tos[1];
    let target = cpu.regs.tos[2];
    for index in 0..count {
        cpu.regs.cntr = count - index;
        let from = cpu.classify_byte_offset(source.wrapping_add(index))?;
        let byte = cpu.read_byte(
            from.class,
            from.offset,
            from.byte.unwrap_or(crate::memory::ByteSelector::Upper),
        )?;
        let to = cpu.classify_byte_offset(target.wrapping_add(index))?;
        cpu.write_byte(
            to.class,
            to.offset,
            to.byte.unwrap_or(crate::memory::ByteSelector::Upper),
            byte,
        )?;
    }
    cpu.regs.cntr = 0;
    let _ = cpu.pop()?;
    let _ = cpu.pop()?;
    let _ = cpu.pop()?;
    cpu.regs.set_condition(ConditionCode::Equal);
    Ok(())
}

pub(crate) fn execute_immediate<M: MemoryBus, C: ChannelBus>(
    cpu: &mut Cpu<M, C>,
) -> Result<(), Trap> {
    let word = cpu.regs.cir;
    let Some(op) = ImmediateOp::from_field(((word >> 8) & 0o17) as u8) else {
        return Err(Trap::Undefined);
    };
    let operand = immediate_operand(word);

    match op {
        ImmediateOp::Ldi => {
            cpu.push(operand)?;
            cpu.regs.set_condition_from(operand);
            Ok(())
        }
        ImmediateOp::Ldxi => {
            cpu.regs.x = operand;
            cpu.regs.set_condition_from(operand);
            Ok(())
        }
        ImmediateOp::Ldni => {
            let value = operand.wrapping_neg();
            cpu.push(value)?;
            cpu.regs.set_condition_from(value);
            Ok(())
        }
        ImmediateOp::Cmpi => {
            cpu.adjust_sr(1)?;
            let top = cpu.pop()?;
            cpu.regs
                .set_condition(ConditionCode::from_compare(top, operand));
            Ok(())
        }
        ImmediateOp::Addi => immediate_arith(cpu, operand, arith::add),
        ImmediateOp::Subi => immediate_arith(cpu, operand, arith::sub),
        ImmediateOp::Mpyi => {
            cpu.adjust_sr(1)?;
            let top = cpu.pop()?;
            let product = arith::mul(top, operand);
            cpu.push(product.value)?;
            cpu.regs.set_condition_from(product.value);
            cpu.overflow(product.overflow)
        }
        ImmediateOp::Divi => {
            cpu.adjust_sr(1)?;
            let dividend = cpu.pop()?;
            if operand == 0 {
                cpu.push(0)?;
                return cpu.divide_by_zero();
            }
            match arith::divide(i32::from(dividend as i16), operand as i16) {
                Some((quotient, _)) => {
                    cpu.push(quotient as u16)?;
                    cpu.regs.set_condition_from(quotient as u16);
                    Ok(())
                }
                None => {
                    cpu.push(dividend)?;
                    cpu.overflow(true)
                }
            }
        }
        ImmediateOp::Pshr => execute_pshr(cpu, operand),
        ImmediateOp::Setr => execute_setr(cpu, operand),
        ImmediateOp::Pcal => {
            let label = if operand == 0 {
                cpu.adjust_sr(1)?;
                cpu.pop()?
            } else {
                cpu.read_stt_entry(operand)?
            };
            cpu.call_procedure(label, 0)
        }
        ImmediateOp::Exit => {
            let delta = cpu.read(AccessClass::Stack, cpu.regs.q)?;
            let new_q = cpu.regs.q.wrapping_sub(delta);
            let new_sm = cpu.regs.q.wrapping_sub(4).wrapping_sub(operand);
            cpu.exit_procedure(new_q, new_sm)
        }
        ImmediateOp::Scal => execute_scal(cpu, operand),
        ImmediateOp::Sxit => {
            cpu.adjust_sr(1)?;
            let return_offset = cpu.pop()?;
            for _ in 0..operand {
                let _ = cpu.pop()?;
            }
            cpu.branch_to(cpu.regs.pb.wrapping_add(return_offset))
        }
        ImmediateOp::Xeq => {
            let offset = cpu.regs.stack_top().wrapping_sub(operand);
            let word = cpu.read(AccessClass::DataMapped, offset)?;
            cpu.xeq_pending = Some(word);
            Ok(())
        }
    }
}

fn immediate_arith<M: MemoryBus, C: ChannelBus>(
    cpu: &mut Cpu<M, C>,
    operand: u16,
    op: fn(u16, u16) -> arith::Outcome,
) -> Result<(), Trap> {
    cpu.adjust_sr(1)?;
    let top = cpu.pop()?;
    let outcome = op(top, operand);
    cpu.push(outcome.value)?;
    cpu.regs.set_status_flag(STATUS_C, outcome.carry);
    cpu.regs.set_condition_from(outcome.value);
    cpu.overflow(outcome.overflow)
}

/// Pushes selected registers, most-significant mask bit first. The
/// reserved bit pushes nothing.
fn execute_pshr<M: MemoryBus, C: ChannelBus>(
    cpu: &mut Cpu<M, C>,
    mask: u16,
) -> Result<(), Trap> {
    let stack_top = cpu.regs.stack_top();
    if mask & MASK_DB != 0 {
        let db = cpu.regs.db;
        cpu.push(db)?;
    }
    if mask & MASK_DL != 0 {
        let dl = cpu.regs.dl;
        cpu.push(dl)?;
    }
    if mask & MASK_Z != 0 {
        let z = cpu.regs.z;
        cpu.push(z)?;
    }
    if mask & MASK_STA != 0 {
        let sta = cpu.regs.sta;
        cpu.push(sta)?;
    }
    if mask & MASK_X != 0 {
        let x = cpu.regs.x;
        cpu.push(x)?;
    }
    if mask & MASK_Q != 0 {
        let q = cpu.regs.q;
        cpu.push(q)?;
    }
    if mask & MASK_S != 0 {
        cpu.push(stack_top)?;
    }
    Ok(())
}

/// Pops selected registers in reverse PSHR order, applying them only after
/// every word has been read. The reserved mask bit pops one extra word and
/// discards it, matching the microcode.
fn execute_setr<M: MemoryBus, C: ChannelBus>(
    cpu: &mut Cpu<M, C>,
    mask: u16,
) -> Result<(), Trap> {
    if !cpu.regs.privileged() && mask & (MASK_DB | MASK_DL | MASK_Z) != 0 {
        return Err(Trap::PrivilegeViolation);
    }

    let mut new_s = None;
    let mut new_q = None;
    let mut new_x = None;
    let mut new_sta = None;
    let mut new_z = None;
    let mut new_dl = None;
    let mut new_db = None;

    if mask & MASK_S != 0 {
        new_s = Some(cpu.pop()?);
    }
    if mask & MASK_Q != 0 {
        new_q = Some(cpu.pop()?);
    }
    if mask & MASK_X != 0 {
        new_x = Some(cpu.pop()?);
    }
    if mask & MASK_STA != 0 {
        new_sta = Some(cpu.pop()?);
    }
    if mask & MASK_Z != 0 {
        new_z = Some(cpu.pop()?);
    }
    if mask & MASK_DL != 0 {
        new_dl = Some(cpu.pop()?);
    }
    if mask & MASK_DB != 0 {
        new_db = Some(cpu.pop()?);
    }
    if mask & MASK_RESERVED != 0 {
        // reserved bit: one word consumed, no register loaded
        let _ = cpu.pop()?;
    }

    if let Some(value) = new_db {
        cpu.regs.db = value;
    }
    if let Some(value) = new_dl {
        cpu.regs.dl = value;
    }
    if let Some(value) = new_z {
        cpu.regs.z = value;
    }
    if let Some(value) = new_sta {
        if cpu.regs.privileged() {
            cpu.regs.sta = value;
        } else {
            cpu.regs.sta =
                (cpu.regs.sta & !USER_STATUS_MASK) | (value & USER_STATUS_MASK);
        }
    }
    if let Some(value) = new_x {
        cpu.regs.x = value;
    }
    if let Some(value) = new_q {
        cpu.regs.q = value;
    }
    if let Some(value) = new_s {
        cpu.regs.sm = value;
        cpu.regs.sr = 0;
    }
    Ok(())
}

fn execute_scal<M: MemoryBus, C: ChannelBus>(
    cpu: &mut Cpu<M, C>,
    operand: u16,
) -> Result<(), Trap> {
    let label = if operand == 0 {
        cpu.adjust_sr(1)?;
        cpu.pop()?
    } else {
        cpu.read_stt_entry(operand)?
    };
    if label_is_external(label) {
        return Err(Trap::SttViolation {
            segment: cpu.regs.segment(),
        });
    }
    if label & LABEL_UNCALLABLE != 0 && !cpu.regs.privileged() {
        return Err(Trap::SttEntryUncallable { label });
    }
    let return_offset = cpu
        .regs
        .cir_address()
        .wrapping_add(1)
        .wrapping_sub(cpu.regs.pb);
    cpu.push(return_offset)?;
    cpu.branch_to(cpu.regs.pb.wrapping_add(label & LABEL_ADDRESS_MASK))
}

#[cfg(test)]
mod tests {
    use crate::state::STATUS_M;

    #[test]
    fn user_status_mask_excludes_mode_and_enables() {
        assert_eq!(super::USER_STATUS_MASK & STATUS_M, 0);
        assert_eq!(super::USER_STATUS_MASK & crate::state::STATUS_I, 0);
        assert_eq!(super::USER_STATUS_MASK & crate::state::STATUS_T, 0);
    }
}

//! Instruction executors.
//!
//! The outer dispatch keys on the leading four bits of CIR; the four
//! sub-dispatched groups live in their own modules, the twelve
//! memory-reference classes are handled here. Executors mutate the core
//! directly the way microcode does: traps occur only after reads and
//! before the corresponding writes, so partial completion is always
//! architecturally acceptable.

pub(crate) mod arith;
mod shift_branch;
mod special;
mod stack_ops;

use crate::addressing::OperandSize;
use crate::api::ChannelBus;
use crate::cpu::Cpu;
use crate::fault::Trap;
use crate::memory::MemoryBus;
use crate::opcode::PrimaryOp;
use crate::state::{ConditionCode, STATUS_C};

/// Executes the instruction in CIR.
pub(crate) fn dispatch<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    match PrimaryOp::from_word(cpu.regs.cir) {
        PrimaryOp::Stack => stack_ops::execute(cpu),
        PrimaryOp::ShiftBitBranch => shift_branch::execute(cpu),
        PrimaryOp::MoveSpecial => special::execute_special(cpu),
        PrimaryOp::Immediate => special::execute_immediate(cpu),
        PrimaryOp::Load => execute_load(cpu),
        PrimaryOp::Stor => execute_stor(cpu),
        PrimaryOp::Cmpm => execute_cmpm(cpu),
        PrimaryOp::Addm => execute_addm(cpu),
        PrimaryOp::Subm => execute_subm(cpu),
        PrimaryOp::Mpym => execute_mpym(cpu),
        PrimaryOp::Ldx => execute_ldx(cpu),
        PrimaryOp::Br => execute_br(cpu),
        PrimaryOp::Ldb => execute_ldb(cpu),
        PrimaryOp::Stb => execute_stb(cpu),
        PrimaryOp::Ldd => execute_ldd(cpu),
        PrimaryOp::Std => execute_std(cpu),
    }
}

fn execute_load<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let ea = cpu.resolve_word_address(cpu.regs.cir, OperandSize::Word)?;
    let value = cpu.read(ea.class, ea.offset)?;
    cpu.push(value)?;
    cpu.regs.set_condition_from(value);
    Ok(())
}

fn execute_stor<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let ea = cpu.resolve_word_address(cpu.regs.cir, OperandSize::Word)?;
    cpu.adjust_sr(1)?;
    let value = cpu.regs.tos[0];
    cpu.write(ea.class, ea.offset, value)?;
    let _ = cpu.pop()?;
    Ok(())
}

fn execute_cmpm<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let ea = cpu.resolve_word_address(cpu.regs.cir, OperandSize::Word)?;
    let value = cpu.read(ea.class, ea.offset)?;
    cpu.adjust_sr(1)?;
    let top = cpu.pop()?;
    cpu.regs
        .set_condition(ConditionCode::from_compare(top, value));
    Ok(())
}

fn execute_addm<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let ea = cpu.resolve_word_address(cpu.regs.cir, OperandSize::Word)?;
    let value = cpu.read(ea.class, ea.offset)?;
    cpu.adjust_sr(1)?;
    let top = cpu.pop()?;
    let sum = arith::add(top, value);
    cpu.push(sum.value)?;
    cpu.regs.set_status_flag(STATUS_C, sum.carry);
    cpu.regs.set_condition_from(sum.value);
    cpu.overflow(sum.overflow)
}

fn execute_subm<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let ea = cpu.resolve_word_address(cpu.regs.cir, OperandSize::Word)?;
    let value = cpu.read(ea.class, ea.offset)?;
    cpu.adjust_sr(1)?;
    let top = cpu.pop()?;
    let diff = arith::sub(top, value);
    cpu.push(diff.value)?;
    cpu.regs.set_status_flag(STATUS_C, diff.carry);
    cpu.regs.set_condition_from(diff.value);
    cpu.overflow(diff.overflow)
}

fn execute_mpym<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let ea = cpu.resolve_word_address(cpu.regs.cir, OperandSize::Word)?;
    let value = cpu.read(ea.class, ea.offset)?;
    cpu.adjust_sr(1)?;
    let top = cpu.pop()?;
    let product = arith::mul(top, value);
    cpu.push(product.value)?;
    cpu.regs.set_condition_from(product.value);
    cpu.overflow(product.overflow)
}

fn execute_ldx<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let ea = cpu.resolve_word_address(cpu.regs.cir, OperandSize::Word)?;
    let value = cpu.read(ea.class, ea.offset)?;
    cpu.regs.x = value;
    cpu.regs.set_condition_from(value);
    Ok(())
}

fn execute_br<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let target = cpu.resolve_branch_target(cpu.regs.cir)?;
    cpu.branch_to(target)
}

fn execute_ldb<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let ea = cpu.resolve_byte_address(cpu.regs.cir)?;
    let selector = ea.byte.unwrap_or(crate::memory::ByteSelector::Upper);
    let byte = cpu.read_byte(ea.class, ea.offset, selector)?;
    cpu.push(u16::from(byte))?;
    cpu.regs.set_condition_from(u16::from(byte));
    Ok(())
}

fn execute_stb<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let ea = cpu.resolve_byte_address(cpu.regs.cir)?;
    let selector = ea.byte.unwrap_or(crate::memory::ByteSelector::Upper);
    cpu.adjust_sr(1)?;
    let byte = (cpu.regs.tos[0] & 0o377) as u8;
    cpu.write_byte(ea.class, ea.offset, selector, byte)?;
    let _ = cpu.pop()?;
    Ok(())
}

fn execute_ldd<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let ea = cpu.resolve_word_address(cpu.regs.cir, OperandSize::Double)?;
    let high = cpu.read(ea.class, ea.offset)?;
    let low = cpu.read(ea.class, ea.offset.wrapping_add(1))?;
    cpu.push(low)?;
    cpu.push(high)?;
    let double = (u32::from(high) << 16) | u32::from(low);
    cpu.regs.set_condition(ConditionCode::from_double(double));
    Ok(())
}

fn execute_std<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let ea = cpu.resolve_word_address(cpu.regs.cir, OperandSize::Double)?;
    cpu.adjust_sr(2)?;
    let high = cpu.regs.tos[0];
    let low = cpu.regs.tos[1];
    cpu.write(ea.class, ea.offset, high)?;
    cpu.write(ea.class, ea.offset.wrapping_add(1), low)?;
    let _ = cpu.pop()?;
    let _ = cpu.pop()?;
    Ok(())
}

/// Pops a double: high word from the top, then the low word.
pub(crate) fn pop_double<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<u32, Trap> {
    let high = cpu.pop()?;
    let low = cpu.pop()?;
    Ok((u32::from(high) << 16) | u32::from(low))
}

/// Pushes a double: low word first, high word on top.
pub(crate) fn push_double<M: MemoryBus, C: ChannelBus>(
    cpu: &mut Cpu<M, C>,
    value: u32,
) -> Result<(), Trap> {
    cpu.push(value as u16)?;
    cpu.push((value >> 16) as u16)
}

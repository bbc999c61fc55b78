//! Stack-operation group: two packed 6-bit operations per word.
//!
//! An interrupt or trap between the two halves restarts the word; the R
//! status bit records that the left half already committed, so the restart
//! executes only the right half. The left half sets R only after it
//! completes, keeping both halves idempotent under restart.

use super::{arith, pop_double, push_double};
use crate::api::ChannelBus;
use crate::cpu::Cpu;
use crate::fault::Trap;
use crate::memory::MemoryBus;
use crate::opcode::{decode_stack_op, stack_op_left, stack_op_operands, stack_op_right, StackOp};
use crate::state::{ConditionCode, STATUS_C, STATUS_R};

pub(crate) fn execute<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>) -> Result<(), Trap> {
    let word = cpu.regs.cir;
    if cpu.regs.sta & STATUS_R == 0 {
        execute_one(cpu, stack_op_left(word))?;
        cpu.regs.set_status_flag(STATUS_R, true);
    }
    execute_one(cpu, stack_op_right(word))?;
    cpu.regs.set_status_flag(STATUS_R, false);
    Ok(())
}

fn execute_one<M: MemoryBus, C: ChannelBus>(cpu: &mut Cpu<M, C>, code: u8) -> Result<(), Trap> {
    let Some(op) = decode_stack_op(code) else {
        // the floating-point firmware group is not fitted
        return Err(Trap::Unimplemented);
    };
    cpu.adjust_sr(stack_op_operands(op))?;

    match op {
        StackOp::Nop => Ok(()),
        StackOp::Del => {
            let _ = cpu.pop()?;
            Ok(())
        }
        StackOp::Delb => {
            let top = cpu.pop()?;
            let _ = cpu.pop()?;
            cpu.push(top)
        }
        StackOp::Ddel => {
            let _ = cpu.pop()?;
            let _ = cpu.pop()?;
            Ok(())
        }
        StackOp::Zrox => {
            cpu.regs.x = 0;
            Ok(())
        }
        StackOp::Incx => {
            cpu.regs.x = cpu.regs.x.wrapping_add(1);
            cpu.regs.set_condition_from(cpu.regs.x);
            Ok(())
        }
        StackOp::Decx => {
            cpu.regs.x = cpu.regs.x.wrapping_sub(1);
            cpu.regs.set_condition_from(cpu.regs.x);
            Ok(())
        }
        StackOp::Zero => cpu.push(0),
        StackOp::Dzro => {
            cpu.push(0)?;
            cpu.push(0)
        }
        StackOp::Dcmp => {
            let a = pop_double(cpu)?;
            let b = pop_double(cpu)?;
            let cc = if b == a {
                ConditionCode::Equal
            } else if (b as i32) < (a as i32) {
                ConditionCode::Less
            } else {
                ConditionCode::Greater
            };
            cpu.regs.set_condition(cc);
            Ok(())
        }
        StackOp::Dadd => {
            let a = pop_double(cpu)?;
            let b = pop_double(cpu)?;
            let (value, carry, overflow) = arith::add32(b, a);
            push_double(cpu, value)?;
            cpu.regs.set_status_flag(STATUS_C, carry);
            cpu.regs.set_condition(ConditionCode::from_double(value));
            cpu.overflow(overflow)
        }
        StackOp::Dsub => {
            let a = pop_double(cpu)?;
            let b = pop_double(cpu)?;
            let (value, carry, overflow) = arith::sub32(b, a);
            push_double(cpu, value)?;
            cpu.regs.set_status_flag(STATUS_C, carry);
            cpu.regs.set_condition(ConditionCode::from_double(value));
            cpu.overflow(overflow)
        }
        StackOp::Mpyl => {
            let a = cpu.pop()?;
            let b = cpu.pop()?;
            let product = (i32::from(b as i16) * i32::from(a as i16)) as u32;
            push_double(cpu, product)?;
            cpu.regs.set_condition(ConditionCode::from_double(product));
            Ok(())
        }
        StackOp::Divl => {
            let divisor = cpu.pop()?;
            let dividend = pop_double(cpu)?;
            if divisor == 0 {
                push_double(cpu, 0)?;
                return cpu.divide_by_zero();
            }
            match arith::divide(dividend as i32, divisor as i16) {
                Some((quotient, remainder)) => {
                    cpu.push(remainder as u16)?;
                    cpu.push(quotient as u16)?;
                    cpu.regs.set_condition_from(quotient as u16);
                    Ok(())
                }
                None => {
                    push_double(cpu, dividend)?;
                    cpu.overflow(true)
                }
            }
        }
        StackOp::Dneg => {
            let a = pop_double(cpu)?;
            let value = (a as i32).wrapping_neg() as u32;
            push_double(cpu, value)?;
            cpu.regs.set_condition(ConditionCode::from_double(value));
            cpu.overflow(a == 0x8000_0000)
        }
        StackOp::Dxch => {
            let a = pop_double(cpu)?;
            let b = pop_double(cpu)?;
            push_double(cpu, a)?;
            push_double(cpu, b)
        }
        StackOp::Cmp => {
            let a = cpu.pop()?;
            let b = cpu.pop()?;
            cpu.regs.set_condition(ConditionCode::from_compare(b, a));
            Ok(())
        }
        StackOp::Lcmp => {
            let a = cpu.pop()?;
            let b = cpu.pop()?;
            cpu.regs
                .set_condition(ConditionCode::from_logical_compare(b, a));
            Ok(())
        }
        StackOp::Add => binary_arith(cpu, arith::add),
        StackOp::Sub => binary_arith(cpu, arith::sub),
        StackOp::Mpy => {
            let a = cpu.pop()?;
            let b = cpu.pop()?;
            let product = arith::mul(b, a);
            cpu.push(product.value)?;
            cpu.regs.set_condition_from(product.value);
            cpu.overflow(product.overflow)
        }
        StackOp::Div => {
            let divisor = cpu.pop()?;
            let dividend = cpu.pop()?;
            if divisor == 0 {
                cpu.push(0)?;
                return cpu.divide_by_zero();
            }
            match arith::divide(i32::from(dividend as i16), divisor as i16) {
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
        StackOp::Neg => {
            let a = cpu.pop()?;
            let value = a.wrapping_neg();
            cpu.push(value)?;
            cpu.regs.set_condition_from(value);
            cpu.overflow(a == 0o100_000)
        }
        StackOp::Test => {
            cpu.regs.set_condition_from(cpu.regs.tos[0]);
            Ok(())
        }
        StackOp::Dtst => {
            let double = (u32::from(cpu.regs.tos[0]) << 16) | u32::from(cpu.regs.tos[1]);
            cpu.regs.set_condition(ConditionCode::from_double(double));
            Ok(())
        }
        StackOp::Xch => {
            cpu.regs.tos.swap(0, 1);
            Ok(())
        }
        StackOp::Inca => {
            let a = cpu.pop()?;
            let sum = arith::add(a, 1);
            cpu.push(sum.value)?;
            cpu.regs.set_status_flag(STATUS_C, sum.carry);
            cpu.regs.set_condition_from(sum.value);
            cpu.overflow(sum.overflow)
        }
        StackOp::Deca => {
            let a = cpu.pop()?;
            let diff = arith::sub(a, 1);
            cpu.push(diff.value)?;
            cpu.regs.set_status_flag(STATUS_C, diff.carry);
            cpu.regs.set_condition_from(diff.value);
            cpu.overflow(diff.overflow)
        }
        StackOp::Xax => {
            core::mem::swap(&mut cpu.regs.tos[0], &mut cpu.regs.x);
            Ok(())
        }
        StackOp::Adax => {
            // index arithmetic never traps
            let a = cpu.pop()?;
            cpu.regs.x = cpu.regs.x.wrapping_add(a);
            cpu.regs.set_condition_from(cpu.regs.x);
            Ok(())
        }
        StackOp::Adxa => {
            let a = cpu.pop()?;
            let value = a.wrapping_add(cpu.regs.x);
            cpu.push(value)?;
            cpu.regs.set_condition_from(value);
            Ok(())
        }
        StackOp::Zrob => {
            cpu.regs.tos[1] = 0;
            Ok(())
        }
        StackOp::Ldxb => {
            cpu.regs.tos[1] = cpu.regs.x;
            Ok(())
        }
        StackOp::Stax => {
            cpu.regs.x = cpu.pop()?;
            Ok(())
        }
        StackOp::Ldxa => {
            let x = cpu.regs.x;
            cpu.push(x)?;
            cpu.regs.set_condition_from(x);
            Ok(())
        }
        StackOp::Dup => {
            let a = cpu.regs.tos[0];
            cpu.push(a)
        }
        StackOp::Ddup => {
            let high = cpu.regs.tos[0];
            let low = cpu.regs.tos[1];
            cpu.push(low)?;
            cpu.push(high)
        }
        StackOp::Cab => {
            let a = cpu.regs.tos[0];
            let b = cpu.regs.tos[1];
            let c = cpu.regs.tos[2];
            cpu.regs.tos[0] = c;
            cpu.regs.tos[1] = a;
            cpu.regs.tos[2] = b;
            Ok(())
        }
        StackOp::Not => {
            let a = cpu.pop()?;
            let value = !a;
            cpu.push(value)?;
            cpu.regs.set_condition_from(value);
            Ok(())
        }
        StackOp::Or => binary_logic(cpu, |a, b| a | b),
        StackOp::Xor => binary_logic(cpu, |a, b| a ^ b),
        StackOp::And => binary_logic(cpu, |a, b| a & b),
    }
}

fn binary_arith<M: MemoryBus, C: ChannelBus>(
    cpu: &mut Cpu<M, C>,
    op: fn(u16, u16) -> arith::Outcome,
) -> Result<(), Trap> {
    let a = cpu.pop()?;
    let b = cpu.pop()?;
    let outcome = op(b, a);
    cpu.push(outcome.value)?;
    cpu.regs.set_status_flag(STATUS_C, outcome.carry);
    cpu.regs.set_condition_from(outcome.value);
    cpu.overflow(outcome.overflow)
}

fn binary_logic<M: MemoryBus, C: ChannelBus>(
    cpu: &mut Cpu<M, C>,
    op: fn(u16, u16) -> u16,
) -> Result<(), Trap> {
    let a = cpu.pop()?;
    let b = cpu.pop()?;
    let value = op(b, a);
    cpu.push(value)?;
    cpu.regs.set_condition_from(value);
    Ok(())
}

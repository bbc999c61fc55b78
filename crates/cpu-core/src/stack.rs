//! Top-of-stack register cache operations.
//!
//! Up to four stack words live in fast register slots; slot 0 is always the
//! logical top. Renaming is by value copy between slots, which measures
//! faster than rotating an index. The memory-resident stack below SM and
//! the cache together form one logical stack: their concatenation is
//! invariant under any spill/fill sequence that stays in bounds.

use crate::api::ChannelBus;
use crate::cpu::Cpu;
use crate::fault::Trap;
use crate::memory::{AccessClass, MemoryBus};
use crate::state::TOS_SLOTS;

impl<M: MemoryBus, C: ChannelBus> Cpu<M, C> {
    /// Spills the logically-lowest occupied slot to memory at `SM+1`.
    ///
    /// Overflow-checked against the stack limit.
    pub fn queue_down(&mut self) -> Result<(), Trap> {
        if self.regs.sr == 0 {
            return Ok(());
        }
        if u32::from(self.regs.sm) + 1 > u32::from(self.regs.z) {
            return Err(Trap::StackOverflow);
        }
        self.queue_down_unchecked()
    }

    fn queue_down_unchecked(&mut self) -> Result<(), Trap> {
        let value = self.regs.tos[(self.regs.sr - 1) as usize];
        self.regs.sm = self.regs.sm.wrapping_add(1);
        self.regs.sr -= 1;
        self.write(AccessClass::Stack, self.regs.sm, value)
    }

    /// Fills the lowest free slot from memory at `SM`.
    ///
    /// Underflow-checked against the data base in user mode.
    pub fn queue_up(&mut self) -> Result<(), Trap> {
        if self.regs.sr as usize == TOS_SLOTS {
            return Ok(());
        }
        if !self.regs.privileged() && self.regs.sm < self.regs.db {
            return Err(Trap::StackUnderflow);
        }
        self.queue_up_unchecked()
    }

    fn queue_up_unchecked(&mut self) -> Result<(), Trap> {
        let value = self.read(AccessClass::Stack, self.regs.sm)?;
        self.regs.tos[self.regs.sr as usize] = value;
        self.regs.sm = self.regs.sm.wrapping_sub(1);
        self.regs.sr += 1;
        Ok(())
    }

    /// Pushes a value onto the logical top, spilling slot 3 first when the
    /// cache is full.
    pub fn push(&mut self, value: u16) -> Result<(), Trap> {
        if self.regs.sr as usize == TOS_SLOTS {
            self.queue_down()?;
        }
        self.regs.tos.copy_within(0..TOS_SLOTS - 1, 1);
        self.regs.tos[0] = value;
        self.regs.sr += 1;
        Ok(())
    }

    /// Pops the logical top. With an empty cache the memory pointer is
    /// decremented instead, underflow-checked against the data base in
    /// user mode.
    pub fn pop(&mut self) -> Result<u16, Trap> {
        if self.regs.sr == 0 {
            if !self.regs.privileged() && self.regs.sm < self.regs.db {
                return Err(Trap::StackUnderflow);
            }
            let value = self.read(AccessClass::Stack, self.regs.sm)?;
            self.regs.sm = self.regs.sm.wrapping_sub(1);
            return Ok(value);
        }
        let value = self.regs.tos[0];
        self.regs.tos.copy_within(1..TOS_SLOTS, 0);
        self.regs.sr -= 1;
        Ok(value)
    }

    /// Spills the whole cache to memory. Never overflow-checked: the cache
    /// contents already belong to the logical stack.
    pub fn flush(&mut self) -> Result<(), Trap> {
        while self.regs.sr > 0 {
            self.queue_down_unchecked()?;
        }
        Ok(())
    }

    /// Fills the cache until `target` slots are occupied.
    ///
    /// The underflow check runs once at the end, not per word; the fill
    /// itself must not trap between words.
    pub fn adjust_sr(&mut self, target: u16) -> Result<(), Trap> {
        let target = target.min(TOS_SLOTS as u16);
        while self.regs.sr < target {
            self.queue_up_unchecked()?;
        }
        if !self.regs.privileged() && self.regs.sm.wrapping_add(1) < self.regs.db {
            return Err(Trap::StackUnderflow);
        }
        Ok(())
    }

    /// Writes a four-word stack marker (X, return address, status,
    /// delta-frame) at the new top and points Q at it.
    ///
    /// The overflow check precedes every write; `status` is the word the
    /// matching exit will restore.
    pub fn mark_stack(&mut self, return_offset: u16, status: u16) -> Result<(), Trap> {
        self.flush()?;
        if u32::from(self.regs.sm) + 4 > u32::from(self.regs.z) {
            return Err(Trap::StackOverflow);
        }
        let base = self.regs.sm;
        let new_q = base.wrapping_add(4);
        self.write(AccessClass::Stack, base.wrapping_add(1), self.regs.x)?;
        self.write(AccessClass::Stack, base.wrapping_add(2), return_offset)?;
        self.write(AccessClass::Stack, base.wrapping_add(3), status)?;
        self.write(AccessClass::Stack, new_q, new_q.wrapping_sub(self.regs.q))?;
        self.regs.sm = new_q;
        self.regs.q = new_q;
        Ok(())
    }
}

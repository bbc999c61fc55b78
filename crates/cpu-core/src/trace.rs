//! Deterministic trace hooks fired by the dispatch loop.
//!
//! The policy is evaluated once per instruction and yields an immutable
//! scope for that instruction; emitters consult the scope, never the
//! policy, so a widened instruction restores itself by construction.

use crate::fault::{Interrupt, Trap};
use crate::memory::AccessClass;

/// Events emitted in execution order when tracing is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// Instruction about to execute.
    Instruction {
        /// Program bank of the fetch.
        bank: u16,
        /// Word address of the instruction.
        address: u16,
        /// Raw instruction word.
        opcode: u16,
    },
    /// One classified memory access.
    MemoryAccess {
        /// Access classification used.
        class: AccessClass,
        /// Bank the access resolved to.
        bank: u16,
        /// Word offset within the bank.
        address: u16,
        /// Word read or written.
        value: u16,
        /// `true` for writes.
        is_write: bool,
    },
    /// Register summary after an instruction retires.
    Registers {
        /// Address of the next instruction.
        p: u16,
        /// Frame pointer.
        q: u16,
        /// Memory stack pointer.
        sm: u16,
        /// Cached slot count.
        sr: u16,
        /// Index register.
        x: u16,
        /// Status word.
        sta: u16,
    },
    /// A run-mode interrupt was accepted.
    Interrupt {
        /// Serviced class.
        class: Interrupt,
        /// Parameter passed to the handler.
        parameter: u16,
    },
    /// A trap was raised.
    Trap {
        /// Raised trap.
        trap: Trap,
    },
}

/// Sink for trace events, one call per event.
pub trait TraceSink {
    /// Records an event in execution order.
    fn on_event(&mut self, event: TraceEvent);
}

/// Which event families are currently enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TracePolicy {
    /// Emit one event per instruction.
    pub instructions: bool,
    /// Emit one event per classified memory access.
    pub memory: bool,
    /// Emit a register summary after each instruction.
    pub registers: bool,
    /// Emit interrupt and trap events.
    pub control: bool,
    /// When the raw instruction word matches, widen to full tracing for
    /// exactly that instruction.
    pub widen_opcode: Option<u16>,
}

impl TracePolicy {
    /// Policy with every family disabled.
    #[must_use]
    pub const fn off() -> Self {
        Self {
            instructions: false,
            memory: false,
            registers: false,
            control: false,
            widen_opcode: None,
        }
    }

    /// Policy with every family enabled.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            instructions: true,
            memory: true,
            registers: true,
            control: true,
            widen_opcode: None,
        }
    }

    /// `true` when no family can ever emit.
    #[must_use]
    pub const fn is_off(&self) -> bool {
        !self.instructions
            && !self.memory
            && !self.registers
            && !self.control
            && self.widen_opcode.is_none()
    }

    /// Evaluates the policy for one instruction word.
    #[must_use]
    pub fn scope_for(&self, opcode: u16) -> TraceScope {
        if self.widen_opcode == Some(opcode) {
            return TraceScope {
                instructions: true,
                memory: true,
                registers: true,
                control: true,
            };
        }
        TraceScope {
            instructions: self.instructions,
            memory: self.memory,
            registers: self.registers,
            control: self.control,
        }
    }
}

/// Immutable per-instruction trace enablement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceScope {
    /// Instruction events enabled.
    pub instructions: bool,
    /// Memory-access events enabled.
    pub memory: bool,
    /// Register-summary events enabled.
    pub registers: bool,
    /// Interrupt/trap events enabled.
    pub control: bool,
}

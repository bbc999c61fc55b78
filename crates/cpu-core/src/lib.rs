//! CPU execution core for the HP 3000 Series II/III stack machine.
//!
//! The crate models the processor's visible behavior: the fetch-decode-
//! execute loop, the four-slot top-of-stack register cache, segmented
//! virtual memory with bounds checking, and the trap/interrupt dispatcher
//! that performs segment-table-driven procedure linkage for ordinary calls
//! and fault recovery alike. Memory and the channel/device subsystem are
//! external collaborators behind traits; one [`Cpu`] instance owns one
//! register file and advances one instruction-equivalent step at a time.

// Emulator code: intentional truncation and sign casts are pervasive
// (byte extraction, signed/unsigned arithmetic views of the same word).
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

/// Architectural trap and interrupt taxonomies.
pub mod fault;
pub use fault::{
    Interrupt, SystemHalt, Trap, CPX1_CPU_TIMER, CPX1_DISPATCHER_FLAG, CPX1_EXTERNAL,
    CPX1_ICS_FLAG, CPX1_ILLEGAL_ADDRESS, CPX1_SERVICE_MASK, CPX2_DUMP_SWITCH, CPX2_LOAD_SWITCH,
    CPX2_RUN_FLIP_FLOP, CPX2_RUN_SWITCH,
};

/// Architectural CPU state model primitives.
pub mod state;
pub use state::{
    ConditionCode, CpuRegisters, MachineState, RegisterId, STATUS_C, STATUS_CC_MASK, STATUS_I,
    STATUS_M, STATUS_O, STATUS_R, STATUS_SEGMENT_MASK, STATUS_T, TOS_SLOTS,
};

/// Memory collaborator seam and the flat main-memory implementation.
pub mod memory;
pub use memory::{
    AccessClass, BankAddress, ByteSelector, MainMemory, MemoryBus, MemoryFault, BANK_WORDS,
};

/// Deterministic trace hooks.
pub mod trace;
pub use trace::{TraceEvent, TracePolicy, TraceScope, TraceSink};

/// Deterministic instruction-count timer service.
pub mod timer;
pub use timer::{TimerService, DEFAULT_PCLK_INTERVAL};

/// Instruction encoding classification tables.
pub mod opcode;
pub use opcode::{
    pack_immediate, pack_memory_reference, pack_stack_ops, BranchOp, ImmediateOp, PrimaryOp,
    ShiftOp, SpecialOp, StackOp, SPECIAL_OP_TABLE, STACK_OP_TABLE,
};

/// Effective-address resolution.
pub mod addressing;
pub use addressing::{AddressForm, BaseRegister, EffectiveAddress, OperandSize};

/// Segment tables and procedure linkage.
pub mod segment;
pub use segment::{
    external_label, CodeSegmentSetup, COLD_LOAD_OFFSET_CELL, COLD_LOAD_SEGMENT_CELL, CST_POINTER,
    DST_POINTER, ICS_Q_POINTER, ICS_Z_POINTER, INTERRUPT_MASK_CELL, LABEL_UNCALLABLE,
    SEGMENT_ABSENT, SEGMENT_PRIVILEGED, SEGMENT_REFERENCED, SEGMENT_TRACE, SYSTEM_SEGMENT,
};

/// Trap and interrupt dispatch.
pub mod dispatch;
pub use dispatch::{base_disposition, escalate, trap_disposition, TrapDisposition};

/// Host-facing API contracts.
pub mod api;
pub use api::{
    ChannelBus, ChannelProgramKind, CoreConfig, CoreSnapshot, CoreStats, DeviceStatus, IoError,
    SnapshotVersion, StopReason,
};

/// The stack register cache.
mod stack;

/// Instruction executors.
mod execute;

/// The CPU core and dispatch loop.
pub mod cpu;
pub use cpu::Cpu;

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;

//! Architectural CPU state model primitives.

/// Macro-machine execution state.
pub mod machine;
/// Architectural register file and status-word model.
pub mod registers;

pub use machine::MachineState;
pub use registers::{
    ConditionCode, CpuRegisters, RegisterId, STATUS_C, STATUS_CC_MASK, STATUS_CC_SHIFT, STATUS_I,
    STATUS_M, STATUS_O, STATUS_R, STATUS_SEGMENT_MASK, STATUS_T, TOS_SLOTS,
};

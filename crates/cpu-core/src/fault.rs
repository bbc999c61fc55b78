//! Architectural trap and interrupt taxonomies.
//!
//! Traps are synchronous microcode aborts raised by executors and consumed
//! exactly once by the dispatch loop. Run-mode interrupts are latched in the
//! CPX1 register and serviced between instructions, highest bit first.

use thiserror::Error;

/// STT entry in the system segment used for the arithmetic trap group.
pub const ARITHMETIC_TRAP_STT: u8 = 9;

/// Recoverable architectural traps, each mapped to a fixed handler entry in
/// the system segment's transfer table plus a parameter word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Trap {
    /// Address fell outside the bounds of its access classification.
    #[error("bounds violation")]
    BoundsViolation,
    /// Instruction encoding is documented but not implemented by this CPU.
    #[error("unimplemented instruction")]
    Unimplemented,
    /// Instruction encoding is not defined by the architecture.
    #[error("undefined instruction")]
    Undefined,
    /// Segment transfer table index was zero or beyond the table length.
    #[error("segment transfer table violation in segment {segment}")]
    SttViolation {
        /// Code segment whose STT rejected the reference.
        segment: u16,
    },
    /// Code segment table index was invalid for either sub-table.
    #[error("code segment table violation for segment {segment}")]
    CstViolation {
        /// Rejected code segment number.
        segment: u16,
    },
    /// Data segment table index was zero or beyond the table length.
    #[error("data segment table violation")]
    DstViolation,
    /// Stack memory pointer would move below the data base in user mode.
    #[error("stack underflow")]
    StackUnderflow,
    /// User-mode attempt to gain privilege or enable interrupts.
    #[error("privilege violation")]
    PrivilegeViolation,
    /// Stack memory pointer would move above the stack limit.
    #[error("stack overflow")]
    StackOverflow,
    /// Two's-complement result did not fit in the destination width.
    #[error("integer overflow")]
    IntegerOverflow,
    /// Integer division with a zero divisor.
    #[error("integer divide by zero")]
    IntegerDivideByZero,
    /// Referenced data segment is marked absent in the DST.
    #[error("absent data segment {segment}")]
    AbsentDataSegment {
        /// Data segment number found absent.
        segment: u16,
    },
    /// Procedure entry or exit crossed a segment with its trace bit set.
    #[error("trace")]
    Trace,
    /// Local STT entry is uncallable from user mode.
    #[error("uncallable STT entry {label:#o}")]
    SttEntryUncallable {
        /// Offending program label word.
        label: u16,
    },
    /// Referenced code segment is marked absent in the CST.
    #[error("absent code segment for label {label:#o}")]
    AbsentCodeSegment {
        /// Program label that selected the absent segment.
        label: u16,
    },
}

impl Trap {
    /// Fixed STT entry number of this trap's handler in the system segment.
    #[must_use]
    pub const fn stt_entry(self) -> u8 {
        match self {
            Self::BoundsViolation => 1,
            Self::Unimplemented | Self::Undefined => 2,
            Self::SttViolation { .. } => 3,
            Self::CstViolation { .. } => 4,
            Self::DstViolation => 5,
            Self::StackUnderflow => 6,
            Self::PrivilegeViolation => 7,
            Self::StackOverflow => 8,
            Self::IntegerOverflow | Self::IntegerDivideByZero => ARITHMETIC_TRAP_STT,
            Self::AbsentDataSegment { .. } => 10,
            Self::Trace => 11,
            Self::SttEntryUncallable { .. } => 12,
            Self::AbsentCodeSegment { .. } => 13,
        }
    }

    /// Parameter word pushed for the handler before transfer.
    #[must_use]
    pub const fn parameter(self) -> u16 {
        match self {
            Self::BoundsViolation
            | Self::DstViolation
            | Self::StackUnderflow
            | Self::PrivilegeViolation
            | Self::StackOverflow
            | Self::Trace
            | Self::Unimplemented => 0,
            Self::Undefined | Self::IntegerOverflow => 1,
            Self::IntegerDivideByZero => 2,
            Self::SttViolation { segment }
            | Self::CstViolation { segment }
            | Self::AbsentDataSegment { segment } => segment,
            Self::SttEntryUncallable { label } | Self::AbsentCodeSegment { label } => label,
        }
    }

    /// Returns the segment number carried by segment-table traps.
    #[must_use]
    pub const fn segment(self) -> Option<u16> {
        match self {
            Self::SttViolation { segment } | Self::CstViolation { segment } => Some(segment),
            _ => None,
        }
    }
}

/// Unrecoverable system halt reasons; no handler exists for these and the
/// core stays halted until an external reset equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum SystemHalt {
    /// A trap was raised while already executing on the interrupt
    /// control stack.
    TrapOnIcs = 1,
    /// CST violation against the system segment range.
    SystemCstViolation = 2,
    /// STT violation against the system segment range.
    SystemSttViolation = 3,
    /// The handler transfer itself failed (absent or corrupt system segment).
    HandlerFailure = 4,
}

/// CPX1 bit for the power-fail interrupt.
pub const CPX1_POWER_FAIL: u16 = 0o100_000;
/// CPX1 bit for a system parity error.
pub const CPX1_SYSTEM_PARITY: u16 = 0o040_000;
/// CPX1 bit for an address parity error.
pub const CPX1_ADDRESS_PARITY: u16 = 0o020_000;
/// CPX1 bit for a data parity error.
pub const CPX1_DATA_PARITY: u16 = 0o010_000;
/// CPX1 bit for a module interrupt.
pub const CPX1_MODULE: u16 = 0o004_000;
/// CPX1 bit for an external (device) interrupt.
pub const CPX1_EXTERNAL: u16 = 0o002_000;
/// CPX1 bit for the CPU timer interrupt.
pub const CPX1_CPU_TIMER: u16 = 0o001_000;
/// CPX1 bit for a reference to non-installed memory.
pub const CPX1_ILLEGAL_ADDRESS: u16 = 0o000_400;
/// CPX1 state flag set while executing on the interrupt control stack.
pub const CPX1_ICS_FLAG: u16 = 0o000_010;
/// CPX1 state flag owned by the dispatcher firmware.
pub const CPX1_DISPATCHER_FLAG: u16 = 0o000_004;

/// Mask of CPX1 bits that request service (state flags excluded).
pub const CPX1_SERVICE_MASK: u16 = CPX1_POWER_FAIL
    | CPX1_SYSTEM_PARITY
    | CPX1_ADDRESS_PARITY
    | CPX1_DATA_PARITY
    | CPX1_MODULE
    | CPX1_EXTERNAL
    | CPX1_CPU_TIMER
    | CPX1_ILLEGAL_ADDRESS;

/// CPX2 bit for the RUN switch.
pub const CPX2_RUN_SWITCH: u16 = 0o100_000;
/// CPX2 bit for the DUMP switch.
pub const CPX2_DUMP_SWITCH: u16 = 0o040_000;
/// CPX2 bit for the LOAD switch.
pub const CPX2_LOAD_SWITCH: u16 = 0o020_000;
/// CPX2 run flip-flop, set while the macro-machine is executing.
pub const CPX2_RUN_FLIP_FLOP: u16 = 0o000_001;

/// Run-mode interrupt classes, one per serviceable CPX1 bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Interrupt {
    /// Imminent power loss.
    PowerFail,
    /// Parity error on the system bus.
    SystemParity,
    /// Parity error on an address path.
    AddressParity,
    /// Parity error on a data path.
    DataParity,
    /// Inter-module signal; parameter is the MOD register.
    Module,
    /// Device completion; parameter is the acknowledged device number.
    External,
    /// CPU interval timer expiry.
    CpuTimer,
    /// A reference addressed non-installed memory.
    IllegalAddress,
}

impl Interrupt {
    /// All classes in service-priority order (highest CPX1 bit first).
    pub const PRIORITY: [Self; 8] = [
        Self::PowerFail,
        Self::SystemParity,
        Self::AddressParity,
        Self::DataParity,
        Self::Module,
        Self::External,
        Self::CpuTimer,
        Self::IllegalAddress,
    ];

    /// The CPX1 bit latched for this class.
    #[must_use]
    pub const fn cpx1_bit(self) -> u16 {
        match self {
            Self::PowerFail => CPX1_POWER_FAIL,
            Self::SystemParity => CPX1_SYSTEM_PARITY,
            Self::AddressParity => CPX1_ADDRESS_PARITY,
            Self::DataParity => CPX1_DATA_PARITY,
            Self::Module => CPX1_MODULE,
            Self::External => CPX1_EXTERNAL,
            Self::CpuTimer => CPX1_CPU_TIMER,
            Self::IllegalAddress => CPX1_ILLEGAL_ADDRESS,
        }
    }

    /// Selects the highest-priority pending class from a CPX1 image.
    ///
    /// The external interrupt is by far the most common case and is tested
    /// before the priority scan.
    #[must_use]
    pub fn pending(cpx1: u16) -> Option<Self> {
        let pending = cpx1 & CPX1_SERVICE_MASK;
        if pending == CPX1_EXTERNAL {
            return Some(Self::External);
        }
        Self::PRIORITY
            .iter()
            .copied()
            .find(|class| pending & class.cpx1_bit() != 0)
    }

    /// Fixed STT entry number of this class's handler in the system segment.
    #[must_use]
    pub const fn stt_entry(self) -> u8 {
        match self {
            Self::External => 16,
            Self::CpuTimer => 17,
            Self::Module => 18,
            Self::SystemParity => 19,
            Self::AddressParity => 20,
            Self::DataParity => 21,
            Self::PowerFail => 22,
            Self::IllegalAddress => 23,
        }
    }

    /// Whether this class's handler runs on the interrupt control stack.
    #[must_use]
    pub const fn uses_ics(self) -> bool {
        !matches!(self, Self::IllegalAddress)
    }
}

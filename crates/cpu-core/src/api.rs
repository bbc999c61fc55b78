//! Host-facing API contracts for embedding the CPU core.

use crate::fault::Trap;
use crate::memory::{BankAddress, MemoryBus};
use crate::state::{CpuRegisters, MachineState};
use crate::trace::TracePolicy;
use crate::SystemHalt;

/// Top-level configuration for a core instance.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CoreConfig {
    /// Stop with [`StopReason::Undefined`] instead of trapping on an
    /// undefined encoding.
    pub stop_on_undefined: bool,
    /// Stop with [`StopReason::Unimplemented`] instead of trapping on an
    /// unimplemented encoding.
    pub stop_on_unimplemented: bool,
    /// Stop when a branch targets itself with no interrupt able to break in.
    pub stop_on_infinite_loop: bool,
    /// Stop when a pause instruction idles the machine.
    pub stop_on_pause: bool,
    /// Program addresses that stop execution before the instruction runs.
    pub breakpoints: Vec<BankAddress>,
    /// Process-clock interval in instructions.
    pub pclk_interval: u64,
    /// CPU timer interrupt interval in instructions; `None` disables it.
    pub cpu_timer_interval: Option<u64>,
    /// Trace policy evaluated once per instruction.
    pub trace: TracePolicy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            stop_on_undefined: false,
            stop_on_unimplemented: false,
            stop_on_infinite_loop: false,
            stop_on_pause: false,
            breakpoints: Vec::new(),
            pclk_interval: crate::timer::DEFAULT_PCLK_INTERVAL,
            cpu_timer_interval: None,
            trace: TracePolicy::off(),
        }
    }
}

/// Reason a `run` call returned to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum StopReason {
    /// A halt instruction executed, or the machine was already halted with
    /// nothing pending.
    Halt,
    /// Execution reached a configured breakpoint.
    Breakpoint,
    /// Unrecoverable system halt; resuming requires an external reset.
    SystemHalt(SystemHalt),
    /// Undefined encoding with the diagnostic stop enabled.
    Undefined,
    /// Unimplemented encoding with the diagnostic stop enabled.
    Unimplemented,
    /// Self-branch with interrupts unable to break in.
    InfiniteLoop,
    /// Pause instruction with the pause stop enabled.
    Paused,
    /// The instruction budget for this call was exhausted.
    StepLimit,
}

/// Channel program kinds the core can request from the channel collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelProgramKind {
    /// Halt-mode cold-load bootstrap read.
    ColdLoad,
    /// Halt-mode memory dump write.
    ColdDump,
}

/// Device status word returned by `test_device_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceStatus {
    /// Device still executing its channel program.
    pub busy: bool,
    /// Device finished with an error; the protocol retries.
    pub error: bool,
}

/// Transport failure reported by the channel collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoError {
    /// The addressed device does not exist or rejected the program.
    DeviceRejected,
}

/// Channel/device collaborator consumed by the dispatch loop and the
/// halt-mode LOAD/DUMP protocol.
pub trait ChannelBus {
    /// `true` while any device holds an unacknowledged interrupt.
    fn interrupt_pending(&self) -> bool;

    /// Polls and acknowledges the highest-priority device interrupt,
    /// returning its device number.
    fn poll_interrupt(&mut self) -> Option<u16>;

    /// Starts a synthetic channel program on a device.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::DeviceRejected`] when the device cannot accept
    /// the program.
    fn start_channel_program(
        &mut self,
        device: u16,
        kind: ChannelProgramKind,
    ) -> Result<(), IoError>;

    /// Reads the status of a device without side effects.
    fn test_device_status(&mut self, device: u16) -> DeviceStatus;

    /// Clears a device's interrupt request.
    fn reset_device_interrupt(&mut self, device: u16);

    /// Gives pending channel transfers one service slot; called once per
    /// dispatch-loop iteration.
    fn service_requests(&mut self, memory: &mut dyn MemoryBus);
}

/// Saturating diagnostic counters owned by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CoreStats {
    /// Instructions retired.
    pub instructions: u64,
    /// Traps dispatched (including overflow continuations).
    pub traps: u64,
    /// Run-mode interrupts serviced.
    pub interrupts: u64,
    /// Most recent trap observed by the dispatcher.
    pub last_trap: Option<Trap>,
}

impl CoreStats {
    /// Records one dispatched trap.
    pub const fn record_trap(&mut self, trap: Trap) {
        self.traps = self.traps.saturating_add(1);
        self.last_trap = Some(trap);
    }

    /// Records one serviced interrupt.
    pub const fn record_interrupt(&mut self) {
        self.interrupts = self.interrupts.saturating_add(1);
    }

    /// Records one retired instruction.
    pub const fn record_instruction(&mut self) {
        self.instructions = self.instructions.saturating_add(1);
    }
}

/// Stable snapshot schema identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u16)]
pub enum SnapshotVersion {
    /// Initial schema revision.
    V1 = 1,
}

impl SnapshotVersion {
    /// Converts a wire value to a known snapshot version.
    #[must_use]
    pub const fn from_u16(version: u16) -> Option<Self> {
        match version {
            1 => Some(Self::V1),
            _ => None,
        }
    }
}

/// Host-visible state snapshot: the register file plus machine state.
/// Main memory is owned by the collaborator and snapshotted there.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CoreSnapshot {
    /// Snapshot schema version.
    pub version: SnapshotVersion,
    /// Complete register file.
    pub registers: CpuRegisters,
    /// Macro-machine state.
    pub machine_state: MachineState,
}

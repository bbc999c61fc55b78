//! Macro-machine execution state.

/// Execution state of the macro-machine, distinct from the run-mode /
/// halt-mode interrupt domains that key off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum MachineState {
    /// Fetching and executing instructions.
    #[default]
    Running,
    /// Idling on a pause instruction until an interrupt arrives.
    Paused,
    /// Stopped; only halt-mode interrupts are serviced.
    Halted,
}

impl MachineState {
    /// `true` when run-mode interrupts may be serviced.
    #[must_use]
    pub const fn accepts_run_mode(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

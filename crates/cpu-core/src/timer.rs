//! Deterministic timer service for the process clock and CPU timer.
//!
//! Intervals are measured in retired instructions, not wall time, so runs
//! replay identically. Service is coalescing: however many deadlines have
//! passed since the last call are applied in one visit, and the count of
//! instructions since the last process-clock tick is exposed for registers
//! read between ticks.

use crate::fault::CPX1_CPU_TIMER;
use crate::state::CpuRegisters;

/// Default process-clock interval in instructions.
pub const DEFAULT_PCLK_INTERVAL: u64 = 1_000;

/// Instruction-count timer service owned by one core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerService {
    pclk_interval: u64,
    next_pclk: u64,
    cpu_timer_interval: Option<u64>,
    next_cpu_timer: u64,
}

impl TimerService {
    /// Creates a service with the given intervals; `cpu_timer_interval`
    /// of `None` disables the CPU timer interrupt.
    #[must_use]
    pub const fn new(pclk_interval: u64, cpu_timer_interval: Option<u64>) -> Self {
        let pclk = if pclk_interval == 0 {
            DEFAULT_PCLK_INTERVAL
        } else {
            pclk_interval
        };
        let next_cpu_timer = match cpu_timer_interval {
            Some(interval) => interval,
            None => 0,
        };
        Self {
            pclk_interval: pclk,
            next_pclk: pclk,
            cpu_timer_interval,
            next_cpu_timer,
        }
    }

    /// Applies every deadline due at instruction count `now`.
    ///
    /// The process clock increments once per elapsed interval (coalesced in
    /// one visit); the CPU timer latches its CPX1 bit at most once per visit
    /// no matter how many deadlines have passed.
    pub fn service(&mut self, now: u64, regs: &mut CpuRegisters) {
        while now >= self.next_pclk {
            regs.pclk = regs.pclk.wrapping_add(1);
            self.next_pclk += self.pclk_interval;
        }

        if let Some(interval) = self.cpu_timer_interval {
            if now >= self.next_cpu_timer {
                regs.cpx1 |= CPX1_CPU_TIMER;
                while now >= self.next_cpu_timer {
                    self.next_cpu_timer += interval;
                }
            }
        }
    }

    /// Instructions elapsed since the last process-clock tick.
    #[must_use]
    pub const fn elapsed_since_tick(&self, now: u64) -> u64 {
        let since_next = self.pclk_interval.saturating_sub(self.next_pclk.saturating_sub(now));
        since_next % self.pclk_interval
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new(DEFAULT_PCLK_INTERVAL, None)
    }
}

//! The CPU core: owned state, classified memory access, and the
//! fetch-decode-execute dispatch loop.
//!
//! Every may-trap primitive returns `Result<_, Trap>`; the loop is the only
//! place a trap is consumed. An abort therefore unwinds any in-progress
//! instruction from anywhere and resumes at the dispatcher.

use crate::api::{ChannelBus, CoreConfig, CoreSnapshot, CoreStats, SnapshotVersion, StopReason};
use crate::dispatch::ColdLoad;
use crate::execute;
use crate::fault::{Trap, CPX1_EXTERNAL, CPX1_ILLEGAL_ADDRESS, CPX1_SERVICE_MASK};
use crate::memory::{AccessClass, BankAddress, ByteSelector, MemoryBus, MemoryFault};
use crate::state::{CpuRegisters, MachineState, RegisterId};
use crate::timer::TimerService;
use crate::trace::{TraceEvent, TraceScope, TraceSink};

/// One CPU core instance owning its register file and collaborators.
pub struct Cpu<M: MemoryBus, C: ChannelBus> {
    /// Architectural register file, host-inspectable between runs.
    pub regs: CpuRegisters,
    pub(crate) memory: M,
    pub(crate) channel: C,
    pub(crate) config: CoreConfig,
    pub(crate) state: MachineState,
    pub(crate) stats: CoreStats,
    pub(crate) timers: TimerService,
    pub(crate) cold_load: ColdLoad,
    pub(crate) scope: TraceScope,
    sink: Option<Box<dyn TraceSink>>,
    steps: u64,
    pub(crate) xeq_pending: Option<u16>,
    pub(crate) ext_device: u16,
    nir_fault: Option<Trap>,
    breakpoint_bypass: bool,
}

impl<M: MemoryBus, C: ChannelBus> Cpu<M, C> {
    /// Creates a core over its memory and channel collaborators.
    #[must_use]
    pub fn new(memory: M, channel: C, config: CoreConfig) -> Self {
        let timers = TimerService::new(config.pclk_interval, config.cpu_timer_interval);
        Self {
            regs: CpuRegisters::new(),
            memory,
            channel,
            config,
            state: MachineState::Halted,
            stats: CoreStats::default(),
            timers,
            cold_load: ColdLoad::default(),
            scope: TraceScope::default(),
            sink: None,
            steps: 0,
            xeq_pending: None,
            ext_device: 0,
            nir_fault: None,
            breakpoint_bypass: false,
        }
    }

    /// Shared view of the memory collaborator.
    pub const fn memory(&self) -> &M {
        &self.memory
    }

    /// Exclusive view of the memory collaborator.
    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    /// Exclusive view of the channel collaborator.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Shared view of the runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Mutable view of the runtime configuration (breakpoints, diagnostic
    /// stops, trace policy). Timer intervals are sampled at construction.
    pub fn config_mut(&mut self) -> &mut CoreConfig {
        &mut self.config
    }

    /// Diagnostic counters.
    #[must_use]
    pub const fn stats(&self) -> CoreStats {
        self.stats
    }

    /// Current macro-machine state.
    #[must_use]
    pub const fn machine_state(&self) -> MachineState {
        self.state
    }

    /// Forces the macro-machine state between runs.
    pub fn set_machine_state(&mut self, state: MachineState) {
        self.state = state;
    }

    /// Installs (or removes) the trace sink.
    pub fn set_trace_sink(&mut self, sink: Option<Box<dyn TraceSink>>) {
        self.sink = sink;
    }

    /// Instructions elapsed since the last process-clock tick.
    #[must_use]
    pub const fn elapsed_since_tick(&self) -> u64 {
        self.timers.elapsed_since_tick(self.steps)
    }

    /// Reads a register by identifier.
    #[must_use]
    pub fn register(&self, id: RegisterId) -> u16 {
        self.regs.register(id)
    }

    /// Writes a register by identifier.
    pub fn set_register(&mut self, id: RegisterId, value: u16) {
        self.regs.set_register(id, value);
    }

    /// Captures a register-file snapshot.
    #[must_use]
    pub fn snapshot(&self) -> CoreSnapshot {
        CoreSnapshot {
            version: SnapshotVersion::V1,
            registers: self.regs.clone(),
            machine_state: self.state,
        }
    }

    /// Restores a register-file snapshot.
    pub fn restore(&mut self, snapshot: &CoreSnapshot) {
        self.regs = snapshot.registers.clone();
        self.state = snapshot.machine_state;
        self.xeq_pending = None;
        self.nir_fault = None;
    }

    /// Zeroes the register file and halts the machine.
    pub fn reset(&mut self) {
        self.regs = CpuRegisters::new();
        self.state = MachineState::Halted;
        self.xeq_pending = None;
        self.nir_fault = None;
        self.breakpoint_bypass = false;
        self.cold_load = ColdLoad::default();
    }

    pub(crate) fn emit(&mut self, event: TraceEvent) {
        if let Some(sink) = self.sink.as_mut() {
            sink.on_event(event);
        }
    }

    fn cached_slot(&self, class: AccessClass, offset: u16) -> Option<usize> {
        if !class.tos_mapped() || self.regs.sr == 0 {
            return None;
        }
        let top = self.regs.stack_top();
        if offset > self.regs.sm && offset <= top {
            Some((top - offset) as usize)
        } else {
            None
        }
    }

    fn check_bounds(&self, class: AccessClass, offset: u16) -> Result<(), Trap> {
        if class.checked(self.regs.privileged()) {
            if let Some((lo, hi)) = class.bounds(&self.regs) {
                if offset < lo || offset > hi {
                    return Err(Trap::BoundsViolation);
                }
            }
        }
        Ok(())
    }

    /// Classified, bounds-checked word read. Offsets above SM in mapped
    /// classes resolve into the TOS cache.
    pub fn read(&mut self, class: AccessClass, offset: u16) -> Result<u16, Trap> {
        self.check_bounds(class, offset)?;
        let bank = class.bank(&self.regs);
        let value = if let Some(slot) = self.cached_slot(class, offset) {
            self.regs.tos[slot]
        } else {
            match self.memory.read(class, BankAddress::new(bank, offset)) {
                Ok(word) => word,
                Err(MemoryFault::NotInstalled(_)) => {
                    self.regs.cpx1 |= CPX1_ILLEGAL_ADDRESS;
                    0
                }
            }
        };
        if self.scope.memory {
            self.emit(TraceEvent::MemoryAccess {
                class,
                bank,
                address: offset,
                value,
                is_write: false,
            });
        }
        Ok(value)
    }

    /// Classified, bounds-checked word write.
    pub fn write(&mut self, class: AccessClass, offset: u16, value: u16) -> Result<(), Trap> {
        self.check_bounds(class, offset)?;
        let bank = class.bank(&self.regs);
        if let Some(slot) = self.cached_slot(class, offset) {
            self.regs.tos[slot] = value;
        } else if self
            .memory
            .write(class, BankAddress::new(bank, offset), value)
            .is_err()
        {
            self.regs.cpx1 |= CPX1_ILLEGAL_ADDRESS;
        }
        if self.scope.memory {
            self.emit(TraceEvent::MemoryAccess {
                class,
                bank,
                address: offset,
                value,
                is_write: true,
            });
        }
        Ok(())
    }

    /// Classified byte read from a word offset plus selector.
    pub fn read_byte(
        &mut self,
        class: AccessClass,
        offset: u16,
        selector: ByteSelector,
    ) -> Result<u8, Trap> {
        Ok(selector.extract(self.read(class, offset)?))
    }

    /// Classified byte write with read-modify-write of the containing word.
    pub fn write_byte(
        &mut self,
        class: AccessClass,
        offset: u16,
        selector: ByteSelector,
        byte: u8,
    ) -> Result<(), Trap> {
        let word = self.read(class, offset)?;
        self.write(class, offset, selector.insert(word, byte))
    }

    /// Absolute word read (bank 0, unchecked).
    pub fn read_absolute(&mut self, offset: u16) -> Result<u16, Trap> {
        self.read(AccessClass::Absolute, offset)
    }

    /// Absolute word write (bank 0, unchecked).
    pub fn write_absolute(&mut self, offset: u16, value: u16) -> Result<(), Trap> {
        self.write(AccessClass::Absolute, offset, value)
    }

    fn refill_nir(&mut self) {
        match self.read(AccessClass::Fetch, self.regs.p) {
            Ok(word) => {
                self.regs.nir = word;
                self.nir_fault = None;
            }
            Err(trap) => {
                self.regs.nir = 0;
                self.nir_fault = Some(trap);
            }
        }
    }

    /// Redirects execution to `target`, validating fetch bounds and
    /// refilling the prefetch stage.
    pub(crate) fn branch_to(&mut self, target: u16) -> Result<(), Trap> {
        if target < self.regs.pb || target > self.regs.pl {
            return Err(Trap::BoundsViolation);
        }
        self.regs.p = target;
        self.refill_nir();
        self.regs.p = target.wrapping_add(1);
        Ok(())
    }

    /// Installs new program state after a segment transition and redirects
    /// to `target` without a bounds trap (the stale-limit quirk depends on
    /// the subsequent fetch check, not this call).
    pub(crate) fn redirect(&mut self, target: u16) {
        self.regs.p = target;
        self.refill_nir();
        self.regs.p = target.wrapping_add(1);
    }

    fn execute_one(&mut self) -> Result<(), Trap> {
        if let Some(word) = self.xeq_pending.take() {
            self.regs.cir = word;
        } else {
            self.regs.cir = self.regs.nir;
            if let Some(fault) = self.nir_fault.take() {
                self.regs.p = self.regs.p.wrapping_add(1);
                return Err(fault);
            }
            self.refill_nir();
            self.regs.p = self.regs.p.wrapping_add(1);
        }

        self.scope = self.config.trace.scope_for(self.regs.cir);
        if self.scope.instructions {
            self.emit(TraceEvent::Instruction {
                bank: self.regs.pbank,
                address: self.regs.cir_address(),
                opcode: self.regs.cir,
            });
        }

        execute::dispatch(self)?;

        self.stats.record_instruction();
        if self.scope.registers {
            self.emit(TraceEvent::Registers {
                p: self.regs.p,
                q: self.regs.q,
                sm: self.regs.sm,
                sr: self.regs.sr,
                x: self.regs.x,
                sta: self.regs.sta,
            });
        }
        Ok(())
    }

    /// Runs until a stop condition or until `limit` loop iterations have
    /// elapsed, returning the stop reason. Between runs `P` addresses the
    /// next unexecuted instruction.
    pub fn run(&mut self, limit: u64) -> StopReason {
        self.refill_nir();
        self.regs.p = self.regs.p.wrapping_add(1);

        let mut remaining = limit;
        let reason = loop {
            if remaining == 0 {
                break StopReason::StepLimit;
            }
            remaining -= 1;
            self.steps += 1;

            self.timers.service(self.steps, &mut self.regs);
            self.channel.service_requests(&mut self.memory);
            if self.regs.interrupts_enabled() && self.channel.interrupt_pending() {
                if let Some(device) = self.channel.poll_interrupt() {
                    self.ext_device = device;
                    self.regs.cpx1 |= CPX1_EXTERNAL;
                }
            }

            match self.state {
                MachineState::Running => {
                    if self.regs.cpx1 & CPX1_SERVICE_MASK != 0 {
                        match self.service_run_mode_interrupt() {
                            Ok(()) => continue,
                            Err(halt) => break StopReason::SystemHalt(halt),
                        }
                    }

                    if self.xeq_pending.is_none() {
                        let next =
                            BankAddress::new(self.regs.pbank, self.regs.p.wrapping_sub(1));
                        if !self.breakpoint_bypass && self.config.breakpoints.contains(&next) {
                            break StopReason::Breakpoint;
                        }
                    }
                    self.breakpoint_bypass = false;

                    let before = self.regs.p.wrapping_sub(1);
                    let was_xeq = self.xeq_pending.is_some();
                    if let Err(trap) = self.execute_one() {
                        if trap == Trap::Undefined && self.config.stop_on_undefined {
                            break StopReason::Undefined;
                        }
                        if trap == Trap::Unimplemented && self.config.stop_on_unimplemented {
                            break StopReason::Unimplemented;
                        }
                        if let Err(halt) = self.dispatch_trap(trap) {
                            break StopReason::SystemHalt(halt);
                        }
                    }

                    match self.state {
                        MachineState::Halted => break StopReason::Halt,
                        MachineState::Paused if self.config.stop_on_pause => {
                            break StopReason::Paused;
                        }
                        _ => {}
                    }

                    if self.config.stop_on_infinite_loop
                        && self.state == MachineState::Running
                        && !was_xeq
                        && self.xeq_pending.is_none()
                        && self.regs.p.wrapping_sub(1) == before
                        && self.regs.cpx1 & CPX1_SERVICE_MASK == 0
                        && !(self.regs.interrupts_enabled() && self.channel.interrupt_pending())
                    {
                        break StopReason::InfiniteLoop;
                    }
                }
                MachineState::Paused => {
                    if self.regs.cpx1 & CPX1_SERVICE_MASK != 0 {
                        self.state = MachineState::Running;
                        match self.service_run_mode_interrupt() {
                            Ok(()) => {}
                            Err(halt) => break StopReason::SystemHalt(halt),
                        }
                    }
                }
                MachineState::Halted => {
                    if self.halt_mode_pending() {
                        self.service_halt_mode();
                    } else {
                        break StopReason::Halt;
                    }
                }
            }
        };

        // Reconcile clock ticks that came due during the final iterations.
        self.timers.service(self.steps, &mut self.regs);

        let back = match reason {
            StopReason::Paused | StopReason::Undefined | StopReason::Unimplemented => 2,
            _ => 1,
        };
        self.regs.p = self.regs.p.wrapping_sub(back);
        self.breakpoint_bypass = reason == StopReason::Breakpoint;
        reason
    }

    /// Executes at most one instruction-equivalent step.
    pub fn step(&mut self) -> StopReason {
        self.run(1)
    }
}

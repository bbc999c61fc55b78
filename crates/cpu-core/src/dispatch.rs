//! Trap and interrupt dispatch.
//!
//! A raised trap becomes exactly one of: a handler call through the
//! procedure linkage, a continuation with the overflow flag, or an
//! unrecoverable system halt. The mapping is an explicit function chain:
//! a base disposition per class, then an escalation pass. Run-mode
//! interrupts are scanned MSB-first out of CPX1; halt-mode LOAD/DUMP is a
//! small interruptible protocol driven across dispatch-loop iterations.

use crate::api::{ChannelBus, ChannelProgramKind};
use crate::cpu::Cpu;
use crate::fault::{
    Interrupt, SystemHalt, Trap, CPX1_ICS_FLAG, CPX2_DUMP_SWITCH, CPX2_LOAD_SWITCH,
    CPX2_RUN_FLIP_FLOP, CPX2_RUN_SWITCH,
};
use crate::memory::{AccessClass, MemoryBus};
use crate::segment::{
    COLD_LOAD_OFFSET_CELL, COLD_LOAD_SEGMENT_CELL, ICS_Q_POINTER, ICS_Z_POINTER, LABEL_ADDRESS_MASK,
    SYSTEM_SEGMENT,
};
use crate::state::{
    MachineState, STATUS_I, STATUS_M, STATUS_O, STATUS_R, STATUS_SEGMENT_MASK, STATUS_T,
};
use crate::trace::TraceEvent;

/// How the dispatcher resolves one raised trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapDisposition {
    /// Set the overflow flag and resume the interrupted stream.
    ContinueWithOverflow,
    /// Transfer into a handler through the system segment's STT.
    Call {
        /// STT entry of the handler.
        stt_entry: u8,
        /// Parameter word pushed for the handler.
        parameter: u16,
    },
    /// Unrecoverable; halt until external reset.
    Halt(SystemHalt),
}

/// Base disposition per trap class, before escalation.
#[must_use]
pub const fn base_disposition(trap: Trap, traps_enabled: bool) -> TrapDisposition {
    match trap {
        Trap::IntegerOverflow | Trap::IntegerDivideByZero if !traps_enabled => {
            TrapDisposition::ContinueWithOverflow
        }
        _ => TrapDisposition::Call {
            stt_entry: trap.stt_entry(),
            parameter: trap.parameter(),
        },
    }
}

/// Escalation pass over a base disposition.
///
/// Segment-table violations at or below the system segment have no valid
/// handler and halt outright; any other handler call raised while already
/// on the interrupt control stack escalates to the fatal sub-trap.
#[must_use]
pub const fn escalate(base: TrapDisposition, trap: Trap, on_ics: bool) -> TrapDisposition {
    if let Some(segment) = trap.segment() {
        if segment <= SYSTEM_SEGMENT {
            let halt = match trap {
                Trap::CstViolation { .. } => SystemHalt::SystemCstViolation,
                _ => SystemHalt::SystemSttViolation,
            };
            return TrapDisposition::Halt(halt);
        }
    }
    if on_ics && matches!(base, TrapDisposition::Call { .. }) {
        return TrapDisposition::Halt(SystemHalt::TrapOnIcs);
    }
    base
}

/// Composed trap-class to disposition mapping.
#[must_use]
pub const fn trap_disposition(trap: Trap, on_ics: bool, traps_enabled: bool) -> TrapDisposition {
    escalate(base_disposition(trap, traps_enabled), trap, on_ics)
}

/// Phases of the halt-mode LOAD/DUMP protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ColdLoadPhase {
    /// No protocol in progress.
    #[default]
    Idle,
    /// Channel program issued this iteration.
    ProgramStarted,
    /// Polling the device for completion.
    AwaitingCompletion,
}

/// Maximum device retries before the protocol gives up.
const COLD_LOAD_RETRY_LIMIT: u8 = 3;

/// Halt-mode LOAD/DUMP protocol state, polled across loop iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ColdLoad {
    phase: ColdLoadPhase,
    kind: Option<ChannelProgramKind>,
    device: u16,
    retries: u8,
}

impl ColdLoad {
    pub(crate) const fn active(&self) -> bool {
        !matches!(self.phase, ColdLoadPhase::Idle)
    }
}

impl<M: MemoryBus, C: ChannelBus> Cpu<M, C> {
    /// Resolves one raised trap. `Err` carries the system-halt code after
    /// the machine state has already been frozen.
    pub(crate) fn dispatch_trap(&mut self, trap: Trap) -> Result<(), SystemHalt> {
        self.stats.record_trap(trap);
        if self.scope.control {
            self.emit(TraceEvent::Trap { trap });
        }

        let on_ics = self.regs.cpx1 & CPX1_ICS_FLAG != 0;
        match trap_disposition(trap, on_ics, self.regs.traps_enabled()) {
            TrapDisposition::ContinueWithOverflow => {
                self.regs.set_status_flag(STATUS_O, true);
                Ok(())
            }
            TrapDisposition::Call {
                stt_entry,
                parameter,
            } => {
                // restart point: the trapped instruction itself
                let return_offset = self.regs.cir_address().wrapping_sub(self.regs.pb);
                self.invoke_handler(stt_entry, parameter, return_offset)
                    .map_err(|_| self.system_halt(SystemHalt::HandlerFailure))
            }
            TrapDisposition::Halt(halt) => Err(self.system_halt(halt)),
        }
    }

    /// Freezes the machine for an unrecoverable halt.
    pub(crate) fn system_halt(&mut self, halt: SystemHalt) -> SystemHalt {
        self.regs.cpx2 &= !CPX2_RUN_FLIP_FLOP;
        self.state = MachineState::Halted;
        halt
    }

    /// Services the highest-priority pending run-mode interrupt, clearing
    /// its flag before transfer.
    pub(crate) fn service_run_mode_interrupt(&mut self) -> Result<(), SystemHalt> {
        let Some(class) = Interrupt::pending(self.regs.cpx1) else {
            return Ok(());
        };
        let parameter = match class {
            Interrupt::External => self.ext_device,
            Interrupt::Module => self.regs.module,
            _ => 0,
        };
        self.regs.cpx1 &= !class.cpx1_bit();
        self.stats.record_interrupt();
        if self.scope.control {
            self.emit(TraceEvent::Interrupt { class, parameter });
        }

        // an interrupted instruction-execute pending from XEQ restarts at
        // the XEQ itself; otherwise resume at the next unexecuted word
        let resume = if self.xeq_pending.take().is_some() {
            self.regs.cir_address()
        } else {
            self.regs.p.wrapping_sub(1)
        };
        let return_offset = resume.wrapping_sub(self.regs.pb);

        if class.uses_ics()
            && self.regs.cpx1 & CPX1_ICS_FLAG == 0
            && self.transfer_to_ics().is_err()
        {
            return Err(self.system_halt(SystemHalt::HandlerFailure));
        }
        self.invoke_handler(class.stt_entry(), parameter, return_offset)
            .map_err(|_| self.system_halt(SystemHalt::HandlerFailure))
    }

    /// Transfers into a system-segment handler: marker, parameter word,
    /// segment setup, label resolution, redirect.
    pub(crate) fn invoke_handler(
        &mut self,
        stt_entry: u8,
        parameter: u16,
        return_offset: u16,
    ) -> Result<(), Trap> {
        let outgoing_status = self.regs.sta;
        // the transfer itself runs privileged so marker and parameter
        // writes cannot re-trap on user bounds
        self.regs.sta |= STATUS_M;
        self.mark_stack(return_offset, outgoing_status)?;
        self.push(parameter)?;

        let setup = self.setup_code_segment(SYSTEM_SEGMENT)?;
        if setup.absent {
            return Err(Trap::AbsentCodeSegment {
                label: crate::segment::external_label(u16::from(stt_entry), SYSTEM_SEGMENT),
            });
        }
        // handlers enter privileged with interrupts and user traps
        // deferred; they re-enable what they need
        self.regs.sta = (self.regs.sta
            & !(STATUS_SEGMENT_MASK | STATUS_M | STATUS_I | STATUS_T | STATUS_R))
            | setup.status
            | STATUS_M;

        let count = self.read(AccessClass::Program, self.regs.pl)? & 0o377;
        let index = u16::from(stt_entry);
        if index == 0 || index > count {
            return Err(Trap::SttViolation {
                segment: SYSTEM_SEGMENT,
            });
        }
        let label = self.read(AccessClass::Program, self.regs.pl.wrapping_sub(index))?;
        self.branch_to(self.regs.pb.wrapping_add(label & LABEL_ADDRESS_MASK))
    }

    /// Switches onto the interrupt control stack, saving the outgoing
    /// stack registers in the four-word save area above QI.
    pub(crate) fn transfer_to_ics(&mut self) -> Result<(), Trap> {
        self.flush()?;
        let qi = self.read_absolute(ICS_Q_POINTER)?;
        let zi = self.read_absolute(ICS_Z_POINTER)?;
        self.write_absolute(qi.wrapping_add(1), self.regs.sm)?;
        self.write_absolute(qi.wrapping_add(2), self.regs.sbank)?;
        self.write_absolute(qi.wrapping_add(3), self.regs.q)?;
        self.write_absolute(qi.wrapping_add(4), self.regs.z)?;
        self.regs.q = qi;
        self.regs.sm = qi.wrapping_add(4);
        self.regs.z = zi;
        self.regs.sbank = 0;
        self.regs.cpx1 |= CPX1_ICS_FLAG;
        Ok(())
    }

    /// Interrupt exit: restores X and the full status word from the marker
    /// and, when the unwind leaves the interrupt control stack, the saved
    /// user stack registers.
    pub(crate) fn exit_interrupt(&mut self) -> Result<(), Trap> {
        if !self.regs.privileged() {
            return Err(Trap::PrivilegeViolation);
        }
        let q = self.regs.q;
        let delta = self.read(AccessClass::Stack, q)?;
        let saved_status = self.read(AccessClass::Stack, q.wrapping_sub(1))?;
        let return_offset = self.read(AccessClass::Stack, q.wrapping_sub(2))?;
        let saved_x = self.read(AccessClass::Stack, q.wrapping_sub(3))?;

        let new_q = q.wrapping_sub(delta);
        let qi = self.read_absolute(ICS_Q_POINTER)?;
        if self.regs.cpx1 & CPX1_ICS_FLAG != 0 && new_q == qi {
            self.regs.sm = self.read_absolute(qi.wrapping_add(1))?;
            self.regs.sbank = self.read_absolute(qi.wrapping_add(2))?;
            self.regs.q = self.read_absolute(qi.wrapping_add(3))?;
            self.regs.z = self.read_absolute(qi.wrapping_add(4))?;
            self.regs.cpx1 &= !CPX1_ICS_FLAG;
        } else {
            self.regs.sm = q.wrapping_sub(4);
            self.regs.q = new_q;
        }
        self.regs.sr = 0;
        self.regs.x = saved_x;

        let target_segment = saved_status & STATUS_SEGMENT_MASK;
        if target_segment != self.regs.segment() {
            let setup = self.setup_code_segment(target_segment)?;
            if setup.absent {
                return Err(Trap::AbsentCodeSegment {
                    label: crate::segment::external_label(0, target_segment),
                });
            }
        }
        self.regs.sta = saved_status;
        self.branch_to(self.regs.pb.wrapping_add(return_offset))
    }

    pub(crate) fn halt_mode_pending(&self) -> bool {
        self.cold_load.active()
            || self.regs.cpx2 & (CPX2_RUN_SWITCH | CPX2_DUMP_SWITCH | CPX2_LOAD_SWITCH) != 0
    }

    /// Services one halt-mode interrupt slot: RUN resumes execution;
    /// LOAD/DUMP advance their protocol by at most one transition per
    /// dispatch-loop iteration.
    pub(crate) fn service_halt_mode(&mut self) {
        if self.regs.cpx2 & CPX2_RUN_SWITCH != 0 {
            self.regs.cpx2 &= !CPX2_RUN_SWITCH;
            self.regs.cpx2 |= CPX2_RUN_FLIP_FLOP;
            self.state = MachineState::Running;
            return;
        }

        match self.cold_load.phase {
            ColdLoadPhase::Idle => {
                let kind = if self.regs.cpx2 & CPX2_LOAD_SWITCH != 0 {
                    ChannelProgramKind::ColdLoad
                } else if self.regs.cpx2 & CPX2_DUMP_SWITCH != 0 {
                    ChannelProgramKind::ColdDump
                } else {
                    return;
                };
                let device = self.regs.swch & 0o377;
                self.cold_load = ColdLoad {
                    phase: ColdLoadPhase::ProgramStarted,
                    kind: Some(kind),
                    device,
                    retries: 0,
                };
                if self.channel.start_channel_program(device, kind).is_err() {
                    self.cold_load_retry();
                }
            }
            ColdLoadPhase::ProgramStarted => {
                self.cold_load.phase = ColdLoadPhase::AwaitingCompletion;
            }
            ColdLoadPhase::AwaitingCompletion => {
                let device = self.cold_load.device;
                let status = self.channel.test_device_status(device);
                if status.busy {
                    return;
                }
                self.channel.reset_device_interrupt(device);
                if status.error {
                    self.cold_load_retry();
                } else {
                    self.cold_load_finish();
                }
            }
        }
    }

    fn cold_load_retry(&mut self) {
        self.cold_load.retries += 1;
        if self.cold_load.retries > COLD_LOAD_RETRY_LIMIT {
            self.regs.cpx2 &= !(CPX2_LOAD_SWITCH | CPX2_DUMP_SWITCH);
            self.cold_load = ColdLoad::default();
            return;
        }
        let device = self.cold_load.device;
        if let Some(kind) = self.cold_load.kind {
            self.cold_load.phase = ColdLoadPhase::ProgramStarted;
            if self.channel.start_channel_program(device, kind).is_err() {
                self.cold_load_retry();
            }
        }
    }

    fn cold_load_finish(&mut self) {
        let kind = self.cold_load.kind;
        self.regs.cpx2 &= !(CPX2_LOAD_SWITCH | CPX2_DUMP_SWITCH);
        self.cold_load = ColdLoad::default();

        if kind == Some(ChannelProgramKind::ColdLoad) {
            // the bootstrap image published its entry context in the fixed
            // cells; transfer through the CST like any other entry
            let segment = self.read_absolute(COLD_LOAD_SEGMENT_CELL).unwrap_or(0);
            let offset = self.read_absolute(COLD_LOAD_OFFSET_CELL).unwrap_or(0);
            match self.setup_code_segment(segment) {
                Ok(setup) if !setup.absent => {
                    self.regs.sta = STATUS_M | setup.status;
                    self.redirect(self.regs.pb.wrapping_add(offset));
                    self.regs.cpx2 |= CPX2_RUN_FLIP_FLOP;
                    self.state = MachineState::Running;
                }
                _ => {
                    // no runnable image; stay halted
                }
            }
        }
    }
}

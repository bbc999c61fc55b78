//! Dispatch-loop conformance: trap escalation, interrupt service through
//! the interrupt control stack, halt-mode LOAD/DUMP, diagnostic stops, and
//! resumption-point rules.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use hp3000_cpu::{
    external_label, pack_immediate, pack_memory_reference, pack_stack_ops, BankAddress,
    ChannelBus, ChannelProgramKind, CoreConfig, Cpu, DeviceStatus, IoError, MachineState,
    MainMemory, MemoryBus, StopReason, SystemHalt, TraceEvent, TracePolicy, TraceSink,
    CPX1_ICS_FLAG, CPX2_LOAD_SWITCH, CPX2_RUN_FLIP_FLOP, SEGMENT_ABSENT, SEGMENT_PRIVILEGED,
    STATUS_I, STATUS_M, STATUS_O, STATUS_T,
};
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

/// Channel collaborator with scripted interrupts and device statuses.
#[derive(Debug, Default)]
struct ScriptedChannel {
    pending: VecDeque<u16>,
    statuses: VecDeque<DeviceStatus>,
    started: Vec<(u16, ChannelProgramKind)>,
    resets: Vec<u16>,
    reject_start: bool,
}

impl ChannelBus for ScriptedChannel {
    fn interrupt_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn poll_interrupt(&mut self) -> Option<u16> {
        self.pending.pop_front()
    }

    fn start_channel_program(
        &mut self,
        device: u16,
        kind: ChannelProgramKind,
    ) -> Result<(), IoError> {
        if self.reject_start {
            return Err(IoError::DeviceRejected);
        }
        self.started.push((device, kind));
        Ok(())
    }

    fn test_device_status(&mut self, _device: u16) -> DeviceStatus {
        self.statuses.pop_front().unwrap_or_default()
    }

    fn reset_device_interrupt(&mut self, device: u16) {
        self.resets.push(device);
    }

    fn service_requests(&mut self, _memory: &mut dyn MemoryBus) {}
}

#[derive(Clone, Default)]
struct RecordingSink {
    events: Rc<RefCell<Vec<TraceEvent>>>,
}

impl TraceSink for RecordingSink {
    fn on_event(&mut self, event: TraceEvent) {
        self.events.borrow_mut().push(event);
    }
}

const CST_BASE: u16 = 0o400;
const DST_BASE: u16 = 0o600;
const SYS_PB: u16 = 0o2000;
const SYS_PL: u16 = 0o2377;
const USER_PB: u16 = 0o3000;
const USER_PL: u16 = 0o3177;
const DL: u16 = 0o7000;
const DB: u16 = 0o7100;
const Z: u16 = 0o12000;
const QI: u16 = 0o14000;
const ZI: u16 = 0o14400;

const USER_SEGMENT: u16 = 2;
const ENTRY: u16 = USER_PB + 0o50;

const NOP_PAIR: u16 = pack_stack_ops(0, 0);
const HALT: u16 = (0o02 << 12) | (0o21 << 6);
const PAUS: u16 = (0o02 << 12) | (0o20 << 6);
const IXIT: u16 = (0o02 << 12) | (0o26 << 6);
const UNDEFINED_IMMEDIATE: u16 = (0o03 << 12) | (0o17 << 8);
const FLOAT_GROUP_STACKOP: u16 = pack_stack_ops(0o52, 0);

/// Program address of the system handler installed for an STT entry.
const fn handler_address(stt_entry: u16) -> u16 {
    SYS_PB + 0o200 + stt_entry
}

fn fixture(channel: ScriptedChannel) -> Cpu<MainMemory, ScriptedChannel> {
    let mut memory = MainMemory::with_banks(1);
    let load = |memory: &mut MainMemory, offset: u16, words: &[u16]| {
        memory.load(BankAddress::new(0, offset), words);
    };

    load(&mut memory, 0o1, &[CST_BASE]);
    load(&mut memory, 0o2, &[DST_BASE]);
    load(&mut memory, 0o5, &[QI]);
    load(&mut memory, 0o6, &[ZI]);

    load(&mut memory, CST_BASE, &[3]);
    load(
        &mut memory,
        CST_BASE + 4,
        &[SEGMENT_PRIVILEGED, SYS_PL, 0, SYS_PB],
    );
    load(&mut memory, CST_BASE + 8, &[0, USER_PL, 0, USER_PB]);
    load(
        &mut memory,
        CST_BASE + 12,
        &[SEGMENT_ABSENT, 0o52_525, 0, 0o4000],
    );

    // system STT: 24 entries, each to its own one-instruction handler
    load(&mut memory, SYS_PL, &[24]);
    for entry in 1..=24 {
        load(&mut memory, SYS_PL - entry, &[0o200 + entry]);
        load(&mut memory, handler_address(entry), &[HALT]);
    }
    // the external-interrupt handler returns instead of halting
    load(&mut memory, handler_address(16), &[IXIT]);

    // user STT: externals used by the escalation tests
    load(&mut memory, USER_PL, &[2]);
    load(&mut memory, USER_PL - 1, &[external_label(1, 0)]);
    load(&mut memory, USER_PL - 2, &[external_label(1, 0o77)]);

    let mut cpu = Cpu::new(memory, channel, CoreConfig::default());
    cpu.regs.sta = USER_SEGMENT;
    cpu.regs.pb = USER_PB;
    cpu.regs.pl = USER_PL;
    cpu.regs.p = ENTRY;
    cpu.regs.dl = DL;
    cpu.regs.db = DB;
    cpu.regs.q = DB;
    cpu.regs.sm = DB;
    cpu.regs.z = Z;
    cpu.set_machine_state(MachineState::Running);
    cpu
}

fn program(cpu: &mut Cpu<MainMemory, ScriptedChannel>, words: &[u16]) {
    cpu.memory_mut().load(BankAddress::new(0, ENTRY), words);
}

#[test]
fn suppressed_overflow_continues_with_the_flag_set() {
    let mut cpu = fixture(ScriptedChannel::default());
    cpu.memory_mut()
        .load(BankAddress::new(0, DB + 5), &[0o077_777]);
    program(
        &mut cpu,
        &[
            pack_memory_reference(0o04, false, false, 0o1000 | 5), // LOAD DB+5
            pack_immediate(0o03, 1),                               // ADDI 1
        ],
    );

    assert_eq!(cpu.run(2), StopReason::StepLimit);
    assert_eq!(cpu.regs.tos[0], 0o100_000, "result commits before the trap");
    assert_ne!(cpu.regs.sta & STATUS_O, 0);
    assert_eq!(cpu.stats().traps, 0, "no dispatch without the T bit");
}

#[test]
fn enabled_overflow_reaches_the_arithmetic_handler() {
    let mut cpu = fixture(ScriptedChannel::default());
    cpu.regs.sta |= STATUS_T;
    cpu.memory_mut()
        .load(BankAddress::new(0, DB + 5), &[0o077_777]);
    program(
        &mut cpu,
        &[
            pack_memory_reference(0o04, false, false, 0o1000 | 5),
            pack_immediate(0o03, 1),
        ],
    );

    assert_eq!(cpu.run(8), StopReason::Halt);
    assert_eq!(cpu.regs.p, handler_address(9) + 1);
    assert_eq!(cpu.regs.tos[0], 1, "overflow parameter for the handler");
    assert_eq!(cpu.stats().traps, 1);
}

#[test]
fn cst_violation_below_the_system_segment_halts() {
    let mut cpu = fixture(ScriptedChannel::default());
    program(&mut cpu, &[pack_immediate(0o12, 1)]); // PCAL via STT 1 -> segment 0

    assert_eq!(
        cpu.run(4),
        StopReason::SystemHalt(SystemHalt::SystemCstViolation)
    );
    assert_eq!(cpu.machine_state(), MachineState::Halted);
    assert_eq!(cpu.regs.cpx2 & CPX2_RUN_FLIP_FLOP, 0);
}

#[test]
fn cst_violation_above_the_system_segment_calls_the_handler() {
    let mut cpu = fixture(ScriptedChannel::default());
    program(&mut cpu, &[pack_immediate(0o12, 2)]); // PCAL via STT 2 -> segment 0o77

    assert_eq!(cpu.run(8), StopReason::Halt);
    assert_eq!(cpu.regs.p, handler_address(4) + 1);
    assert_eq!(cpu.regs.tos[0], 0o77, "violating segment as parameter");
}

#[test]
fn stt_violation_against_the_system_segment_halts() {
    let mut cpu = fixture(ScriptedChannel::default());
    cpu.memory_mut()
        .load(BankAddress::new(0, USER_PL - 1), &[external_label(0o77, 1)]);
    program(&mut cpu, &[pack_immediate(0o12, 1)]);

    assert_eq!(
        cpu.run(4),
        StopReason::SystemHalt(SystemHalt::SystemSttViolation)
    );
}

#[test]
fn any_trap_on_the_ics_escalates_to_system_halt() {
    let mut cpu = fixture(ScriptedChannel::default());
    cpu.regs.cpx1 |= CPX1_ICS_FLAG;
    program(&mut cpu, &[FLOAT_GROUP_STACKOP]);

    assert_eq!(cpu.run(4), StopReason::SystemHalt(SystemHalt::TrapOnIcs));
}

#[test]
fn external_interrupt_services_on_the_ics_and_returns() {
    let channel = ScriptedChannel {
        pending: VecDeque::from([7]),
        ..ScriptedChannel::default()
    };
    let mut cpu = fixture(channel);
    cpu.regs.sta |= STATUS_I;
    program(&mut cpu, &[NOP_PAIR, NOP_PAIR, NOP_PAIR]);

    assert_eq!(cpu.run(6), StopReason::StepLimit);
    assert_eq!(cpu.stats().interrupts, 1);
    assert_eq!(
        cpu.regs.cpx1 & CPX1_ICS_FLAG,
        0,
        "interrupt exit left the ICS"
    );
    assert_eq!(cpu.regs.sta & STATUS_I, STATUS_I, "status restored");
    assert_eq!(cpu.regs.q, DB, "user frame restored");
    assert_eq!(cpu.regs.pb, USER_PB, "user segment restored");
    assert!(cpu.stats().instructions >= 3, "interrupted stream resumed");
}

#[test]
fn cold_load_retries_then_transfers_into_the_loaded_image() {
    let channel = ScriptedChannel {
        statuses: VecDeque::from([
            DeviceStatus {
                busy: true,
                error: false,
            },
            DeviceStatus {
                busy: false,
                error: true,
            },
            DeviceStatus {
                busy: false,
                error: false,
            },
        ]),
        ..ScriptedChannel::default()
    };
    let mut cpu = fixture(channel);
    cpu.set_machine_state(MachineState::Halted);
    cpu.regs.swch = 3;
    cpu.regs.cpx2 |= CPX2_LOAD_SWITCH;

    // the bootstrap image publishes its entry point in the fixed cells
    let entry = ENTRY + 0o10;
    cpu.memory_mut()
        .load(BankAddress::new(0, 0o10), &[USER_SEGMENT]);
    cpu.memory_mut()
        .load(BankAddress::new(0, 0o11), &[entry - USER_PB]);
    cpu.memory_mut()
        .load(BankAddress::new(0, entry), &[HALT]);

    assert_eq!(cpu.run(20), StopReason::Halt);
    assert_eq!(
        cpu.channel_mut().started,
        vec![(3, ChannelProgramKind::ColdLoad), (3, ChannelProgramKind::ColdLoad)],
        "one retry after the device error"
    );
    assert_eq!(cpu.regs.p, entry + 1, "halted inside the loaded image");
    assert_ne!(cpu.regs.sta & STATUS_M, 0, "cold load enters privileged");
    assert_eq!(cpu.stats().instructions, 1);
}

#[test]
fn cold_load_gives_up_after_the_retry_limit() {
    let channel = ScriptedChannel {
        reject_start: true,
        ..ScriptedChannel::default()
    };
    let mut cpu = fixture(channel);
    cpu.set_machine_state(MachineState::Halted);
    cpu.regs.cpx2 |= CPX2_LOAD_SWITCH;

    assert_eq!(cpu.run(20), StopReason::Halt);
    assert_eq!(cpu.regs.cpx2 & CPX2_LOAD_SWITCH, 0, "switch cleared");
    assert_eq!(cpu.machine_state(), MachineState::Halted);
}

#[test]
fn breakpoints_stop_before_the_instruction_and_resume_past_it() {
    let mut cpu = fixture(ScriptedChannel::default());
    cpu.config_mut().breakpoints = vec![BankAddress::new(0, ENTRY + 1)];
    program(&mut cpu, &[NOP_PAIR, NOP_PAIR, NOP_PAIR]);

    assert_eq!(cpu.run(10), StopReason::Breakpoint);
    assert_eq!(cpu.regs.p, ENTRY + 1);
    assert_eq!(cpu.stats().instructions, 1);

    assert_eq!(cpu.run(2), StopReason::StepLimit);
    assert!(cpu.stats().instructions > 1, "bypass resumed past the stop");
}

#[test]
fn self_branch_with_no_interrupt_possible_stops_as_infinite_loop() {
    let mut cpu = fixture(ScriptedChannel::default());
    cpu.config_mut().stop_on_infinite_loop = true;
    program(
        &mut cpu,
        &[pack_memory_reference(0o13, false, false, 0)], // BR P+0
    );

    assert_eq!(cpu.run(10), StopReason::InfiniteLoop);
    assert_eq!(cpu.regs.p, ENTRY);
}

#[test]
fn diagnostic_stops_replace_the_matching_traps_when_enabled() {
    let mut cpu = fixture(ScriptedChannel::default());
    cpu.config_mut().stop_on_undefined = true;
    cpu.config_mut().stop_on_unimplemented = true;
    program(&mut cpu, &[UNDEFINED_IMMEDIATE]);
    assert_eq!(cpu.run(4), StopReason::Undefined);
    assert_eq!(cpu.regs.p, ENTRY, "rewound to the offending word");

    program(&mut cpu, &[FLOAT_GROUP_STACKOP]);
    cpu.regs.p = ENTRY;
    assert_eq!(cpu.run(4), StopReason::Unimplemented);
    assert_eq!(cpu.regs.p, ENTRY);
}

#[test]
fn disabled_diagnostic_stops_fall_back_to_the_trap() {
    let mut cpu = fixture(ScriptedChannel::default());
    program(&mut cpu, &[UNDEFINED_IMMEDIATE]);

    assert_eq!(cpu.run(8), StopReason::Halt);
    assert_eq!(cpu.regs.p, handler_address(2) + 1);
    assert_eq!(cpu.regs.tos[0], 1, "undefined-encoding parameter");
}

#[test]
fn pause_rewinds_to_the_pause_instruction_when_stopping() {
    let mut cpu = fixture(ScriptedChannel::default());
    cpu.config_mut().stop_on_pause = true;
    cpu.regs.sta |= STATUS_M;
    program(&mut cpu, &[PAUS]);

    assert_eq!(cpu.run(4), StopReason::Paused);
    assert_eq!(cpu.machine_state(), MachineState::Paused);
    assert_eq!(cpu.regs.p, ENTRY, "resume re-executes the pause");
}

#[test]
fn idling_pause_keeps_the_resumption_point_after_it() {
    let mut cpu = fixture(ScriptedChannel::default());
    cpu.regs.sta |= STATUS_M;
    program(&mut cpu, &[PAUS, NOP_PAIR]);

    assert_eq!(cpu.run(5), StopReason::StepLimit);
    assert_eq!(cpu.machine_state(), MachineState::Paused);
    assert_eq!(cpu.regs.p, ENTRY + 1, "interrupt return continues after it");
}

#[test]
fn setr_reserved_bit_consumes_a_word_without_loading() {
    let mut cpu = fixture(ScriptedChannel::default());
    program(
        &mut cpu,
        &[
            pack_immediate(0o00, 0o42), // LDI 0o42 (consumed by the quirk)
            pack_immediate(0o00, 0o77), // LDI 0o77 (destined for X)
            pack_immediate(0o11, 0o204), // SETR X | reserved
        ],
    );

    assert_eq!(cpu.run(3), StopReason::StepLimit);
    assert_eq!(cpu.regs.x, 0o77);
    assert_eq!(cpu.regs.sr, 0, "both words consumed");
    assert_eq!(cpu.regs.sm, DB);
}

#[test]
fn xeq_executes_a_stack_resident_word_in_place() {
    let mut cpu = fixture(ScriptedChannel::default());
    cpu.memory_mut()
        .load(BankAddress::new(0, DB + 6), &[pack_immediate(0o00, 0o33)]);
    program(
        &mut cpu,
        &[
            pack_memory_reference(0o04, false, false, 0o1000 | 6), // LOAD DB+6
            pack_immediate(0o16, 0),                               // XEQ S-0
        ],
    );

    assert_eq!(cpu.run(3), StopReason::StepLimit);
    assert_eq!(cpu.regs.tos[0], 0o33, "executed word pushed its operand");
    assert_eq!(cpu.stats().instructions, 3);
}

#[test]
fn trace_policy_widens_for_exactly_the_matched_instruction() {
    let mut cpu = fixture(ScriptedChannel::default());
    let sink = RecordingSink::default();
    let events = Rc::clone(&sink.events);
    cpu.set_trace_sink(Some(Box::new(sink)));
    cpu.config_mut().trace = TracePolicy {
        widen_opcode: Some(pack_immediate(0o00, 0o5)),
        ..TracePolicy::off()
    };
    program(
        &mut cpu,
        &[NOP_PAIR, pack_immediate(0o00, 0o5), NOP_PAIR],
    );

    assert_eq!(cpu.run(3), StopReason::StepLimit);
    let events = events.borrow();
    let instructions = events
        .iter()
        .filter(|event| matches!(event, TraceEvent::Instruction { .. }))
        .count();
    let registers = events
        .iter()
        .filter(|event| matches!(event, TraceEvent::Registers { .. }))
        .count();
    assert_eq!(instructions, 1, "only the matched instruction traced");
    assert_eq!(registers, 1);
}

#[test]
fn instruction_tracing_covers_every_retirement() {
    let mut cpu = fixture(ScriptedChannel::default());
    let sink = RecordingSink::default();
    let events = Rc::clone(&sink.events);
    cpu.set_trace_sink(Some(Box::new(sink)));
    cpu.config_mut().trace = TracePolicy {
        instructions: true,
        ..TracePolicy::off()
    };
    program(&mut cpu, &[NOP_PAIR, NOP_PAIR]);

    assert_eq!(cpu.run(2), StopReason::StepLimit);
    let events = events.borrow();
    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|event| matches!(event, TraceEvent::Instruction { .. })));
}

//! Stack register cache conformance: conservation, renamer equivalence,
//! and the documented spill/flush ordering.

use hp3000_cpu::{
    AccessClass, BankAddress, ChannelBus, ChannelProgramKind, CoreConfig, Cpu, DeviceStatus,
    IoError, MainMemory, MemoryBus, Trap, STATUS_M,
};
use proptest::prelude::*;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

#[derive(Debug, Default)]
struct NullChannel;

impl ChannelBus for NullChannel {
    fn interrupt_pending(&self) -> bool {
        false
    }

    fn poll_interrupt(&mut self) -> Option<u16> {
        None
    }

    fn start_channel_program(
        &mut self,
        _device: u16,
        _kind: ChannelProgramKind,
    ) -> Result<(), IoError> {
        Ok(())
    }

    fn test_device_status(&mut self, _device: u16) -> DeviceStatus {
        DeviceStatus::default()
    }

    fn reset_device_interrupt(&mut self, _device: u16) {}

    fn service_requests(&mut self, _memory: &mut dyn MemoryBus) {}
}

const DL: u16 = 0o1000;
const DB: u16 = 0o1100;
const Z: u16 = 0o3000;

fn cpu() -> Cpu<MainMemory, NullChannel> {
    let mut cpu = Cpu::new(
        MainMemory::with_banks(1),
        NullChannel,
        CoreConfig::default(),
    );
    cpu.regs.dl = DL;
    cpu.regs.db = DB;
    cpu.regs.sm = DB;
    cpu.regs.q = DB;
    cpu.regs.z = Z;
    cpu
}

fn memory_word(cpu: &mut Cpu<MainMemory, NullChannel>, offset: u16) -> u16 {
    cpu.memory_mut()
        .read(AccessClass::Stack, BankAddress::new(0, offset))
        .expect("installed")
}

/// Logical stack, top first: cache slots then memory words down to DB.
fn logical_stack(cpu: &mut Cpu<MainMemory, NullChannel>) -> Vec<u16> {
    let mut words = Vec::new();
    for slot in 0..cpu.regs.sr {
        words.push(cpu.regs.tos[slot as usize]);
    }
    let mut offset = cpu.regs.sm;
    while offset > DB {
        words.push(memory_word(cpu, offset));
        offset -= 1;
    }
    words
}

#[test]
fn concrete_spill_and_flush_scenario() {
    let mut cpu = cpu();
    let (a, b, c) = (0o101, 0o102, 0o103);
    cpu.push(a).expect("room");
    cpu.push(b).expect("room");
    cpu.push(c).expect("room");
    assert_eq!(cpu.regs.tos[0], c, "top");
    assert_eq!(cpu.regs.tos[1], b, "next");
    assert_eq!(cpu.regs.tos[2], a, "next");

    cpu.push(0o104).expect("room");
    cpu.push(0o105).expect("spill");
    // the oldest cached value went to the first free memory slot
    assert_eq!(memory_word(&mut cpu, DB + 1), a);

    cpu.flush().expect("in bounds");
    assert_eq!(cpu.regs.sr, 0);
    // remaining values follow at consecutive ascending addresses,
    // oldest to newest
    assert_eq!(memory_word(&mut cpu, DB + 2), b);
    assert_eq!(memory_word(&mut cpu, DB + 3), c);
    assert_eq!(memory_word(&mut cpu, DB + 4), 0o104);
    assert_eq!(memory_word(&mut cpu, DB + 5), 0o105);
}

#[test]
fn underflow_is_a_user_mode_trap_only() {
    let mut cpu = cpu();
    assert_eq!(cpu.pop(), Err(Trap::StackUnderflow));
    cpu.regs.set_status_flag(STATUS_M, true);
    assert!(cpu.pop().is_ok());
}

/// Reference renamer that rotates a physical index instead of copying
/// values between slots.
#[derive(Debug, Default)]
struct RotatingRenamer {
    slots: [u16; 4],
    top: usize,
    count: usize,
}

impl RotatingRenamer {
    fn push(&mut self, value: u16) {
        self.top = (self.top + 3) % 4;
        self.slots[self.top] = value;
        self.count += 1;
    }

    fn pop(&mut self) -> u16 {
        let value = self.slots[self.top];
        self.top = (self.top + 1) % 4;
        self.count -= 1;
        value
    }

    fn logical(&self, index: usize) -> u16 {
        self.slots[(self.top + index) % 4]
    }
}

#[derive(Debug, Clone, Copy)]
enum CacheOp {
    Push(u16),
    Pop,
}

fn cache_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        any::<u16>().prop_map(CacheOp::Push),
        Just(CacheOp::Pop),
    ]
}

proptest! {
    /// Starting from any resident count, a scripted push/pop sequence
    /// leaves the value-copying cache identical to the rotating-index
    /// reference model.
    #[test]
    fn renamer_equivalence(seed in 0u16..=4, ops in prop::collection::vec(cache_op(), 0..48)) {
        let mut cpu = cpu();
        let mut reference = RotatingRenamer::default();
        for value in 0..seed {
            cpu.push(0o7000 + value).expect("room");
            reference.push(0o7000 + value);
        }

        for op in ops {
            match op {
                CacheOp::Push(value) => {
                    // stay inside the cache so the reference model never
                    // needs a memory stack
                    if reference.count < 4 {
                        cpu.push(value).expect("room");
                        reference.push(value);
                    }
                }
                CacheOp::Pop => {
                    if reference.count > 0 {
                        let expected = reference.pop();
                        prop_assert_eq!(cpu.pop(), Ok(expected));
                    }
                }
            }
        }

        prop_assert_eq!(cpu.regs.sr as usize, reference.count);
        for index in 0..reference.count {
            prop_assert_eq!(cpu.regs.tos[index], reference.logical(index));
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StackOp {
    Push(u16),
    Pop,
    QueueUp,
    QueueDown,
}

fn stack_op() -> impl Strategy<Value = StackOp> {
    prop_oneof![
        any::<u16>().prop_map(StackOp::Push),
        Just(StackOp::Pop),
        Just(StackOp::QueueUp),
        Just(StackOp::QueueDown),
    ]
}

proptest! {
    /// For any in-bounds traffic, the concatenation of cache and
    /// memory-resident stack is exactly the sequence a plain Vec would
    /// hold, and `flush` preserves it while emptying the cache.
    #[test]
    fn conservation_under_mixed_traffic(ops in prop::collection::vec(stack_op(), 0..64)) {
        let mut cpu = cpu();
        let mut model: Vec<u16> = Vec::new();

        for op in ops {
            let resident = usize::from(cpu.regs.sm - DB);
            let cached = usize::from(cpu.regs.sr);
            match op {
                StackOp::Push(value) => {
                    if model.len() < usize::from(Z - DB) - 8 {
                        cpu.push(value).expect("bounded");
                        model.push(value);
                    }
                }
                StackOp::Pop => {
                    if let Some(expected) = model.pop() {
                        prop_assert_eq!(cpu.pop(), Ok(expected));
                    }
                }
                StackOp::QueueUp => {
                    if cached < 4 && resident > 0 {
                        cpu.queue_up().expect("resident word");
                    }
                }
                StackOp::QueueDown => {
                    if cached > 0 {
                        cpu.queue_down().expect("bounded");
                    }
                }
            }
        }

        let mut expected = model.clone();
        expected.reverse();
        prop_assert_eq!(logical_stack(&mut cpu), expected.clone());

        cpu.flush().expect("bounded");
        prop_assert_eq!(cpu.regs.sr, 0);
        prop_assert_eq!(logical_stack(&mut cpu), expected);
    }
}

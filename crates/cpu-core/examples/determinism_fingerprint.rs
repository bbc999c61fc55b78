//! Deterministic replay fingerprint generator used for cross-host
//! comparison: two runs of the same image must print the same hash.

use hp3000_cpu::{
    pack_immediate, pack_stack_ops, BankAddress, ChannelBus, ChannelProgramKind, CoreConfig, Cpu,
    DeviceStatus, IoError, MachineState, MainMemory, MemoryBus, RegisterId,
};
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

#[derive(Default)]
struct NoopChannel;

impl ChannelBus for NoopChannel {
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

fn hash_word(hash: &mut u64, word: u16) {
    for byte in word.to_be_bytes() {
        *hash ^= u64::from(byte);
        *hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
}

fn fingerprint() -> u64 {
    let mut cpu = Cpu::new(MainMemory::with_banks(1), NoopChannel, CoreConfig::default());
    cpu.regs.pb = 0o1000;
    cpu.regs.pl = 0o1777;
    cpu.regs.p = 0o1000;
    cpu.regs.dl = 0o2000;
    cpu.regs.db = 0o2100;
    cpu.regs.q = 0o2100;
    cpu.regs.sm = 0o2100;
    cpu.regs.z = 0o3000;
    cpu.set_machine_state(MachineState::Running);

    let program = [
        pack_immediate(0o00, 0o25),        // LDI
        pack_immediate(0o00, 0o31),        // LDI
        pack_stack_ops(0o20, 0o42),        // ADD, DUP
        pack_stack_ops(0o21, 0o25),        // SUB, TEST
        pack_immediate(0o01, 0o17),        // LDXI
        pack_stack_ops(0o34, 0o00),        // ADXA, NOP
    ];
    cpu.memory_mut()
        .load(BankAddress::new(0, 0o1000), &program);

    let reason = cpu.run(16);

    let mut hash = 0xCBF2_9CE4_8422_2325u64;
    hash_word(&mut hash, cpu.register(RegisterId::P));
    hash_word(&mut hash, cpu.register(RegisterId::Sm));
    hash_word(&mut hash, cpu.register(RegisterId::Sr));
    hash_word(&mut hash, cpu.register(RegisterId::X));
    hash_word(&mut hash, cpu.register(RegisterId::Sta));
    for slot in 0..4 {
        hash_word(&mut hash, cpu.register(RegisterId::Tos(slot)));
    }
    for byte in cpu.stats().instructions.to_be_bytes() {
        hash_word(&mut hash, u16::from(byte));
    }
    println!("stop: {reason:?}");
    hash
}

fn main() {
    let first = fingerprint();
    let second = fingerprint();
    assert_eq!(first, second, "replay diverged");
    println!("fingerprint: {first:016x}");
}

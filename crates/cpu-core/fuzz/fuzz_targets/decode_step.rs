#![no_main]

use hp3000_cpu::{
    BankAddress, ChannelBus, ChannelProgramKind, CoreConfig, Cpu, DeviceStatus, IoError,
    MachineState, MainMemory, MemoryBus, PrimaryOp,
};
use libfuzzer_sys::fuzz_target;

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

// Random instruction words over a minimal legal register file must never
// panic: every outcome is a retirement, a trap, or a stop.
fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

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

    let words: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    cpu.memory_mut().load(BankAddress::new(0, 0o1000), &words);

    let _ = PrimaryOp::from_word(words[0]);
    let _ = cpu.run(64);
});

//! Shared collaborator stubs for unit tests.

use crate::api::{ChannelBus, ChannelProgramKind, DeviceStatus, IoError};
use crate::memory::MemoryBus;

/// Channel collaborator with no devices.
#[derive(Debug, Default)]
pub(crate) struct NullChannel;

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

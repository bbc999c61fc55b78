//! Segment tables and procedure linkage.
//!
//! The OS owns the code/data segment tables; the core reads them to
//! resolve bank/base/limit triples and callee labels, setting referenced
//! bits as a side effect. Calls and exits move through four-word stack
//! markers; any step may re-enter the dispatcher by trapping instead of
//! returning.

use crate::api::ChannelBus;
use crate::cpu::Cpu;
use crate::fault::Trap;
use crate::memory::{AccessClass, MemoryBus};
use crate::state::{STATUS_I, STATUS_M, STATUS_SEGMENT_MASK};

/// Absolute cell holding the CST base pointer.
pub const CST_POINTER: u16 = 0o1;
/// Absolute cell holding the DST base pointer.
pub const DST_POINTER: u16 = 0o2;
/// Absolute cell holding the CST extension base pointer.
pub const CSTX_POINTER: u16 = 0o3;
/// Absolute cell holding the permanent interrupt-control-stack Q (QI).
pub const ICS_Q_POINTER: u16 = 0o5;
/// Absolute cell holding the interrupt-control-stack limit (ZI).
pub const ICS_Z_POINTER: u16 = 0o6;
/// Absolute cell holding the external interrupt mask.
pub const INTERRUPT_MASK_CELL: u16 = 0o7;
/// Absolute cell holding the cold-load entry segment number.
pub const COLD_LOAD_SEGMENT_CELL: u16 = 0o10;
/// Absolute cell holding the cold-load PB-relative entry offset.
pub const COLD_LOAD_OFFSET_CELL: u16 = 0o11;

/// The reserved system segment carrying trap and interrupt handlers.
pub const SYSTEM_SEGMENT: u16 = 1;

/// First segment number resolved through the CST extension.
pub const CST_EXTENSION_BASE: u16 = 192;

/// Segment-table entry flag: absent (word 1 holds a disk address).
pub const SEGMENT_ABSENT: u16 = 0o100_000;
/// Segment-table entry flag: privileged.
pub const SEGMENT_PRIVILEGED: u16 = 0o040_000;
/// Segment-table entry flag: referenced (set by the core).
pub const SEGMENT_REFERENCED: u16 = 0o020_000;
/// Segment-table entry flag: trace on entry.
pub const SEGMENT_TRACE: u16 = 0o010_000;

/// Program label: external flag.
pub const LABEL_EXTERNAL: u16 = 0o100_000;
/// Program label: uncallable flag (local labels).
pub const LABEL_UNCALLABLE: u16 = 0o040_000;
/// Program label: PB-relative address mask (local labels).
pub const LABEL_ADDRESS_MASK: u16 = 0o037_777;

/// `true` for external (cross-segment) labels.
#[must_use]
pub const fn label_is_external(label: u16) -> bool {
    label & LABEL_EXTERNAL != 0
}

/// Target segment number of an external label.
#[must_use]
pub const fn label_segment(label: u16) -> u16 {
    label & 0o377
}

/// STT index of an external label.
#[must_use]
pub const fn label_stt_index(label: u16) -> u16 {
    (label >> 8) & 0o177
}

/// Builds an external label from an STT index and segment number.
#[must_use]
pub const fn external_label(stt_index: u16, segment: u16) -> u16 {
    LABEL_EXTERNAL | ((stt_index & 0o177) << 8) | (segment & 0o377)
}

/// Result of resolving a code-segment-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSegmentSetup {
    /// Segment number plus the copied privilege bit, ready to merge into
    /// STA.
    pub status: u16,
    /// Entry was marked absent; PB/PBANK are set, PL is stale.
    pub absent: bool,
    /// Entry carries the trace bit.
    pub trace: bool,
}

impl<M: MemoryBus, C: ChannelBus> Cpu<M, C> {
    fn cst_entry_address(&mut self, segment: u16) -> Result<u16, Trap> {
        let segment = segment & 0o377;
        if segment == 0 || segment == CST_EXTENSION_BASE {
            return Err(Trap::CstViolation { segment });
        }
        let (base_cell, index) = if segment < CST_EXTENSION_BASE {
            (CST_POINTER, segment)
        } else {
            (CSTX_POINTER, segment - CST_EXTENSION_BASE)
        };
        let base = self.read_absolute(base_cell)?;
        let length = self.read_absolute(base)? & 0o377;
        if index > length {
            return Err(Trap::CstViolation { segment });
        }
        Ok(base.wrapping_add(index.wrapping_mul(4)))
    }

    /// Resolves a code segment, loading PBANK and PB unconditionally and
    /// PL only when the entry is present. Absent entries keep their word 1
    /// as a disk address, so the limit register retains its previous
    /// contents (documented hardware behavior, not repaired here).
    pub fn setup_code_segment(&mut self, segment: u16) -> Result<CodeSegmentSetup, Trap> {
        let segment = segment & 0o377;
        let entry = self.cst_entry_address(segment)?;
        let flags = self.read_absolute(entry)?;
        let limit = self.read_absolute(entry.wrapping_add(1))?;
        let bank = self.read_absolute(entry.wrapping_add(2))?;
        let base = self.read_absolute(entry.wrapping_add(3))?;

        self.write_absolute(entry, flags | SEGMENT_REFERENCED)?;

        self.regs.pbank = bank;
        self.regs.pb = base;
        let absent = flags & SEGMENT_ABSENT != 0;
        if !absent {
            self.regs.pl = limit;
        }

        let mut status = segment;
        if flags & SEGMENT_PRIVILEGED != 0 {
            status |= STATUS_M;
        }
        Ok(CodeSegmentSetup {
            status,
            absent,
            trace: flags & SEGMENT_TRACE != 0,
        })
    }

    /// Resolves a data segment to its bank and base address. Segment zero
    /// is invalid; absent segments trap with their number.
    pub fn setup_data_segment(&mut self, segment: u16) -> Result<(u16, u16), Trap> {
        let segment = segment & 0o377;
        if segment == 0 {
            return Err(Trap::DstViolation);
        }
        let base = self.read_absolute(DST_POINTER)?;
        let length = self.read_absolute(base)? & 0o377;
        if segment > length {
            return Err(Trap::DstViolation);
        }
        let entry = base.wrapping_add(segment.wrapping_mul(4));
        let flags = self.read_absolute(entry)?;
        if flags & SEGMENT_ABSENT != 0 {
            return Err(Trap::AbsentDataSegment { segment });
        }
        self.write_absolute(entry, flags | SEGMENT_REFERENCED)?;
        let bank = self.read_absolute(entry.wrapping_add(2))?;
        let address = self.read_absolute(entry.wrapping_add(3))?;
        Ok((bank, address))
    }

    /// Reads STT entry `index` of the executing segment. Index zero and
    /// indices beyond the header count are violations.
    pub fn read_stt_entry(&mut self, index: u16) -> Result<u16, Trap> {
        let segment = self.regs.segment();
        let count = self.read(AccessClass::Program, self.regs.pl)? & 0o377;
        if index == 0 || index > count {
            return Err(Trap::SttViolation { segment });
        }
        self.read(AccessClass::Program, self.regs.pl.wrapping_sub(index))
    }

    /// Calls a procedure by label. Local labels stay in-segment; external
    /// labels resolve through the target segment's transfer table. The
    /// marker is written before any segment validation, so absence and
    /// trace traps find a restorable frame.
    pub fn call_procedure(&mut self, label: u16, offset: u16) -> Result<(), Trap> {
        let caller_privileged = self.regs.privileged();
        let return_offset = self
            .regs
            .cir_address()
            .wrapping_add(1)
            .wrapping_sub(self.regs.pb);
        self.mark_stack(return_offset, self.regs.sta)?;

        let mut target = label;
        if label_is_external(label) {
            let segment = label_segment(label);
            let setup = self.setup_code_segment(segment)?;
            if setup.absent {
                return Err(Trap::AbsentCodeSegment { label });
            }
            self.regs.sta = (self.regs.sta & !(STATUS_M | STATUS_SEGMENT_MASK)) | setup.status;
            if setup.trace {
                return Err(Trap::Trace);
            }
            let index = label_stt_index(label);
            let count = self.read(AccessClass::Program, self.regs.pl)? & 0o377;
            if index == 0 || index > count {
                return Err(Trap::SttViolation { segment });
            }
            target = self.read(AccessClass::Program, self.regs.pl.wrapping_sub(index))?;
            if label_is_external(target) {
                return Err(Trap::SttViolation { segment });
            }
        }

        if target & LABEL_UNCALLABLE != 0 && !caller_privileged {
            return Err(Trap::SttEntryUncallable { label: target });
        }

        let address = target & LABEL_ADDRESS_MASK;
        self.branch_to(
            self.regs
                .pb
                .wrapping_add(address)
                .wrapping_add(offset),
        )
    }

    /// Reverses a call through the four-word marker at Q, installing the
    /// given frame and top pointers. X is not restored; only the interrupt
    /// exit path does that.
    pub fn exit_procedure(&mut self, new_q: u16, new_sm: u16) -> Result<(), Trap> {
        let q = self.regs.q;
        let saved_status = self.read(AccessClass::Stack, q.wrapping_sub(1))?;
        let return_offset = self.read(AccessClass::Stack, q.wrapping_sub(2))?;

        if u32::from(new_sm) > u32::from(self.regs.z) {
            return Err(Trap::StackOverflow);
        }
        if !self.regs.privileged() && new_sm < self.regs.db {
            return Err(Trap::StackUnderflow);
        }
        if !self.regs.privileged() {
            // mode and interrupt-enable may only be downgraded on return
            if saved_status & STATUS_M != 0 {
                return Err(Trap::PrivilegeViolation);
            }
            if saved_status & STATUS_I != 0 && self.regs.sta & STATUS_I == 0 {
                return Err(Trap::PrivilegeViolation);
            }
        }

        let target_segment = saved_status & STATUS_SEGMENT_MASK;
        let mut pending_trace = false;
        if target_segment != self.regs.segment() {
            let setup = self.setup_code_segment(target_segment)?;
            if setup.absent {
                return Err(Trap::AbsentCodeSegment {
                    label: external_label(0, target_segment),
                });
            }
            pending_trace = setup.trace;
        }

        self.regs.q = new_q;
        self.regs.sm = new_sm;
        self.regs.sr = 0;
        self.regs.sta = saved_status;
        self.branch_to(self.regs.pb.wrapping_add(return_offset))?;

        if pending_trace {
            return Err(Trap::Trace);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{external_label, label_is_external, label_segment, label_stt_index};

    #[test]
    fn label_fields_round_trip() {
        let label = external_label(0o42, 0o17);
        assert!(label_is_external(label));
        assert_eq!(label_stt_index(label), 0o42);
        assert_eq!(label_segment(label), 0o17);
    }

    #[test]
    fn local_labels_are_not_external() {
        assert!(!label_is_external(0o037_777));
        assert!(!label_is_external(super::LABEL_UNCALLABLE | 0o100));
    }
}

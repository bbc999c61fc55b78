//! Memory collaborator seam: access classification, bank addressing, and
//! the flat word-array implementation used by tests and simple hosts.
//!
//! The core classifies every reference, selects the paired bank register,
//! and enforces bounds itself; the collaborator only provides raw word
//! storage and reports references to non-installed memory.

use crate::state::CpuRegisters;

/// Words per bank.
pub const BANK_WORDS: u32 = 65_536;

/// A physical word address as a bank number plus a word offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct BankAddress {
    /// Bank number.
    pub bank: u16,
    /// Word offset within the bank.
    pub offset: u16,
}

impl BankAddress {
    /// Builds a bank:offset pair.
    #[must_use]
    pub const fn new(bank: u16, offset: u16) -> Self {
        Self { bank, offset }
    }

    /// Flat word index of this address.
    #[must_use]
    pub const fn flat(self) -> u32 {
        (self.bank as u32) * BANK_WORDS + self.offset as u32
    }
}

/// Upper/lower byte selector within a word; byte 0 is the upper byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ByteSelector {
    /// Bits 15..8 (even byte offset).
    Upper,
    /// Bits 7..0 (odd byte offset).
    Lower,
}

impl ByteSelector {
    /// Selector implied by the parity of a byte offset.
    #[must_use]
    pub const fn from_parity(byte_offset: u16) -> Self {
        if byte_offset & 1 == 0 {
            Self::Upper
        } else {
            Self::Lower
        }
    }

    /// Extracts the selected byte from a word.
    #[must_use]
    pub const fn extract(self, word: u16) -> u8 {
        match self {
            Self::Upper => (word >> 8) as u8,
            Self::Lower => (word & 0o377) as u8,
        }
    }

    /// Replaces the selected byte within a word.
    #[must_use]
    pub const fn insert(self, word: u16, byte: u8) -> u16 {
        match self {
            Self::Upper => (word & 0o000_377) | ((byte as u16) << 8),
            Self::Lower => (word & 0o177_400) | byte as u16,
        }
    }
}

/// Reference classification: selects the paired bank register and whether
/// bounds are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum AccessClass {
    /// Bank 0, unchecked (segment tables, fixed cells).
    Absolute,
    /// Device-initiated transfer, unchecked.
    Dma,
    /// Instruction fetch: PBANK, bounds PB..=PL, checked in both modes.
    Fetch,
    /// Program-space data (indirect cells, STT words): PBANK, PB..=PL.
    Program,
    /// Data reference: DBANK, bounds DL..=Z, not cache-mapped (byte
    /// operands and block moves).
    Data,
    /// Data reference: DBANK, bounds DL..=S, offsets above SM resolve
    /// into the TOS cache.
    DataMapped,
    /// Stack reference (markers, spill area): SBANK, bounds DB..=Z.
    Stack,
}

impl AccessClass {
    /// Whether bounds are enforced for this class in the given mode.
    #[must_use]
    pub const fn checked(self, privileged: bool) -> bool {
        match self {
            Self::Absolute | Self::Dma => false,
            Self::Fetch => true,
            Self::Program | Self::Data | Self::DataMapped | Self::Stack => !privileged,
        }
    }

    /// Whether offsets above SM resolve into the TOS cache for this class.
    #[must_use]
    pub const fn tos_mapped(self) -> bool {
        matches!(self, Self::DataMapped | Self::Stack)
    }

    /// Bank register paired with this class.
    #[must_use]
    pub const fn bank(self, regs: &CpuRegisters) -> u16 {
        match self {
            Self::Absolute | Self::Dma => 0,
            Self::Fetch | Self::Program => regs.pbank,
            Self::Data | Self::DataMapped => regs.dbank,
            Self::Stack => regs.sbank,
        }
    }

    /// Inclusive bounds enforced for this class, when any.
    #[must_use]
    pub const fn bounds(self, regs: &CpuRegisters) -> Option<(u16, u16)> {
        match self {
            Self::Absolute | Self::Dma => None,
            Self::Fetch | Self::Program => Some((regs.pb, regs.pl)),
            Self::Data => Some((regs.dl, regs.z)),
            Self::DataMapped => Some((regs.dl, regs.stack_top())),
            Self::Stack => Some((regs.db, regs.z)),
        }
    }
}

/// Faults reported by the physical memory collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFault {
    /// The address lies beyond installed memory.
    NotInstalled(BankAddress),
}

/// Physical word storage consumed by the core.
///
/// Implementations never see CPU registers; classification is passed only
/// so device-side models can distinguish DMA from processor traffic.
pub trait MemoryBus {
    /// Reads one word.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryFault::NotInstalled`] for addresses beyond installed
    /// memory.
    fn read(&mut self, class: AccessClass, addr: BankAddress) -> Result<u16, MemoryFault>;

    /// Writes one word.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryFault::NotInstalled`] for addresses beyond installed
    /// memory.
    fn write(&mut self, class: AccessClass, addr: BankAddress, value: u16)
        -> Result<(), MemoryFault>;

    /// Reads one byte using the word transport.
    ///
    /// # Errors
    ///
    /// Propagates the word-level fault.
    fn read_byte(
        &mut self,
        class: AccessClass,
        addr: BankAddress,
        selector: ByteSelector,
    ) -> Result<u8, MemoryFault> {
        Ok(selector.extract(self.read(class, addr)?))
    }

    /// Writes one byte with a read-modify-write of the containing word.
    ///
    /// # Errors
    ///
    /// Propagates the word-level fault.
    fn write_byte(
        &mut self,
        class: AccessClass,
        addr: BankAddress,
        selector: ByteSelector,
        byte: u8,
    ) -> Result<(), MemoryFault> {
        let word = self.read(class, addr)?;
        self.write(class, addr, selector.insert(word, byte))
    }

    /// Installed memory size in words.
    fn size_words(&self) -> u32;
}

/// Flat main-memory array of plain words.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MainMemory {
    words: Vec<u16>,
}

impl MainMemory {
    /// Allocates zeroed storage for `banks` full 64 K-word banks.
    #[must_use]
    pub fn with_banks(banks: u16) -> Self {
        Self {
            words: vec![0; banks as usize * BANK_WORDS as usize],
        }
    }

    /// Copies `image` into memory starting at `addr`.
    pub fn load(&mut self, addr: BankAddress, image: &[u16]) {
        let start = addr.flat() as usize;
        let end = (start + image.len()).min(self.words.len());
        self.words[start..end].copy_from_slice(&image[..end - start]);
    }

    /// Direct word view for snapshot and inspection tooling.
    #[must_use]
    pub fn words(&self) -> &[u16] {
        &self.words
    }
}

impl Default for MainMemory {
    fn default() -> Self {
        Self::with_banks(2)
    }
}

impl MemoryBus for MainMemory {
    fn read(&mut self, _class: AccessClass, addr: BankAddress) -> Result<u16, MemoryFault> {
        self.words
            .get(addr.flat() as usize)
            .copied()
            .ok_or(MemoryFault::NotInstalled(addr))
    }

    fn write(
        &mut self,
        _class: AccessClass,
        addr: BankAddress,
        value: u16,
    ) -> Result<(), MemoryFault> {
        match self.words.get_mut(addr.flat() as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(MemoryFault::NotInstalled(addr)),
        }
    }

    fn size_words(&self) -> u32 {
        self.words.len() as u32
    }
}

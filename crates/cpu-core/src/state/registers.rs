//! Architectural register file for one CPU instance.
//!
//! One exclusively-owned record per core; no process-wide state. Bit masks
//! follow the hardware documentation's MSB-first numbering, written as
//! octal constants.

/// STA bit: privileged mode.
pub const STATUS_M: u16 = 0o100_000;
/// STA bit: external interrupts enabled.
pub const STATUS_I: u16 = 0o040_000;
/// STA bit: user traps enabled.
pub const STATUS_T: u16 = 0o020_000;
/// STA bit: right-hand stack operation pending.
pub const STATUS_R: u16 = 0o010_000;
/// STA bit: arithmetic overflow.
pub const STATUS_O: u16 = 0o004_000;
/// STA bit: carry.
pub const STATUS_C: u16 = 0o002_000;
/// STA field: two-bit condition code.
pub const STATUS_CC_MASK: u16 = 0o001_400;
/// STA field: executing code segment number.
pub const STATUS_SEGMENT_MASK: u16 = 0o000_377;

/// Shift count of the condition-code field within STA.
pub const STATUS_CC_SHIFT: u16 = 8;

/// Number of top-of-stack register slots.
pub const TOS_SLOTS: usize = 4;

/// Condition-code values stored in the STA CC field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum ConditionCode {
    /// Result greater than zero (CCG).
    Greater = 0,
    /// Result less than zero (CCL).
    Less = 1,
    /// Result equal to zero (CCE).
    Equal = 2,
}

impl ConditionCode {
    /// Classifies a word as a signed two's-complement value.
    #[must_use]
    pub const fn from_word(value: u16) -> Self {
        if value == 0 {
            Self::Equal
        } else if value & 0o100_000 != 0 {
            Self::Less
        } else {
            Self::Greater
        }
    }

    /// Classifies a 32-bit double word as a signed value.
    #[must_use]
    pub const fn from_double(value: u32) -> Self {
        if value == 0 {
            Self::Equal
        } else if value & 0x8000_0000 != 0 {
            Self::Less
        } else {
            Self::Greater
        }
    }

    /// Orders `a` against `b` as signed words.
    #[must_use]
    pub const fn from_compare(a: u16, b: u16) -> Self {
        let (a, b) = (a as i16, b as i16);
        if a == b {
            Self::Equal
        } else if a < b {
            Self::Less
        } else {
            Self::Greater
        }
    }

    /// Orders `a` against `b` as unsigned words.
    #[must_use]
    pub const fn from_logical_compare(a: u16, b: u16) -> Self {
        if a == b {
            Self::Equal
        } else if a < b {
            Self::Less
        } else {
            Self::Greater
        }
    }
}

/// Complete register file of one CPU core.
///
/// Fields are public by design: this is the host-inspectable hardware
/// surface, and executors mutate it directly the way microcode does.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CpuRegisters {
    /// Current instruction register.
    pub cir: u16,
    /// Next instruction register (prefetch stage).
    pub nir: u16,
    /// Program base.
    pub pb: u16,
    /// Program limit.
    pub pl: u16,
    /// Program counter; runs two words ahead of CIR while executing.
    pub p: u16,
    /// Program bank.
    pub pbank: u16,
    /// Data limit (lowest legal data address).
    pub dl: u16,
    /// Data base.
    pub db: u16,
    /// Data bank.
    pub dbank: u16,
    /// Stack frame marker pointer.
    pub q: u16,
    /// Memory-resident stack top pointer.
    pub sm: u16,
    /// Number of valid top-of-stack register slots (0..=4).
    pub sr: u16,
    /// Stack limit.
    pub z: u16,
    /// Stack bank.
    pub sbank: u16,
    /// Top-of-stack cache; slot 0 is always the logical top.
    pub tos: [u16; TOS_SLOTS],
    /// Index register.
    pub x: u16,
    /// Status word.
    pub sta: u16,
    /// Front-panel switch register.
    pub swch: u16,
    /// Run-mode interrupt flag register.
    pub cpx1: u16,
    /// Halt-mode interrupt flag register.
    pub cpx2: u16,
    /// Module number of this CPU.
    pub module: u16,
    /// Process clock, incremented by the timer service.
    pub pclk: u16,
    /// Microcode scratch counter.
    pub cntr: u16,
}

impl CpuRegisters {
    /// Creates a zeroed register file.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` in privileged mode.
    #[must_use]
    pub const fn privileged(&self) -> bool {
        self.sta & STATUS_M != 0
    }

    /// Returns `true` when external interrupts are enabled.
    #[must_use]
    pub const fn interrupts_enabled(&self) -> bool {
        self.sta & STATUS_I != 0
    }

    /// Returns `true` when user traps are enabled.
    #[must_use]
    pub const fn traps_enabled(&self) -> bool {
        self.sta & STATUS_T != 0
    }

    /// Sets or clears one STA flag bit.
    pub const fn set_status_flag(&mut self, flag: u16, enabled: bool) {
        if enabled {
            self.sta |= flag;
        } else {
            self.sta &= !flag;
        }
    }

    /// Reads the condition-code field.
    #[must_use]
    pub const fn condition(&self) -> ConditionCode {
        match (self.sta & STATUS_CC_MASK) >> STATUS_CC_SHIFT {
            1 => ConditionCode::Less,
            2 => ConditionCode::Equal,
            _ => ConditionCode::Greater,
        }
    }

    /// Writes the condition-code field.
    pub const fn set_condition(&mut self, cc: ConditionCode) {
        self.sta = (self.sta & !STATUS_CC_MASK) | ((cc as u16) << STATUS_CC_SHIFT);
    }

    /// Sets the condition code from a signed word result.
    pub const fn set_condition_from(&mut self, value: u16) {
        self.set_condition(ConditionCode::from_word(value));
    }

    /// Executing code segment number from STA.
    #[must_use]
    pub const fn segment(&self) -> u16 {
        self.sta & STATUS_SEGMENT_MASK
    }

    /// Logical top-of-stack address (`SM + SR`).
    #[must_use]
    pub const fn stack_top(&self) -> u16 {
        self.sm.wrapping_add(self.sr)
    }

    /// Address of the instruction currently in CIR.
    #[must_use]
    pub const fn cir_address(&self) -> u16 {
        self.p.wrapping_sub(2)
    }

    /// `true` when the data segment and stack share a bank, so byte
    /// offsets wrap through the sign bit instead of trapping outright.
    #[must_use]
    pub const fn split_stack(&self) -> bool {
        self.dbank != self.sbank
    }
}

/// Individually addressable registers for inspection and modification
/// between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[allow(missing_docs)]
pub enum RegisterId {
    Cir,
    Nir,
    Pb,
    Pl,
    P,
    Pbank,
    Dl,
    Db,
    Dbank,
    Q,
    Sm,
    Sr,
    Z,
    Sbank,
    /// Top-of-stack slot 0..=3; slot 0 is the logical top.
    Tos(u8),
    X,
    Sta,
    Swch,
    Cpx1,
    Cpx2,
    Module,
    Pclk,
    Cntr,
}

impl CpuRegisters {
    /// Reads a register by identifier. Out-of-range TOS slots read zero.
    #[must_use]
    pub fn register(&self, id: RegisterId) -> u16 {
        match id {
            RegisterId::Cir => self.cir,
            RegisterId::Nir => self.nir,
            RegisterId::Pb => self.pb,
            RegisterId::Pl => self.pl,
            RegisterId::P => self.p,
            RegisterId::Pbank => self.pbank,
            RegisterId::Dl => self.dl,
            RegisterId::Db => self.db,
            RegisterId::Dbank => self.dbank,
            RegisterId::Q => self.q,
            RegisterId::Sm => self.sm,
            RegisterId::Sr => self.sr,
            RegisterId::Z => self.z,
            RegisterId::Sbank => self.sbank,
            RegisterId::Tos(slot) => self
                .tos
                .get(usize::from(slot))
                .copied()
                .unwrap_or_default(),
            RegisterId::X => self.x,
            RegisterId::Sta => self.sta,
            RegisterId::Swch => self.swch,
            RegisterId::Cpx1 => self.cpx1,
            RegisterId::Cpx2 => self.cpx2,
            RegisterId::Module => self.module,
            RegisterId::Pclk => self.pclk,
            RegisterId::Cntr => self.cntr,
        }
    }

    /// Writes a register by identifier. `SR` is clamped to the slot count;
    /// out-of-range TOS writes are ignored.
    pub fn set_register(&mut self, id: RegisterId, value: u16) {
        match id {
            RegisterId::Cir => self.cir = value,
            RegisterId::Nir => self.nir = value,
            RegisterId::Pb => self.pb = value,
            RegisterId::Pl => self.pl = value,
            RegisterId::P => self.p = value,
            RegisterId::Pbank => self.pbank = value,
            RegisterId::Dl => self.dl = value,
            RegisterId::Db => self.db = value,
            RegisterId::Dbank => self.dbank = value,
            RegisterId::Q => self.q = value,
            RegisterId::Sm => self.sm = value,
            RegisterId::Sr => self.sr = value.min(TOS_SLOTS as u16),
            RegisterId::Z => self.z = value,
            RegisterId::Sbank => self.sbank = value,
            RegisterId::Tos(slot) => {
                if let Some(entry) = self.tos.get_mut(usize::from(slot)) {
                    *entry = value;
                }
            }
            RegisterId::X => self.x = value,
            RegisterId::Sta => self.sta = value,
            RegisterId::Swch => self.swch = value,
            RegisterId::Cpx1 => self.cpx1 = value,
            RegisterId::Cpx2 => self.cpx2 = value,
            RegisterId::Module => self.module = value,
            RegisterId::Pclk => self.pclk = value,
            RegisterId::Cntr => self.cntr = value,
        }
    }
}

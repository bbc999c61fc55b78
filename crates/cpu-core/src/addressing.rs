//! Effective-address resolution for memory-reference instructions.
//!
//! Six base-relative forms share the ten-bit mode/displacement field, each
//! with its own displacement width. Indirection reads one cell through the
//! initial classification; branch-form program-relative indirects stay
//! program-classified, every other indirect rebases from DB. Indexing adds
//! X after indirection, doubled for double-word operands. Byte operands
//! resolve DB-relative byte offsets with the sign-flip retry rule for
//! non-split-stack configurations.

use crate::api::ChannelBus;
use crate::cpu::Cpu;
use crate::fault::Trap;
use crate::memory::{AccessClass, ByteSelector, MemoryBus};
use crate::opcode::{i_bit, mode_displacement, x_bit};

/// Base register selected by a mode/displacement field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseRegister {
    /// P plus displacement (0..=255).
    PPlus,
    /// P minus displacement (0..=255).
    PMinus,
    /// DB plus displacement (0..=255).
    DbPlus,
    /// Q plus displacement (0..=127).
    QPlus,
    /// Q minus displacement (0..=63).
    QMinus,
    /// S minus displacement (0..=63).
    SMinus,
}

/// Decoded mode/displacement field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressForm {
    /// Base register selector.
    pub base: BaseRegister,
    /// Unsigned displacement, already masked to the form's width.
    pub displacement: u16,
}

/// Decodes the ten-bit mode/displacement field; total over all values.
#[must_use]
pub const fn decode_form(field: u16) -> AddressForm {
    if field & 0o1000 == 0 {
        if field & 0o400 == 0 {
            AddressForm {
                base: BaseRegister::PPlus,
                displacement: field & 0o377,
            }
        } else {
            AddressForm {
                base: BaseRegister::PMinus,
                displacement: field & 0o377,
            }
        }
    } else if field & 0o400 == 0 {
        AddressForm {
            base: BaseRegister::DbPlus,
            displacement: field & 0o377,
        }
    } else if field & 0o200 == 0 {
        AddressForm {
            base: BaseRegister::QPlus,
            displacement: field & 0o177,
        }
    } else if field & 0o100 == 0 {
        AddressForm {
            base: BaseRegister::QMinus,
            displacement: field & 0o77,
        }
    } else {
        AddressForm {
            base: BaseRegister::SMinus,
            displacement: field & 0o77,
        }
    }
}

/// Operand width of a memory-reference instruction, for index scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandSize {
    /// One word; index added as-is.
    Word,
    /// Two words; index doubled.
    Double,
}

/// A resolved, classified effective address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectiveAddress {
    /// Classification to use for the access.
    pub class: AccessClass,
    /// Bank-relative word offset.
    pub offset: u16,
    /// Byte selector for byte operands.
    pub byte: Option<ByteSelector>,
}

impl<M: MemoryBus, C: ChannelBus> Cpu<M, C> {
    /// Resolves a word or double-word operand address.
    ///
    /// The same field inputs, resolved twice without intervening state
    /// change, yield the same result: the only reads are the indirection
    /// cell, through checked classifications.
    pub fn resolve_word_address(
        &mut self,
        word: u16,
        size: OperandSize,
    ) -> Result<EffectiveAddress, Trap> {
        let form = decode_form(mode_displacement(word));
        let d = form.displacement;
        let (mut offset, mut class) = match form.base {
            BaseRegister::PPlus => (
                self.regs.cir_address().wrapping_add(d),
                AccessClass::Program,
            ),
            BaseRegister::PMinus => (
                self.regs.cir_address().wrapping_sub(d),
                AccessClass::Program,
            ),
            BaseRegister::DbPlus => (self.regs.db.wrapping_add(d), AccessClass::DataMapped),
            BaseRegister::QPlus => (self.regs.q.wrapping_add(d), AccessClass::DataMapped),
            BaseRegister::QMinus => (self.regs.q.wrapping_sub(d), AccessClass::DataMapped),
            BaseRegister::SMinus => (
                self.regs.stack_top().wrapping_sub(d),
                AccessClass::DataMapped,
            ),
        };

        if i_bit(word) {
            let cell = self.read(class, offset)?;
            offset = self.regs.db.wrapping_add(cell);
            class = AccessClass::DataMapped;
        }

        if x_bit(word) {
            let index = match size {
                OperandSize::Word => self.regs.x,
                OperandSize::Double => self.regs.x.wrapping_mul(2),
            };
            offset = offset.wrapping_add(index);
        }

        Ok(EffectiveAddress {
            class,
            offset,
            byte: None,
        })
    }

    /// Resolves a branch target; only the program-relative forms are
    /// defined, and an indirect cell is a PB-relative word (the branch form
    /// stays program-classified instead of rebasing from DB).
    pub fn resolve_branch_target(&mut self, word: u16) -> Result<u16, Trap> {
        let form = decode_form(mode_displacement(word));
        let mut target = match form.base {
            BaseRegister::PPlus => self.regs.cir_address().wrapping_add(form.displacement),
            BaseRegister::PMinus => self.regs.cir_address().wrapping_sub(form.displacement),
            _ => return Err(Trap::Undefined),
        };

        if i_bit(word) {
            let cell = self.read(AccessClass::Program, target)?;
            target = self.regs.pb.wrapping_add(cell);
        }

        if x_bit(word) {
            target = target.wrapping_add(self.regs.x);
        }

        Ok(target)
    }

    /// Resolves a byte operand to a word address plus byte selector.
    ///
    /// Byte offsets are DB-relative; Q- and S-relative forms convert their
    /// word base to a byte offset first. The word address is the offset
    /// halved, parity picks the byte. Out-of-range results retry once with
    /// the offset sign bit flipped when the data segment and stack share a
    /// bank, then trap.
    pub fn resolve_byte_address(&mut self, word: u16) -> Result<EffectiveAddress, Trap> {
        let form = decode_form(mode_displacement(word));
        let d = form.displacement;
        let db = self.regs.db;
        let byte_base = match form.base {
            BaseRegister::PPlus | BaseRegister::PMinus => return Err(Trap::Undefined),
            BaseRegister::DbPlus => d,
            BaseRegister::QPlus => self
                .regs
                .q
                .wrapping_sub(db)
                .wrapping_mul(2)
                .wrapping_add(d),
            BaseRegister::QMinus => self
                .regs
                .q
                .wrapping_sub(db)
                .wrapping_mul(2)
                .wrapping_sub(d),
            BaseRegister::SMinus => self
                .regs
                .stack_top()
                .wrapping_sub(db)
                .wrapping_mul(2)
                .wrapping_sub(d),
        };

        let mut byte_offset = byte_base;
        if i_bit(word) {
            // the indirect cell sits at the word-form address and holds a
            // DB-relative byte offset
            let cell_offset = match form.base {
                BaseRegister::DbPlus => db.wrapping_add(d),
                BaseRegister::QPlus => self.regs.q.wrapping_add(d),
                BaseRegister::QMinus => self.regs.q.wrapping_sub(d),
                BaseRegister::SMinus => self.regs.stack_top().wrapping_sub(d),
                BaseRegister::PPlus | BaseRegister::PMinus => return Err(Trap::Undefined),
            };
            byte_offset = self.read(AccessClass::DataMapped, cell_offset)?;
        }
        if x_bit(word) {
            byte_offset = byte_offset.wrapping_add(self.regs.x);
        }

        self.classify_byte_offset(byte_offset)
    }

    /// Applies the halving, parity, and sign-flip retry rules to a
    /// DB-relative byte offset.
    pub fn classify_byte_offset(&self, byte_offset: u16) -> Result<EffectiveAddress, Trap> {
        let word = self.regs.db.wrapping_add(byte_offset >> 1);
        let selector = ByteSelector::from_parity(byte_offset);
        let ea = EffectiveAddress {
            class: AccessClass::Data,
            offset: word,
            byte: Some(selector),
        };

        if self.regs.privileged() || (self.regs.dl <= word && word <= self.regs.z) {
            return Ok(ea);
        }

        if !self.regs.split_stack() {
            // reinterpret as negative by flipping the sign bit, then
            // re-check before trapping
            let flipped = byte_offset ^ 0o100_000;
            let signed_half = ((flipped as i16) >> 1) as u16;
            let word = self.regs.db.wrapping_add(signed_half);
            if self.regs.dl <= word && word <= self.regs.z {
                return Ok(EffectiveAddress {
                    class: AccessClass::Data,
                    offset: word,
                    byte: Some(ByteSelector::from_parity(flipped)),
                });
            }
        }

        Err(Trap::BoundsViolation)
    }

    /// Converts a DB-relative byte offset plus optional block length into
    /// start/end word addresses under the same reinterpretation rule.
    pub fn byte_range_to_words(
        &self,
        byte_offset: u16,
        length: Option<u16>,
    ) -> Result<(u16, u16), Trap> {
        let start = self.classify_byte_offset(byte_offset)?;
        let end = match length {
            None | Some(0) => start,
            Some(len) => {
                self.classify_byte_offset(byte_offset.wrapping_add(len).wrapping_sub(1))?
            }
        };
        Ok((start.offset, end.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_form, BaseRegister, OperandSize};
    use crate::api::CoreConfig;
    use crate::fault::Trap;
    use crate::memory::{AccessClass, BankAddress, ByteSelector, MainMemory, MemoryBus};
    use crate::opcode::pack_memory_reference;
    use crate::state::STATUS_M;
    use crate::test_support::NullChannel;
    use crate::Cpu;

    fn cpu() -> Cpu<MainMemory, NullChannel> {
        let mut cpu = Cpu::new(
            MainMemory::with_banks(1),
            NullChannel::default(),
            CoreConfig::default(),
        );
        cpu.regs.pb = 0o10_000;
        cpu.regs.pl = 0o11_000;
        cpu.regs.p = 0o10_102; // CIR at 0o10_100
        cpu.regs.dl = 0o1000;
        cpu.regs.db = 0o2000;
        cpu.regs.q = 0o2100;
        cpu.regs.sm = 0o2200;
        cpu.regs.z = 0o3000;
        cpu
    }

    #[test]
    fn form_decoding_matches_the_field_widths() {
        assert_eq!(decode_form(0o0377).base, BaseRegister::PPlus);
        assert_eq!(decode_form(0o0377).displacement, 0o377);
        assert_eq!(decode_form(0o0400).base, BaseRegister::PMinus);
        assert_eq!(decode_form(0o1000).base, BaseRegister::DbPlus);
        assert_eq!(decode_form(0o1400).base, BaseRegister::QPlus);
        assert_eq!(decode_form(0o1400 | 0o177).displacement, 0o177);
        assert_eq!(decode_form(0o1600).base, BaseRegister::QMinus);
        assert_eq!(decode_form(0o1700).base, BaseRegister::SMinus);
        assert_eq!(decode_form(0o1700 | 0o77).displacement, 0o77);
    }

    #[test]
    fn direct_forms_use_their_base_registers() {
        let mut cpu = cpu();
        let ea = cpu
            .resolve_word_address(
                pack_memory_reference(0o04, false, false, 0o1000 | 0o12),
                OperandSize::Word,
            )
            .expect("direct");
        assert_eq!(ea.class, AccessClass::DataMapped);
        assert_eq!(ea.offset, 0o2012);

        let ea = cpu
            .resolve_word_address(
                pack_memory_reference(0o04, false, false, 0o12),
                OperandSize::Word,
            )
            .expect("direct");
        assert_eq!(ea.class, AccessClass::Program);
        assert_eq!(ea.offset, 0o10_112);

        let ea = cpu
            .resolve_word_address(
                pack_memory_reference(0o04, false, false, 0o1700 | 0o2),
                OperandSize::Word,
            )
            .expect("direct");
        assert_eq!(ea.offset, cpu.regs.stack_top() - 2);
    }

    #[test]
    fn resolution_is_idempotent_without_state_change() {
        let mut cpu = cpu();
        let word = pack_memory_reference(0o04, true, false, 0o1400 | 0o7);
        cpu.regs.x = 5;
        let first = cpu.resolve_word_address(word, OperandSize::Word).expect("ok");
        let second = cpu.resolve_word_address(word, OperandSize::Word).expect("ok");
        assert_eq!(first, second);
    }

    #[test]
    fn indirect_data_cells_rebase_from_db() {
        let mut cpu = cpu();
        cpu.memory_mut().load(BankAddress::new(0, 0o2012), &[0o150]);
        let ea = cpu
            .resolve_word_address(
                pack_memory_reference(0o04, false, true, 0o1000 | 0o12),
                OperandSize::Word,
            )
            .expect("indirect");
        assert_eq!(ea.class, AccessClass::DataMapped);
        assert_eq!(ea.offset, 0o2000 + 0o150);
    }

    #[test]
    fn indirect_program_cells_also_rebase_from_db() {
        let mut cpu = cpu();
        cpu.memory_mut()
            .load(BankAddress::new(0, 0o10_112), &[0o100]);
        let ea = cpu
            .resolve_word_address(
                pack_memory_reference(0o04, false, true, 0o12),
                OperandSize::Word,
            )
            .expect("indirect");
        assert_eq!(ea.class, AccessClass::DataMapped);
        assert_eq!(ea.offset, 0o2100);
    }

    #[test]
    fn branch_indirects_stay_program_relative() {
        let mut cpu = cpu();
        cpu.memory_mut()
            .load(BankAddress::new(0, 0o10_112), &[0o500]);
        let target = cpu
            .resolve_branch_target(pack_memory_reference(0o13, false, true, 0o12))
            .expect("indirect branch");
        assert_eq!(target, cpu.regs.pb + 0o500);

        assert_eq!(
            cpu.resolve_branch_target(pack_memory_reference(0o13, false, false, 0o1000 | 0o12)),
            Err(Trap::Undefined)
        );
    }

    #[test]
    fn indexing_applies_after_indirection_and_doubles_for_doubles() {
        let mut cpu = cpu();
        cpu.regs.x = 3;
        cpu.memory_mut().load(BankAddress::new(0, 0o2012), &[0o150]);

        let word = pack_memory_reference(0o16, true, true, 0o1000 | 0o12);
        let ea = cpu
            .resolve_word_address(word, OperandSize::Double)
            .expect("indexed");
        assert_eq!(ea.offset, 0o2000 + 0o150 + 6);

        let ea = cpu
            .resolve_word_address(word, OperandSize::Word)
            .expect("indexed");
        assert_eq!(ea.offset, 0o2000 + 0o150 + 3);
    }

    #[test]
    fn byte_parity_selects_upper_then_lower() {
        let mut cpu = cpu();
        let ea = cpu
            .resolve_byte_address(pack_memory_reference(0o14, false, false, 0o1000 | 0o10))
            .expect("byte");
        assert_eq!(ea.offset, 0o2004);
        assert_eq!(ea.byte, Some(ByteSelector::Upper));

        let ea = cpu
            .resolve_byte_address(pack_memory_reference(0o14, false, false, 0o1000 | 0o11))
            .expect("byte");
        assert_eq!(ea.offset, 0o2004);
        assert_eq!(ea.byte, Some(ByteSelector::Lower));
    }

    #[test]
    fn out_of_range_byte_offsets_flip_the_sign_bit_before_trapping() {
        let mut cpu = cpu();
        // halved directly this lands far above Z; flipped it becomes -1,
        // addressing the word just below DB
        let ea = cpu.classify_byte_offset(0o077_776).expect("wrapped");
        assert_eq!(ea.offset, cpu.regs.db - 1);
        assert_eq!(ea.byte, Some(ByteSelector::Upper));

        // past Z and not recoverable by the flip
        cpu.regs.z = 0o2100;
        assert_eq!(
            cpu.classify_byte_offset(0o070_000),
            Err(Trap::BoundsViolation)
        );

        // privileged mode takes the raw interpretation without bounds
        cpu.regs.set_status_flag(STATUS_M, true);
        let ea = cpu.classify_byte_offset(0o070_000).expect("unchecked");
        assert_eq!(ea.offset, cpu.regs.db + 0o034_000);
    }

    #[test]
    fn split_stack_disables_the_reinterpretation() {
        let mut cpu = cpu();
        cpu.regs.sbank = 1;
        assert_eq!(
            cpu.classify_byte_offset(0o077_776),
            Err(Trap::BoundsViolation)
        );
    }

    #[test]
    fn byte_ranges_share_the_reinterpretation_rule() {
        let cpu = cpu();
        let (start, end) = cpu.byte_range_to_words(0o10, Some(0o11)).expect("range");
        assert_eq!(start, 0o2004);
        assert_eq!(end, 0o2000 + (0o10 + 0o11 - 1) / 2);

        let (start, end) = cpu.byte_range_to_words(0o10, None).expect("range");
        assert_eq!(start, end);
    }
}

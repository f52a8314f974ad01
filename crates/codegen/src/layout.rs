//! Object and frame layout shared by generated code and the runtime.
//!
//! All offsets are in words unless noted. Word size follows the target
//! architecture.

use crate::isa::Arch;
use ember_il::object_model::{ClassId, ClassTable, Slot};

/// Low bit of a tagged heap object pointer.
pub const HEAP_OBJECT_TAG: i64 = 1;
pub const SMI_TAG_SHIFT: u8 = 1;
pub const SMI_TAG_MASK: i64 = 1;

/// Word 0 of every object holds its (untagged) class id.
pub const CLASS_ID_WORD: u32 = 0;

pub fn tag_smi(value: i64) -> i64 {
    value << SMI_TAG_SHIFT
}

pub fn untag_smi(word: i64) -> i64 {
    word >> SMI_TAG_SHIFT
}

pub fn is_smi_word(word: i64) -> bool {
    word & SMI_TAG_MASK == 0
}

/// Byte displacement of word `words` of an object from its tagged pointer.
pub fn field_offset(arch: Arch, words: u32) -> i32 {
    (words * arch.word_size()) as i32 - HEAP_OBJECT_TAG as i32
}

pub fn slot_offset(arch: Arch, slot: &Slot) -> i32 {
    field_offset(arch, slot.offset_in_words)
}

/// Size in words of an instance of `cid`, header included.
pub fn instance_size_in_words(classes: &ClassTable, cid: ClassId) -> u32 {
    Slot::HEADER_WORDS + classes.instance_field_count(cid)
}

pub mod mint {
    /// 64-bit payload; two words on 32-bit targets.
    pub const VALUE_WORD: u32 = 1;
}

pub mod double {
    /// IEEE bits; two words on 32-bit targets.
    pub const VALUE_WORD: u32 = 1;
}

pub mod array {
    pub const LENGTH_WORD: u32 = 1;
    pub const DATA_WORD: u32 = 2;
}

pub mod closure {
    pub const FUNCTION_WORD: u32 = 1;
    pub const CONTEXT_WORD: u32 = 2;
    pub const SIZE_IN_WORDS: u32 = 3;
}

pub mod function {
    /// Invocation counter (a smi) checked by optimizable prologues.
    pub const USAGE_COUNTER_WORD: u32 = 1;
    pub const SIZE_IN_WORDS: u32 = 2;
}

/// Runtime representation of an [`ArgumentsDescriptor`](ember_il::feedback::ArgumentsDescriptor).
/// All counts are smis; named entries are sorted by name and followed by
/// a null name that ends the list.
pub mod args_desc {
    pub const TYPE_ARGS_LEN_WORD: u32 = 1;
    pub const COUNT_WORD: u32 = 2;
    pub const POSITIONAL_COUNT_WORD: u32 = 3;
    pub const NAMED_COUNT_WORD: u32 = 4;
    pub const FIRST_NAMED_WORD: u32 = 5;
    /// Words per named entry: the name, then its argument position.
    pub const NAMED_ENTRY_WORDS: u32 = 2;
    pub const NAME_OFFSET_IN_ENTRY: u32 = 0;
    pub const POSITION_OFFSET_IN_ENTRY: u32 = 1;

    pub fn size_in_words(named_count: u32) -> u32 {
        FIRST_NAMED_WORD + NAMED_ENTRY_WORDS * named_count + 1
    }
}

/// Absolute address of the word holding the current stack limit.
pub const STACK_LIMIT_ADDRESS: i64 = 0x100;

/// Fixed part of a Dart frame, as FP-relative word indices.
///
/// ```text
///   fp + 2 + i   incoming argument count-1-i
///   fp + 1       return address
///   fp + 0       caller's fp
///   fp - 1       pc marker
///   fp - 2       caller's pool pointer (pool architectures only)
///   ...          spill slots, from first_local_from_fp downwards
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    pub saved_caller_fp_from_fp: i32,
    pub return_address_from_fp: i32,
    /// Index of the last (deepest) incoming argument.
    pub param_end_from_fp: i32,
    pub pc_marker_from_fp: i32,
    pub saved_caller_pp_from_fp: Option<i32>,
    pub first_local_from_fp: i32,
}

impl FrameLayout {
    pub fn for_arch(arch: Arch) -> Self {
        let has_pp = arch.uses_object_pool();
        FrameLayout {
            saved_caller_fp_from_fp: 0,
            return_address_from_fp: 1,
            param_end_from_fp: 1,
            pc_marker_from_fp: -1,
            saved_caller_pp_from_fp: has_pp.then_some(-2),
            first_local_from_fp: if has_pp { -3 } else { -2 },
        }
    }

    /// FP-relative index of incoming argument `index` when `count`
    /// arguments were passed.
    pub fn incoming_argument(&self, index: u32, count: u32) -> i32 {
        self.param_end_from_fp + (count - index) as i32
    }

    /// Number of words between FP and the lowest spill slot when the
    /// frame has `spill_slots` slots.
    pub fn sp_offset_from_fp(&self, spill_slots: u32) -> i32 {
        self.first_local_from_fp - spill_slots as i32 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets_account_for_the_tag() {
        assert_eq!(field_offset(Arch::X64, 1), 7);
        assert_eq!(field_offset(Arch::Arm, 2), 7);
        assert_eq!(field_offset(Arch::Ia32, 0), -1);
    }

    #[test]
    fn frame_slots() {
        let arm = FrameLayout::for_arch(Arch::Arm);
        assert_eq!(arm.first_local_from_fp, -3);
        assert_eq!(arm.incoming_argument(0, 2), 3);
        assert_eq!(arm.incoming_argument(1, 2), 2);
        assert_eq!(arm.sp_offset_from_fp(4), -6);

        let ia32 = FrameLayout::for_arch(Arch::Ia32);
        assert_eq!(ia32.saved_caller_pp_from_fp, None);
        assert_eq!(ia32.first_local_from_fp, -2);
    }
}

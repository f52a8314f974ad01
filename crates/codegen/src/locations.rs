//! Where values live, and what each instruction needs from the register
//! allocator.

use crate::{
    assembler::Address,
    isa::{Arch, FpuRegister, Register, RegisterConventions},
    layout::FrameLayout,
};
use cranelift_entity::EntityRef;
use ember_il::{InstrId, ir::Representation};
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};

/// A value location. Stack slots are FP-relative word indices.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Location {
    #[default]
    Invalid,
    Register(Register),
    FpuRegister(FpuRegister),
    StackSlot(i32),
    /// An unboxed double. Occupies words `index` and `index + 1` on
    /// 32-bit targets.
    DoubleStackSlot(i32),
    /// The value of a constant definition, materialized on demand.
    Constant(InstrId),
}

impl Location {
    pub fn is_invalid(&self) -> bool {
        matches!(self, Location::Invalid)
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Location::Register(_))
    }

    pub fn is_fpu_register(&self) -> bool {
        matches!(self, Location::FpuRegister(_))
    }

    pub fn is_stack(&self) -> bool {
        matches!(self, Location::StackSlot(_) | Location::DoubleStackSlot(_))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Location::Constant(_))
    }

    pub fn reg(&self) -> Register {
        match self {
            Location::Register(reg) => *reg,
            other => panic!("{other:?} is not a register"),
        }
    }

    pub fn fpu_reg(&self) -> FpuRegister {
        match self {
            Location::FpuRegister(reg) => *reg,
            other => panic!("{other:?} is not an fpu register"),
        }
    }

    /// Address of a stack location relative to the frame pointer.
    pub fn stack_address(&self, arch: Arch) -> Address {
        let fp = arch.conventions().fp;
        match self {
            Location::StackSlot(index) | Location::DoubleStackSlot(index) => {
                Address::new(fp, index * arch.word_size() as i32)
            }
            other => panic!("{other:?} is not a stack location"),
        }
    }

    /// Spill slot number counted down from the first local, if this is a
    /// spill slot rather than an incoming argument.
    pub fn spill_slot_index(&self, layout: &FrameLayout) -> Option<u32> {
        match self {
            Location::StackSlot(index) | Location::DoubleStackSlot(index)
                if *index <= layout.first_local_from_fp =>
            {
                Some((layout.first_local_from_fp - index) as u32)
            }
            _ => None,
        }
    }

    /// Whether writing `other` may change the value read from `self`.
    pub fn overlaps(&self, other: &Location, arch: Arch) -> bool {
        let words = |index: i32, double: bool| {
            let n = if double && arch.word_size() == 4 { 2 } else { 1 };
            index..index + n
        };
        match (self, other) {
            (
                Location::StackSlot(a) | Location::DoubleStackSlot(a),
                Location::StackSlot(b) | Location::DoubleStackSlot(b),
            ) => {
                let ra = words(*a, matches!(self, Location::DoubleStackSlot(_)));
                let rb = words(*b, matches!(other, Location::DoubleStackSlot(_)));
                ra.start < rb.end && rb.start < ra.end
            }
            _ => self == other,
        }
    }

    pub fn display<'a>(&'a self, conv: &'a RegisterConventions) -> DisplayLocation<'a> {
        DisplayLocation { loc: self, conv }
    }
}

pub struct DisplayLocation<'a> {
    loc: &'a Location,
    conv: &'a RegisterConventions,
}

impl Display for DisplayLocation<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.loc {
            Location::Invalid => write!(f, "-"),
            Location::Register(reg) => write!(f, "{}", self.conv.name(*reg)),
            Location::FpuRegister(reg) => write!(f, "{}", self.conv.fpu_name(*reg)),
            Location::StackSlot(index) => write!(f, "S{index:+}"),
            Location::DoubleStackSlot(index) => write!(f, "DS{index:+}"),
            Location::Constant(def) => write!(f, "C(v{})", def.index()),
        }
    }
}

/// A constraint on an input, temp or output location.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Policy {
    RequiresRegister,
    RequiresFpuRegister,
    Fixed(Register),
    FixedFpu(FpuRegister),
    /// Output only: reuse the register of input 0.
    SameAsFirstInput,
}

impl Policy {
    /// Policy for a value of representation `rep`.
    pub fn for_representation(rep: Representation) -> Policy {
        match rep {
            Representation::UnboxedDouble => Policy::RequiresFpuRegister,
            _ => Policy::RequiresRegister,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContainsCall {
    No,
    /// The instruction always calls; no register survives it.
    Call,
    /// Only an out-of-line path calls.
    CallOnSlowPath,
}

/// Location constraints of one instruction.
///
/// Inputs beyond `inputs.len()` are not loaded into registers; the
/// instruction reads them from their homes itself (call arguments).
#[derive(Clone, Debug)]
pub struct LocationSummary {
    pub inputs: SmallVec<[Policy; 4]>,
    pub temps: SmallVec<[Policy; 2]>,
    pub output: Option<Policy>,
    pub contains_call: ContainsCall,
}

impl LocationSummary {
    pub fn new(contains_call: ContainsCall) -> Self {
        Self {
            inputs: SmallVec::new(),
            temps: SmallVec::new(),
            output: None,
            contains_call,
        }
    }

    pub fn input(mut self, policy: Policy) -> Self {
        self.inputs.push(policy);
        self
    }

    pub fn inputs(mut self, policy: Policy, count: usize) -> Self {
        self.inputs.extend(std::iter::repeat(policy).take(count));
        self
    }

    pub fn temp(mut self, policy: Policy) -> Self {
        self.temps.push(policy);
        self
    }

    pub fn output(mut self, policy: Policy) -> Self {
        self.output = Some(policy);
        self
    }

    pub fn can_call(&self) -> bool {
        self.contains_call != ContainsCall::No
    }

    /// Assigns concrete registers. Fixed registers are reserved first so
    /// that no flexible location can collide with them. Inputs and temps
    /// are pairwise distinct; a flexible output is distinct from both,
    /// while a fixed output may coincide with an input it consumes.
    pub fn allocate(&self, conv: &RegisterConventions) -> AllocatedLocations {
        let mut blocked: SmallVec<[Register; 8]> = SmallVec::new();
        let mut blocked_fpu: SmallVec<[FpuRegister; 4]> = SmallVec::new();
        for policy in self.inputs.iter().chain(&self.temps) {
            match policy {
                Policy::Fixed(reg) => {
                    assert!(!blocked.contains(reg), "register {} fixed twice", conv.name(*reg));
                    blocked.push(*reg);
                }
                Policy::FixedFpu(reg) => blocked_fpu.push(*reg),
                _ => {}
            }
        }
        if let Some(Policy::Fixed(reg)) = self.output {
            if !blocked.contains(&reg) {
                blocked.push(reg);
            }
        }

        let take = |policy: Policy, blocked: &mut SmallVec<[Register; 8]>, blocked_fpu: &mut SmallVec<[FpuRegister; 4]>| {
            match policy {
                Policy::Fixed(reg) => Location::Register(reg),
                Policy::FixedFpu(reg) => Location::FpuRegister(reg),
                Policy::RequiresRegister => {
                    let reg = conv
                        .allocatable
                        .iter()
                        .copied()
                        .find(|r| !blocked.contains(r))
                        .unwrap_or_else(|| panic!("out of registers on {}", conv.arch));
                    blocked.push(reg);
                    Location::Register(reg)
                }
                Policy::RequiresFpuRegister => {
                    let reg = conv
                        .allocatable_fpu
                        .iter()
                        .copied()
                        .find(|r| !blocked_fpu.contains(r))
                        .unwrap_or_else(|| panic!("out of fpu registers on {}", conv.arch));
                    blocked_fpu.push(reg);
                    Location::FpuRegister(reg)
                }
                Policy::SameAsFirstInput => panic!("same-as-first-input is an output policy"),
            }
        };

        let inputs: SmallVec<[Location; 4]> = self
            .inputs
            .iter()
            .map(|&p| take(p, &mut blocked, &mut blocked_fpu))
            .collect();
        let temps: SmallVec<[Location; 2]> = self
            .temps
            .iter()
            .map(|&p| take(p, &mut blocked, &mut blocked_fpu))
            .collect();
        let output = match self.output {
            None => Location::Invalid,
            Some(Policy::SameAsFirstInput) => inputs[0],
            Some(policy) => take(policy, &mut blocked, &mut blocked_fpu),
        };
        AllocatedLocations {
            inputs,
            temps,
            output,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AllocatedLocations {
    pub inputs: SmallVec<[Location; 4]>,
    pub temps: SmallVec<[Location; 2]>,
    pub output: Location,
}

impl AllocatedLocations {
    pub fn input(&self, index: usize) -> Register {
        self.inputs[index].reg()
    }

    pub fn fpu_input(&self, index: usize) -> FpuRegister {
        self.inputs[index].fpu_reg()
    }

    pub fn temp(&self, index: usize) -> Register {
        self.temps[index].reg()
    }

    pub fn out(&self) -> Register {
        self.output.reg()
    }

    pub fn fpu_out(&self) -> FpuRegister {
        self.output.fpu_reg()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_registers_are_reserved_before_flexible_ones() {
        let conv = Arch::Ia32.conventions();
        let summary = LocationSummary::new(ContainsCall::No)
            .input(Policy::RequiresRegister)
            .input(Policy::RequiresRegister)
            .temp(Policy::Fixed(conv.result))
            .output(Policy::RequiresRegister);
        let locs = summary.allocate(conv);
        let regs = [locs.input(0), locs.input(1), locs.temp(0), locs.out()];
        assert_eq!(locs.temp(0), conv.result);
        for (i, a) in regs.iter().enumerate() {
            for b in &regs[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn fixed_output_may_reuse_an_input() {
        let conv = Arch::X64.conventions();
        let summary = LocationSummary::new(ContainsCall::Call)
            .input(Policy::Fixed(conv.type_test_instance))
            .output(Policy::Fixed(conv.result));
        let locs = summary.allocate(conv);
        assert_eq!(locs.out(), locs.input(0));
    }

    #[test]
    fn double_slots_overlap_their_second_word_on_32_bit_targets() {
        let a = Location::DoubleStackSlot(-6);
        let b = Location::StackSlot(-5);
        assert!(a.overlaps(&b, Arch::Arm));
        assert!(!a.overlaps(&b, Arch::X64));
    }
}

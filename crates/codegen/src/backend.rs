//! Architecture-specific instruction selection.
//!
//! The flow graph compiler is written once against [`ArchCodeEmitter`].
//! Sequences that are the same everywhere are provided methods; frame
//! setup, object access and the few places where an ISA has a better or
//! more constrained way of doing something are implemented per target.

use crate::{
    assembler::{Address, AluOp, Assembler, Condition, Label, MachInst, Operand, ShiftOp},
    compiled_code::PoolEntry,
    isa::{Arch, Register, RegisterConventions},
    layout::{self, CLASS_ID_WORD, STACK_LIMIT_ADDRESS},
    stubs::CallTarget,
};
use ember_il::object_model::{FunctionId, cid};

mod arm;
mod ia32;
mod x64;

pub use arm::ArmEmitter;
pub use ia32::Ia32Emitter;
pub use x64::X64Emitter;

pub fn emitter_for(arch: Arch) -> &'static dyn ArchCodeEmitter {
    match arch {
        Arch::Arm => &ArmEmitter,
        Arch::Ia32 => &Ia32Emitter,
        Arch::X64 => &X64Emitter,
    }
}

pub trait ArchCodeEmitter: Sync {
    fn arch(&self) -> Arch;

    fn conventions(&self) -> &'static RegisterConventions {
        self.arch().conventions()
    }

    /// Builds the fixed part of a frame for `function` and reserves
    /// `spill_slots` words below it.
    fn enter_dart_frame(&self, asm: &mut Assembler, function: FunctionId, spill_slots: u32);

    /// Takes over a frame built by unoptimized code at an OSR entry,
    /// growing or shrinking it to `spill_slots` spill slots.
    fn enter_osr_frame(&self, asm: &mut Assembler, spill_slots: u32) {
        let conv = self.conventions();
        self.restore_pool_pointer(asm);
        asm.emit(MachInst::Move {
            dst: conv.sp,
            src: conv.fp,
        });
        let offset = layout::FrameLayout::for_arch(self.arch()).sp_offset_from_fp(spill_slots);
        asm.emit(MachInst::Alu {
            op: AluOp::Add,
            dst: conv.sp,
            src: Operand::Imm(i64::from(offset) * i64::from(self.arch().word_size())),
        });
    }

    /// Removes the frame, restoring the caller's frame and pool pointers,
    /// and leaves the return address where `Ret` expects it.
    fn leave_dart_frame(&self, asm: &mut Assembler);

    /// Reloads the pool pointer of the current code, for entry points
    /// reached with a foreign pool pointer (exception handlers).
    fn restore_pool_pointer(&self, asm: &mut Assembler);

    fn load_object(&self, asm: &mut Assembler, dst: Register, entry: PoolEntry);

    fn push_object(&self, asm: &mut Assembler, entry: PoolEntry);

    /// Compares `lhs` with an object for identity.
    fn compare_object(&self, asm: &mut Assembler, lhs: Register, entry: PoolEntry);

    fn swap_registers(&self, asm: &mut Assembler, a: Register, b: Register);

    fn swap_register_with_memory(&self, asm: &mut Assembler, reg: Register, addr: Address);

    /// Swaps two memory words using `scratch`, which may be the reserved
    /// scratch register.
    fn swap_memory(&self, asm: &mut Assembler, a: Address, b: Address, scratch: Register);

    /// Register that shift-by-register instructions take their count in,
    /// if the ISA fixes one.
    fn shift_count_register(&self) -> Option<Register> {
        None
    }

    /// Dividend and clobbered high-half registers of `Div`, if the ISA
    /// fixes them.
    fn division_registers(&self) -> Option<(Register, Register)> {
        None
    }

    fn supports_unboxed_int64(&self) -> bool {
        false
    }

    /// Loads a constant without touching the condition flags.
    fn load_immediate(&self, asm: &mut Assembler, dst: Register, imm: i64) {
        asm.emit(MachInst::LoadImmediate { dst, imm });
    }

    fn load_field(&self, asm: &mut Assembler, dst: Register, object: Register, word: u32) {
        asm.emit(MachInst::Load {
            dst,
            addr: Address::new(object, layout::field_offset(self.arch(), word)),
        });
    }

    fn store_field(&self, asm: &mut Assembler, src: Register, object: Register, word: u32) {
        asm.emit(MachInst::Store {
            src,
            addr: Address::new(object, layout::field_offset(self.arch(), word)),
        });
    }

    /// Branches to `target` if `reg` holds a smi.
    fn branch_if_smi(&self, asm: &mut Assembler, reg: Register, target: Label) {
        asm.emit(MachInst::Test {
            lhs: reg,
            rhs: Operand::Imm(layout::SMI_TAG_MASK),
        });
        asm.emit(MachInst::BranchIf {
            cond: Condition::Equal,
            target,
        });
    }

    fn branch_if_not_smi(&self, asm: &mut Assembler, reg: Register, target: Label) {
        asm.emit(MachInst::Test {
            lhs: reg,
            rhs: Operand::Imm(layout::SMI_TAG_MASK),
        });
        asm.emit(MachInst::BranchIf {
            cond: Condition::NotEqual,
            target,
        });
    }

    fn smi_tag(&self, asm: &mut Assembler, reg: Register) {
        asm.emit(MachInst::Alu {
            op: AluOp::Add,
            dst: reg,
            src: Operand::Reg(reg),
        });
    }

    fn smi_untag(&self, asm: &mut Assembler, reg: Register) {
        asm.emit(MachInst::Shift {
            op: ShiftOp::Sar,
            dst: reg,
            count: Operand::Imm(i64::from(layout::SMI_TAG_SHIFT)),
        });
    }

    /// Loads the untagged class id of a heap object.
    fn load_class_id(&self, asm: &mut Assembler, dst: Register, object: Register) {
        self.load_field(asm, dst, object, CLASS_ID_WORD);
    }

    /// Loads the untagged class id of any value, smis included.
    fn load_class_id_may_be_smi(&self, asm: &mut Assembler, dst: Register, value: Register) {
        debug_assert_ne!(dst, value);
        let done = asm.new_label();
        self.load_immediate(asm, dst, i64::from(cid::SMI));
        self.branch_if_smi(asm, value, done);
        self.load_class_id(asm, dst, value);
        asm.bind(done);
    }

    /// Emits a call and returns its return address.
    fn call(&self, asm: &mut Assembler, target: CallTarget) -> u32 {
        asm.emit(MachInst::Call(target));
        asm.code_size()
    }

    fn drop_arguments(&self, asm: &mut Assembler, count: u32) {
        if count > 0 {
            asm.emit(MachInst::Alu {
                op: AluOp::Add,
                dst: self.conventions().sp,
                src: Operand::Imm(i64::from(count * self.arch().word_size())),
            });
        }
    }

    /// Branches to `slow_path` when the stack pointer has reached the
    /// limit published by the runtime.
    fn check_stack_overflow(&self, asm: &mut Assembler, scratch: Register, slow_path: Label) {
        let conv = self.conventions();
        asm.emit(MachInst::LoadAbsolute {
            dst: scratch,
            address: STACK_LIMIT_ADDRESS,
        });
        asm.emit(MachInst::Compare {
            lhs: conv.sp,
            rhs: Operand::Reg(scratch),
        });
        asm.emit(MachInst::BranchIf {
            cond: Condition::BelowEqual,
            target: slow_path,
        });
    }

    /// Pushes the words of the fixed frame part shared by every target:
    /// caller's fp, then the pc marker identifying `function`.
    fn push_frame_header(&self, asm: &mut Assembler, function: FunctionId) {
        let conv = self.conventions();
        asm.emit(MachInst::Push(conv.fp));
        asm.emit(MachInst::Move {
            dst: conv.fp,
            src: conv.sp,
        });
        asm.emit(MachInst::PushImmediate(pc_marker(function)));
    }

    fn reserve_spill_slots(&self, asm: &mut Assembler, spill_slots: u32) {
        if spill_slots > 0 {
            asm.emit(MachInst::Alu {
                op: AluOp::Sub,
                dst: self.conventions().sp,
                src: Operand::Imm(i64::from(spill_slots * self.arch().word_size())),
            });
        }
    }
}

/// Value stored in a frame's pc marker slot: the function's index as a smi.
pub fn pc_marker(function: FunctionId) -> i64 {
    use cranelift_entity::EntityRef;
    layout::tag_smi(function.index() as i64)
}

/// Object access for the pool architectures.
fn pool_load(asm: &mut Assembler, dst: Register, entry: PoolEntry) {
    let index = asm.object_index(entry);
    asm.emit(MachInst::LoadFromPool { dst, index });
}

/// Restores the caller's pool pointer from its frame slot.
fn reload_caller_pool_pointer(asm: &mut Assembler, arch: Arch) {
    let conv = arch.conventions();
    let layout = layout::FrameLayout::for_arch(arch);
    if let (Some(pp), Some(slot)) = (conv.pp, layout.saved_caller_pp_from_fp) {
        asm.emit(MachInst::Load {
            dst: pp,
            addr: Address::new(conv.fp, slot * arch.word_size() as i32),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::FrameLayout;
    use cranelift_entity::EntityRef;

    fn frame_entry(arch: Arch) -> Vec<MachInst> {
        let mut asm = Assembler::new(arch);
        emitter_for(arch).enter_dart_frame(&mut asm, FunctionId::new(3), 2);
        asm.finalize().insts
    }

    #[test]
    fn frame_entry_matches_the_frame_layout() {
        for arch in Arch::ALL {
            let conv = arch.conventions();
            let insts = frame_entry(arch);
            let pushes = insts
                .iter()
                .filter(|i| matches!(i, MachInst::Push(_) | MachInst::PushImmediate(_)))
                .count() as i32;
            let after_fp = insts
                .iter()
                .position(|i| *i == MachInst::Move { dst: conv.fp, src: conv.sp })
                .unwrap();
            let pushed_after_fp = insts[after_fp..]
                .iter()
                .filter(|i| matches!(i, MachInst::Push(_) | MachInst::PushImmediate(_)))
                .count() as i32;
            // Everything pushed after fp is set up is part of the fixed
            // frame and ends right above the first local.
            let layout = FrameLayout::for_arch(arch);
            assert_eq!(-pushed_after_fp, layout.first_local_from_fp + 1, "{arch}");
            assert!(insts.contains(&MachInst::PushImmediate(pc_marker(FunctionId::new(3)))));
            assert_eq!(pushes, if arch == Arch::Arm { 4 } else { pushed_after_fp + 1 });
        }
    }

    #[test]
    fn only_x86_exchanges_through_memory() {
        let addr = Address::new(Register(5), -12);
        let mut asm = Assembler::new(Arch::Ia32);
        emitter_for(Arch::Ia32).swap_register_with_memory(&mut asm, Register(0), addr);
        assert_eq!(
            asm.finalize().insts,
            vec![MachInst::Exchange { reg: Register(0), addr }]
        );

        let mut asm = Assembler::new(Arch::Arm);
        emitter_for(Arch::Arm).swap_register_with_memory(&mut asm, Register(0), addr);
        let insts = asm.finalize().insts;
        assert_eq!(insts.len(), 3);
        assert!(!insts.iter().any(|i| matches!(i, MachInst::Exchange { .. })));
    }

    #[test]
    fn objects_are_embedded_on_ia32() {
        let mut asm = Assembler::new(Arch::Ia32);
        emitter_for(Arch::Ia32).load_object(
            &mut asm,
            Register(0),
            PoolEntry::Object(ember_il::ir::ConstValue::Null),
        );
        let code = asm.finalize();
        assert_eq!(code.insts, vec![MachInst::LoadEmbedded { dst: Register(0), index: 0 }]);
        assert_eq!(code.object_pool.len(), 1);

        let mut asm = Assembler::new(Arch::X64);
        emitter_for(Arch::X64).compare_object(
            &mut asm,
            Register(0),
            PoolEntry::Object(ember_il::ir::ConstValue::Null),
        );
        let tmp = Arch::X64.conventions().tmp.unwrap();
        assert_eq!(
            asm.finalize().insts,
            vec![
                MachInst::LoadFromPool { dst: tmp, index: 0 },
                MachInst::Compare { lhs: Register(0), rhs: Operand::Reg(tmp) },
            ]
        );
    }
}

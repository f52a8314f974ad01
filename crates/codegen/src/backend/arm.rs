//! 32-bit ARM: calls leave the return address in the link register, which
//! the prologue saves. Objects come from the pool and there is no
//! register-memory exchange, so swaps go through `ip`.

use super::{ArchCodeEmitter, pool_load, reload_caller_pool_pointer};
use crate::{
    assembler::{Address, Assembler, MachInst, Operand},
    compiled_code::PoolEntry,
    isa::{Arch, Register},
};
use ember_il::object_model::FunctionId;

pub struct ArmEmitter;

impl ArmEmitter {
    fn ip(&self) -> Register {
        self.conventions()
            .tmp
            .unwrap_or_else(|| panic!("arm reserves ip as scratch"))
    }

    fn pp(&self) -> Register {
        self.conventions()
            .pp
            .unwrap_or_else(|| panic!("arm has a pool pointer"))
    }

    fn lr(&self) -> Register {
        self.conventions()
            .link
            .unwrap_or_else(|| panic!("arm has a link register"))
    }
}

impl ArchCodeEmitter for ArmEmitter {
    fn arch(&self) -> Arch {
        Arch::Arm
    }

    fn enter_dart_frame(&self, asm: &mut Assembler, function: FunctionId, spill_slots: u32) {
        asm.emit(MachInst::Push(self.lr()));
        self.push_frame_header(asm, function);
        asm.emit(MachInst::Push(self.pp()));
        asm.emit(MachInst::LoadPoolPointer(self.pp()));
        self.reserve_spill_slots(asm, spill_slots);
    }

    fn leave_dart_frame(&self, asm: &mut Assembler) {
        let conv = self.conventions();
        reload_caller_pool_pointer(asm, Arch::Arm);
        asm.emit(MachInst::Move {
            dst: conv.sp,
            src: conv.fp,
        });
        asm.emit(MachInst::Pop(conv.fp));
        asm.emit(MachInst::Pop(self.lr()));
    }

    fn restore_pool_pointer(&self, asm: &mut Assembler) {
        asm.emit(MachInst::LoadPoolPointer(self.pp()));
    }

    fn load_object(&self, asm: &mut Assembler, dst: Register, entry: PoolEntry) {
        pool_load(asm, dst, entry);
    }

    fn push_object(&self, asm: &mut Assembler, entry: PoolEntry) {
        pool_load(asm, self.ip(), entry);
        asm.emit(MachInst::Push(self.ip()));
    }

    fn compare_object(&self, asm: &mut Assembler, lhs: Register, entry: PoolEntry) {
        pool_load(asm, self.ip(), entry);
        asm.emit(MachInst::Compare {
            lhs,
            rhs: Operand::Reg(self.ip()),
        });
    }

    fn swap_registers(&self, asm: &mut Assembler, a: Register, b: Register) {
        let ip = self.ip();
        asm.emit(MachInst::Move { dst: ip, src: a });
        asm.emit(MachInst::Move { dst: a, src: b });
        asm.emit(MachInst::Move { dst: b, src: ip });
    }

    fn swap_register_with_memory(&self, asm: &mut Assembler, reg: Register, addr: Address) {
        let ip = self.ip();
        asm.emit(MachInst::Load { dst: ip, addr });
        asm.emit(MachInst::Store { src: reg, addr });
        asm.emit(MachInst::Move { dst: reg, src: ip });
    }

    fn swap_memory(&self, asm: &mut Assembler, a: Address, b: Address, scratch: Register) {
        // One scratch register: park the first word on the stack. Frame
        // slots are FP-relative, so the push does not move them.
        asm.emit(MachInst::Load { dst: scratch, addr: a });
        asm.emit(MachInst::Push(scratch));
        asm.emit(MachInst::Load { dst: scratch, addr: b });
        asm.emit(MachInst::Store { src: scratch, addr: a });
        asm.emit(MachInst::Pop(scratch));
        asm.emit(MachInst::Store { src: scratch, addr: b });
    }
}

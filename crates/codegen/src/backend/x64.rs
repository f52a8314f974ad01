//! X64: pool pointer in r15, a reserved scratch register, and the only
//! target with unboxed 64-bit integers.

use super::{ArchCodeEmitter, pool_load, reload_caller_pool_pointer};
use crate::{
    assembler::{Address, Assembler, MachInst, Operand},
    compiled_code::PoolEntry,
    isa::{Arch, Register},
};
use ember_il::object_model::FunctionId;

pub struct X64Emitter;

const RAX: Register = Register(0);
const RCX: Register = Register(1);
const RDX: Register = Register(2);

impl X64Emitter {
    fn tmp(&self) -> Register {
        self.conventions()
            .tmp
            .unwrap_or_else(|| panic!("x64 reserves a scratch register"))
    }

    fn pp(&self) -> Register {
        self.conventions()
            .pp
            .unwrap_or_else(|| panic!("x64 has a pool pointer"))
    }
}

impl ArchCodeEmitter for X64Emitter {
    fn arch(&self) -> Arch {
        Arch::X64
    }

    fn enter_dart_frame(&self, asm: &mut Assembler, function: FunctionId, spill_slots: u32) {
        self.push_frame_header(asm, function);
        asm.emit(MachInst::Push(self.pp()));
        asm.emit(MachInst::LoadPoolPointer(self.pp()));
        self.reserve_spill_slots(asm, spill_slots);
    }

    fn leave_dart_frame(&self, asm: &mut Assembler) {
        let conv = self.conventions();
        reload_caller_pool_pointer(asm, Arch::X64);
        asm.emit(MachInst::Move {
            dst: conv.sp,
            src: conv.fp,
        });
        asm.emit(MachInst::Pop(conv.fp));
    }

    fn restore_pool_pointer(&self, asm: &mut Assembler) {
        asm.emit(MachInst::LoadPoolPointer(self.pp()));
    }

    fn load_object(&self, asm: &mut Assembler, dst: Register, entry: PoolEntry) {
        pool_load(asm, dst, entry);
    }

    fn push_object(&self, asm: &mut Assembler, entry: PoolEntry) {
        pool_load(asm, self.tmp(), entry);
        asm.emit(MachInst::Push(self.tmp()));
    }

    fn compare_object(&self, asm: &mut Assembler, lhs: Register, entry: PoolEntry) {
        pool_load(asm, self.tmp(), entry);
        asm.emit(MachInst::Compare {
            lhs,
            rhs: Operand::Reg(self.tmp()),
        });
    }

    fn swap_registers(&self, asm: &mut Assembler, a: Register, b: Register) {
        asm.emit(MachInst::ExchangeRegs(a, b));
    }

    fn swap_register_with_memory(&self, asm: &mut Assembler, reg: Register, addr: Address) {
        asm.emit(MachInst::Exchange { reg, addr });
    }

    fn swap_memory(&self, asm: &mut Assembler, a: Address, b: Address, scratch: Register) {
        asm.emit(MachInst::Load { dst: scratch, addr: a });
        asm.emit(MachInst::Exchange { reg: scratch, addr: b });
        asm.emit(MachInst::Store { src: scratch, addr: a });
    }

    fn shift_count_register(&self) -> Option<Register> {
        Some(RCX)
    }

    fn division_registers(&self) -> Option<(Register, Register)> {
        Some((RAX, RDX))
    }

    fn supports_unboxed_int64(&self) -> bool {
        true
    }
}

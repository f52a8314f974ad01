//! IA32: no pool pointer and no spare scratch register. Objects are
//! embedded in the instruction stream, division and variable shifts use
//! fixed registers, and 64-bit integers do not fit a register.

use super::ArchCodeEmitter;
use crate::{
    assembler::{Address, Assembler, MachInst},
    compiled_code::PoolEntry,
    isa::{Arch, Register},
};
use ember_il::object_model::FunctionId;

pub struct Ia32Emitter;

const EAX: Register = Register(0);
const ECX: Register = Register(1);
const EDX: Register = Register(2);

impl ArchCodeEmitter for Ia32Emitter {
    fn arch(&self) -> Arch {
        Arch::Ia32
    }

    fn enter_dart_frame(&self, asm: &mut Assembler, function: FunctionId, spill_slots: u32) {
        self.push_frame_header(asm, function);
        self.reserve_spill_slots(asm, spill_slots);
    }

    fn leave_dart_frame(&self, asm: &mut Assembler) {
        let conv = self.conventions();
        asm.emit(MachInst::Move {
            dst: conv.sp,
            src: conv.fp,
        });
        asm.emit(MachInst::Pop(conv.fp));
    }

    fn restore_pool_pointer(&self, _asm: &mut Assembler) {}

    fn load_object(&self, asm: &mut Assembler, dst: Register, entry: PoolEntry) {
        let index = asm.object_index(entry);
        asm.emit(MachInst::LoadEmbedded { dst, index });
    }

    fn push_object(&self, asm: &mut Assembler, entry: PoolEntry) {
        let index = asm.object_index(entry);
        asm.emit(MachInst::PushEmbedded(index));
    }

    fn compare_object(&self, asm: &mut Assembler, lhs: Register, entry: PoolEntry) {
        let index = asm.object_index(entry);
        asm.emit(MachInst::CompareEmbedded { lhs, index });
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
        Some(ECX)
    }

    fn division_registers(&self) -> Option<(Register, Register)> {
        Some((EAX, EDX))
    }
}

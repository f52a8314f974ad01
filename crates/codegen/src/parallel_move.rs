//! Sequentializes a set of simultaneous moves.
//!
//! Moves are performed in dependency order. A move whose destination is
//! still needed as a source is deferred until its readers are done;
//! cycles are broken with a swap, after which the sources of the other
//! moves in the cycle are rewritten. Constant moves never block anything
//! and are emitted last.
//!
//! At most one scratch register and one scratch FPU register are in use
//! at any time. Targets without a reserved scratch register borrow one
//! that no remaining move touches, or spill one around its use.

use crate::{
    assembler::{Assembler, MachInst},
    backend::ArchCodeEmitter,
    compiled_code::PoolEntry,
    isa::{Arch, FpuRegister, Register},
    layout,
    locations::Location,
};
use bumpalo::{Bump, collections::Vec as BumpVec};
use ember_il::{
    FlowGraph,
    ir::{ConstValue, Representation},
};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MoveOperands {
    pub src: Location,
    pub dst: Location,
    /// Representation of the moved value; decides how constants are
    /// materialized.
    pub rep: Representation,
}

impl MoveOperands {
    pub fn new(src: Location, dst: Location, rep: Representation) -> Self {
        Self { src, dst, rep }
    }
}

#[derive(Copy, Clone, Debug)]
struct PendingMove {
    src: Location,
    dst: Location,
    rep: Representation,
    pending: bool,
    eliminated: bool,
}

impl PendingMove {
    /// Whether performing this move still needs the value at `loc`.
    fn blocks(&self, loc: &Location, arch: Arch) -> bool {
        !self.eliminated && !self.src.is_constant() && self.src.overlaps(loc, arch)
    }

    fn uses_register(&self, reg: Register) -> bool {
        !self.eliminated
            && (self.src == Location::Register(reg) || self.dst == Location::Register(reg))
    }
}

pub struct ParallelMoveResolver<'a, 'bump> {
    asm: &'a mut Assembler,
    emitter: &'static dyn ArchCodeEmitter,
    graph: &'a FlowGraph,
    moves: BumpVec<'bump, PendingMove>,
    /// Locations of moves dropped because their source is their
    /// destination. Their values are live and must not be used as scratch.
    unmoved: BumpVec<'bump, Location>,
}

impl<'a, 'bump> ParallelMoveResolver<'a, 'bump> {
    pub fn new(
        asm: &'a mut Assembler,
        emitter: &'static dyn ArchCodeEmitter,
        graph: &'a FlowGraph,
        bump: &'bump Bump,
    ) -> Self {
        Self {
            asm,
            emitter,
            graph,
            moves: BumpVec::new_in(bump),
            unmoved: BumpVec::new_in(bump),
        }
    }

    /// Emits code performing all `moves` as if simultaneously.
    pub fn resolve(mut self, moves: &[MoveOperands]) {
        self.unmoved.extend(
            moves
                .iter()
                .filter(|m| !m.dst.is_invalid() && m.src == m.dst)
                .map(|m| m.dst),
        );
        self.moves.extend(
            moves
                .iter()
                .filter(|m| !m.dst.is_invalid() && m.src != m.dst)
                .map(|m| PendingMove {
                    src: m.src,
                    dst: m.dst,
                    rep: m.rep,
                    pending: false,
                    eliminated: false,
                }),
        );

        for i in 0..self.moves.len() {
            let mv = &self.moves[i];
            if !mv.eliminated && !mv.src.is_constant() {
                self.perform_move(i);
            }
        }
        for i in 0..self.moves.len() {
            if !self.moves[i].eliminated {
                debug_assert!(self.moves[i].src.is_constant());
                self.emit_move(i);
            }
        }
    }

    fn arch(&self) -> Arch {
        self.asm.arch()
    }

    fn perform_move(&mut self, index: usize) {
        let arch = self.arch();
        let dst = self.moves[index].dst;
        self.moves[index].pending = true;

        for i in 0..self.moves.len() {
            let other = &self.moves[i];
            if !other.pending && other.blocks(&dst, arch) {
                self.perform_move(i);
            }
        }
        self.moves[index].pending = false;

        // A swap performed further down may have made this move redundant.
        if self.moves[index].src == dst {
            self.moves[index].eliminated = true;
            return;
        }
        // The only blocker left is a move further up the recursion: a cycle.
        if (0..self.moves.len()).any(|i| i != index && self.moves[i].blocks(&dst, arch)) {
            self.emit_swap(index);
            return;
        }
        self.emit_move(index);
    }

    fn emit_move(&mut self, index: usize) {
        let PendingMove { src, dst, rep, .. } = self.moves[index];
        let arch = self.arch();
        let conv = arch.conventions();
        match (src, dst) {
            (Location::Register(s), Location::Register(d)) => {
                self.asm.emit(MachInst::Move { dst: d, src: s });
            }
            (Location::Register(s), Location::StackSlot(_)) => {
                self.asm.emit(MachInst::Store {
                    src: s,
                    addr: dst.stack_address(arch),
                });
            }
            (Location::StackSlot(_), Location::Register(d)) => {
                self.asm.emit(MachInst::Load {
                    dst: d,
                    addr: src.stack_address(arch),
                });
            }
            (Location::StackSlot(_), Location::StackSlot(_)) => {
                self.with_scratch(index, |asm, scratch| {
                    asm.emit(MachInst::Load {
                        dst: scratch,
                        addr: src.stack_address(arch),
                    });
                    asm.emit(MachInst::Store {
                        src: scratch,
                        addr: dst.stack_address(arch),
                    });
                });
            }
            (Location::FpuRegister(s), Location::FpuRegister(d)) => {
                self.asm.emit(MachInst::MoveFpu { dst: d, src: s });
            }
            (Location::FpuRegister(s), Location::DoubleStackSlot(_)) => {
                self.asm.emit(MachInst::StoreFpu {
                    src: s,
                    addr: dst.stack_address(arch),
                });
            }
            (Location::DoubleStackSlot(_), Location::FpuRegister(d)) => {
                self.asm.emit(MachInst::LoadFpu {
                    dst: d,
                    addr: src.stack_address(arch),
                });
            }
            (Location::DoubleStackSlot(_), Location::DoubleStackSlot(_)) => {
                self.asm.emit(MachInst::LoadFpu {
                    dst: conv.fpu_tmp,
                    addr: src.stack_address(arch),
                });
                self.asm.emit(MachInst::StoreFpu {
                    src: conv.fpu_tmp,
                    addr: dst.stack_address(arch),
                });
            }
            (Location::Constant(def), _) => {
                let value = self
                    .graph
                    .constant_value(def)
                    .unwrap_or_else(|| panic!("constant location of a non-constant"))
                    .clone();
                match dst {
                    Location::Register(d) => {
                        load_constant(self.asm, self.emitter, &value, rep, d);
                    }
                    Location::FpuRegister(d) => {
                        load_double_constant(self.asm, &value, d);
                    }
                    Location::StackSlot(_) => {
                        let emitter = self.emitter;
                        self.with_scratch(index, |asm, scratch| {
                            load_constant(asm, emitter, &value, rep, scratch);
                            asm.emit(MachInst::Store {
                                src: scratch,
                                addr: dst.stack_address(arch),
                            });
                        });
                    }
                    Location::DoubleStackSlot(_) => {
                        load_double_constant(self.asm, &value, conv.fpu_tmp);
                        self.asm.emit(MachInst::StoreFpu {
                            src: conv.fpu_tmp,
                            addr: dst.stack_address(arch),
                        });
                    }
                    other => panic!("bad constant move destination {other:?}"),
                }
            }
            (src, dst) => panic!("unsupported move {src:?} -> {dst:?}"),
        }
        self.moves[index].eliminated = true;
    }

    fn emit_swap(&mut self, index: usize) {
        let PendingMove { src, dst, .. } = self.moves[index];
        let arch = self.arch();
        let conv = arch.conventions();
        let emitter = self.emitter;
        match (src, dst) {
            (Location::Register(a), Location::Register(b)) => {
                emitter.swap_registers(self.asm, a, b);
            }
            (Location::Register(reg), Location::StackSlot(_))
            | (Location::StackSlot(_), Location::Register(reg)) => {
                let slot = if src.is_register() { dst } else { src };
                emitter.swap_register_with_memory(self.asm, reg, slot.stack_address(arch));
            }
            (Location::StackSlot(_), Location::StackSlot(_)) => {
                self.with_scratch(index, |asm, scratch| {
                    emitter.swap_memory(
                        asm,
                        src.stack_address(arch),
                        dst.stack_address(arch),
                        scratch,
                    );
                });
            }
            (Location::FpuRegister(a), Location::FpuRegister(b)) => {
                self.asm.emit(MachInst::MoveFpu {
                    dst: conv.fpu_tmp,
                    src: a,
                });
                self.asm.emit(MachInst::MoveFpu { dst: a, src: b });
                self.asm.emit(MachInst::MoveFpu {
                    dst: b,
                    src: conv.fpu_tmp,
                });
            }
            (Location::FpuRegister(reg), Location::DoubleStackSlot(_))
            | (Location::DoubleStackSlot(_), Location::FpuRegister(reg)) => {
                let addr = if src.is_fpu_register() { dst } else { src }.stack_address(arch);
                self.asm.emit(MachInst::LoadFpu {
                    dst: conv.fpu_tmp,
                    addr,
                });
                self.asm.emit(MachInst::StoreFpu { src: reg, addr });
                self.asm.emit(MachInst::MoveFpu {
                    dst: reg,
                    src: conv.fpu_tmp,
                });
            }
            (Location::DoubleStackSlot(_), Location::DoubleStackSlot(_)) => {
                // Word by word, so that one scratch register suffices.
                let words = 8 / arch.word_size() as i32;
                self.with_scratch(index, |asm, scratch| {
                    let (a, b) = (src.stack_address(arch), dst.stack_address(arch));
                    for word in 0..words {
                        let bytes = word * arch.word_size() as i32;
                        emitter.swap_memory(asm, a.offset_by(bytes), b.offset_by(bytes), scratch);
                    }
                });
            }
            (src, dst) => panic!("unsupported swap {src:?} <-> {dst:?}"),
        }
        self.moves[index].eliminated = true;

        // Whatever was read from one side now lives on the other.
        for mv in self.moves.iter_mut() {
            if mv.eliminated {
                continue;
            }
            if mv.src == src {
                mv.src = dst;
            } else if mv.src == dst {
                mv.src = src;
            }
        }
    }

    /// Runs `f` with a general purpose scratch register.
    fn with_scratch(&mut self, index: usize, f: impl FnOnce(&mut Assembler, Register)) {
        let conv = self.arch().conventions();
        if let Some(tmp) = conv.tmp {
            f(self.asm, tmp);
            return;
        }
        // A register is free if no remaining move reads it, no finished
        // move left its result there and no identity move keeps it live.
        let moves = &self.moves;
        let unmoved = &self.unmoved;
        let is_free = |reg: Register| {
            let loc = Location::Register(reg);
            !moves[index].uses_register(reg)
                && !unmoved.contains(&loc)
                && !moves.iter().any(|m| {
                    (!m.eliminated && m.src == loc) || (m.eliminated && m.dst == loc)
                })
        };
        if let Some(reg) = conv.allocatable.iter().copied().find(|&r| is_free(r)) {
            f(self.asm, reg);
            return;
        }
        let reg = conv
            .allocatable
            .iter()
            .copied()
            .find(|&r| !moves[index].uses_register(r))
            .unwrap_or_else(|| panic!("no register to spill on {}", conv.arch));
        self.asm.emit(MachInst::Push(reg));
        f(self.asm, reg);
        self.asm.emit(MachInst::Pop(reg));
    }
}

/// Loads a constant into a general purpose register, tagged or as a raw
/// integer depending on `rep`.
pub(crate) fn load_constant(
    asm: &mut Assembler,
    emitter: &dyn ArchCodeEmitter,
    value: &ConstValue,
    rep: Representation,
    dst: Register,
) {
    let arch = asm.arch();
    match (rep, value) {
        (Representation::UnboxedInt64, ConstValue::Int(v)) => {
            emitter.load_immediate(asm, dst, *v);
        }
        (_, ConstValue::Int(v)) if arch.is_smi(*v) => {
            emitter.load_immediate(asm, dst, layout::tag_smi(*v));
        }
        (Representation::UnboxedInt64 | Representation::UnboxedDouble, value) => {
            panic!("constant {value} cannot be unboxed into {}", rep.name())
        }
        (_, value) => emitter.load_object(asm, dst, PoolEntry::Object(value.clone())),
    }
}

pub(crate) fn load_double_constant(asm: &mut Assembler, value: &ConstValue, dst: FpuRegister) {
    let double = match value {
        ConstValue::Double(d) => *d,
        ConstValue::Int(v) => *v as f64,
        other => panic!("constant {other} is not a number"),
    };
    asm.emit(MachInst::LoadFpuImmediate {
        dst,
        bits: double.to_bits(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::emitter_for, simulator::Machine};
    use ember_il::parser::parse_program;
    use indoc::indoc;

    fn empty_graph() -> FlowGraph {
        parse_program(indoc! {"
            (graph f
                (block B0 graph_entry (v0 constant 42))
                (block B1 function_entry
                    (return v0)))
        "})
        .unwrap()
        .into_first()
        .unwrap()
        .graph
    }

    /// Runs `moves` on a machine whose every location holds a distinct
    /// value and checks the result against the moves' meaning.
    fn check_moves(arch: Arch, moves: &[MoveOperands]) {
        let graph = empty_graph();
        let bump = Bump::new();
        let mut asm = Assembler::new(arch);
        ParallelMoveResolver::new(&mut asm, emitter_for(arch), &graph, &bump).resolve(moves);
        let code = asm.finalize();

        let mut machine = Machine::new(arch);
        let mut seed = 1000;
        let mut initial = Vec::new();
        for m in moves {
            for loc in [m.src, m.dst] {
                if !loc.is_constant() && !initial.iter().any(|(l, _)| *l == loc) {
                    seed += 8;
                    machine.write_location(loc, seed);
                    initial.push((loc, seed));
                }
            }
        }
        let sp_before = machine.sp();
        machine.run_straight_line(&code.insts);
        assert_eq!(machine.sp(), sp_before, "unbalanced scratch spill on {arch}");

        for m in moves {
            let expected = initial
                .iter()
                .find(|(l, _)| *l == m.src)
                .map(|(_, v)| *v)
                .unwrap_or_else(|| layout::tag_smi(42));
            assert_eq!(
                machine.read_location(m.dst),
                expected,
                "{arch}: {:?} -> {:?}\n{:#?}",
                m.src,
                m.dst,
                code.insts
            );
        }
        // Locations that are not written keep their value.
        for (loc, value) in &initial {
            if !moves.iter().any(|m| m.dst == *loc) {
                assert_eq!(machine.read_location(*loc), *value);
            }
        }
    }

    fn tagged(src: Location, dst: Location) -> MoveOperands {
        MoveOperands::new(src, dst, Representation::Tagged)
    }

    fn permutations(items: &[Location]) -> Vec<Vec<Location>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let first = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, first);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn every_permutation_is_resolved() {
        for arch in Arch::ALL {
            let conv = arch.conventions();
            let locations = [
                Location::Register(conv.allocatable[0]),
                Location::Register(conv.allocatable[1]),
                Location::StackSlot(-3),
                Location::StackSlot(-4),
            ];
            for perm in permutations(&locations) {
                let moves: Vec<_> = locations
                    .iter()
                    .zip(&perm)
                    .map(|(&src, &dst)| tagged(src, dst))
                    .collect();
                check_moves(arch, &moves);
            }
        }
    }

    #[test]
    fn registers_moved_onto_themselves_are_not_used_as_scratch() {
        for arch in Arch::ALL {
            let conv = arch.conventions();
            let mut moves: Vec<_> = conv
                .allocatable
                .iter()
                .map(|&r| tagged(Location::Register(r), Location::Register(r)))
                .collect();
            moves.push(tagged(Location::StackSlot(-3), Location::StackSlot(-4)));
            moves.push(tagged(Location::StackSlot(-4), Location::StackSlot(-3)));
            check_moves(arch, &moves);
        }
    }

    #[test]
    fn long_stack_cycles_use_one_scratch_register() {
        for arch in Arch::ALL {
            let slots: Vec<_> = (0..6).map(|i| Location::StackSlot(-3 - i)).collect();
            let moves: Vec<_> = (0..slots.len())
                .map(|i| tagged(slots[i], slots[(i + 1) % slots.len()]))
                .collect();
            check_moves(arch, &moves);
        }
    }

    #[test]
    fn all_registers_busy_forces_a_spill_on_ia32() {
        let conv = Arch::Ia32.conventions();
        let regs: Vec<_> = conv.allocatable.iter().map(|&r| Location::Register(r)).collect();
        let mut moves: Vec<_> = (0..regs.len())
            .map(|i| tagged(regs[i], regs[(i + 1) % regs.len()]))
            .collect();
        moves.push(tagged(Location::StackSlot(-3), Location::StackSlot(-4)));
        moves.push(tagged(Location::StackSlot(-4), Location::StackSlot(-3)));
        check_moves(Arch::Ia32, &moves);
    }

    #[test]
    fn fanout_and_constants() {
        for arch in Arch::ALL {
            let conv = arch.conventions();
            let graph = empty_graph();
            let constant = graph.blocks[graph.graph_entry()].initial_definitions[0];
            let r0 = Location::Register(conv.allocatable[0]);
            let moves = [
                tagged(r0, Location::StackSlot(-3)),
                tagged(r0, Location::StackSlot(-4)),
                tagged(Location::Constant(constant), r0),
                tagged(Location::Constant(constant), Location::StackSlot(-5)),
            ];
            check_moves(arch, &moves);
        }
    }

    #[test]
    fn double_slots_swap_word_by_word() {
        for arch in Arch::ALL {
            let words = (8 / arch.word_size()) as i32;
            let a = Location::DoubleStackSlot(-3 - words + 1);
            let b = Location::DoubleStackSlot(-3 - 2 * words + 1);
            let moves = [
                MoveOperands::new(a, b, Representation::UnboxedDouble),
                MoveOperands::new(b, a, Representation::UnboxedDouble),
            ];
            check_moves(arch, &moves);
        }
    }
}

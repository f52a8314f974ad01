//! The flow graph compiler: turns one optimized flow graph into
//! [`CompiledCode`] for a target architecture.
//!
//! Every SSA value lives in its frame home between instructions (see
//! [`FrameAllocation`]). Each instruction declares a [`LocationSummary`],
//! has its inputs moved into registers by the parallel move resolver,
//! runs its body, and writes its output back to its home. Guards branch
//! to per-point deoptimization stubs and calls out of line code paths
//! are emitted after the last block.

use crate::{
    CodegenError,
    assembler::{Assembler, Condition, Label, MachInst},
    backend::{ArchCodeEmitter, emitter_for},
    compiled_code::{
        CatchEntry, CodeMetadata, CompiledCode, PcDescriptor, PcDescriptorKind, PoolEntry, StackMap,
    },
    deopt::{CompilerDeoptInfo, DeoptInfoBuilder, DeoptReason},
    frame::{FrameAllocation, fuses_into_branch},
    isa::{Arch, Register, RegisterConventions},
    locations::{AllocatedLocations, Location, LocationSummary},
    parallel_move::{MoveOperands, ParallelMoveResolver},
    stubs::{CallTarget, RuntimeEntry, StubId},
};
use bumpalo::{Bump, collections::Vec as BumpVec};
use compact_str::CompactString;
use cranelift_entity::SecondaryMap;
use ember_core::CompilerConfig;
use ember_il::{
    Bailout, BlockId, DeoptId, FlowGraph, InstrId, InstrKind,
    feedback::TypeFeedback,
    ir::{BlockKind, ConstValue, Representation, Token},
};
use smallvec::SmallVec;
use std::cell::{LazyCell, RefCell};
use tracing::{debug, debug_span, trace};

mod calls;
mod instrs;
mod params;
mod type_test;

/// Scratch memory reused across compilations on one thread.
#[derive(Default)]
struct CompilerCx {
    bump: Bump,
}

impl CompilerCx {
    fn reset(&mut self) {
        self.bump.reset();
    }
}

thread_local! {
    static COMPILER_CX: LazyCell<RefCell<CompilerCx>> = LazyCell::new(Default::default);
}

/// Generates code for `graph`, which must have been through the
/// optimization pipeline (or at least be in SSA form with arguments
/// lowered to `MoveArgument`s).
pub fn compile(
    graph: &FlowGraph,
    feedback: &TypeFeedback,
    config: &CompilerConfig,
    arch: Arch,
) -> Result<CompiledCode, CodegenError> {
    let _span = debug_span!("compile", function = graph.name(), %arch).entered();
    COMPILER_CX.with(|cx| {
        let mut cx = cx.borrow_mut();
        let result = FlowGraphCompiler::new(graph, feedback, config, arch, &cx.bump)
            .and_then(FlowGraphCompiler::compile);
        cx.reset();
        let code = result?;
        debug!(
            size = code.size(),
            descriptors = code.pc_descriptors.len(),
            deopt_points = code.deopt_table.len(),
            "compiled"
        );
        if config.print_flow_graph && config.should_print(graph.name()) {
            trace!("\n{}", code.disassemble());
        }
        Ok(code)
    })
}

/// Out of line code emitted after the last block.
pub(crate) enum SlowPath {
    /// The usage counter reached the optimization threshold.
    OptimizeFunction { entry: Label, exit: Label },
    StackOverflow {
        instr: InstrId,
        entry: Label,
        exit: Label,
    },
    /// A runtime entry that throws, with its arguments in registers.
    Throw {
        instr: InstrId,
        entry: Label,
        runtime: RuntimeEntry,
        args: SmallVec<[Register; 2]>,
    },
    /// Operands of a checked smi operation were not both smis, or the
    /// fast path overflowed: call the operator.
    CheckedSmi {
        instr: InstrId,
        entry: Label,
        exit: Label,
        op: Token,
        left: Register,
        right: Register,
        out: Register,
    },
    /// The int64 value does not fit in a smi.
    BoxInt64 {
        instr: InstrId,
        entry: Label,
        exit: Label,
        value: Register,
        out: Register,
    },
    /// Argument shape mismatch in the prologue.
    NoSuchMethod { entry: Label },
}

pub(crate) struct FlowGraphCompiler<'a> {
    graph: &'a FlowGraph,
    feedback: &'a TypeFeedback,
    config: &'a CompilerConfig,
    bump: &'a Bump,
    arch: Arch,
    emitter: &'static dyn ArchCodeEmitter,
    conv: &'static RegisterConventions,
    asm: Assembler,
    frame: FrameAllocation,
    block_labels: SecondaryMap<BlockId, Option<Label>>,
    block_order: Vec<BlockId>,
    normal_entry: BlockId,
    current_block: BlockId,
    next_block: Option<BlockId>,
    slow_paths: Vec<SlowPath>,
    /// Eager and lazy deoptimization points, in the order they are
    /// numbered in the deopt table.
    deopt_infos: Vec<CompilerDeoptInfo>,
    metadata: CodeMetadata,
    next_subtype_test_cache: u32,
    no_such_method: Option<Label>,
}

impl<'a> FlowGraphCompiler<'a> {
    fn new(
        graph: &'a FlowGraph,
        feedback: &'a TypeFeedback,
        config: &'a CompilerConfig,
        arch: Arch,
        bump: &'a Bump,
    ) -> Result<Self, CodegenError> {
        let normal_entry = graph.normal_entry().ok_or_else(|| Bailout::Unsupported {
            function: graph.name().into(),
            what: "a graph without a function entry".into(),
        })?;
        let frame = FrameAllocation::allocate(graph, arch)?;
        let mut asm = Assembler::new(arch);
        let block_order: Vec<BlockId> = graph
            .reverse_postorder()
            .iter()
            .copied()
            .filter(|&b| !matches!(graph.blocks[b].kind, BlockKind::Graph(_)))
            .collect();
        let mut block_labels = SecondaryMap::new();
        for &block in &block_order {
            block_labels[block] = Some(asm.new_label());
        }
        Ok(Self {
            graph,
            feedback,
            config,
            bump,
            arch,
            emitter: emitter_for(arch),
            conv: arch.conventions(),
            asm,
            frame,
            block_labels,
            block_order,
            normal_entry,
            current_block: normal_entry,
            next_block: None,
            slow_paths: Vec::new(),
            deopt_infos: Vec::new(),
            metadata: CodeMetadata::default(),
            next_subtype_test_cache: 0,
            no_such_method: None,
        })
    }

    fn compile(mut self) -> Result<CompiledCode, CodegenError> {
        self.emit_frame_entry();

        if self.block_order.first() != Some(&self.normal_entry) {
            let target = self.block_label(self.normal_entry);
            self.asm.emit(MachInst::Jump(target));
        }
        let order = std::mem::take(&mut self.block_order);
        for (i, &block) in order.iter().enumerate() {
            self.next_block = order.get(i + 1).copied();
            self.emit_block(block)?;
        }
        self.block_order = order;

        self.generate_deferred_code()?;
        Ok(self.finalize())
    }

    fn emit_frame_entry(&mut self) {
        let graph = self.graph;
        let info = graph.function_info();
        self.emitter.enter_dart_frame(
            &mut self.asm,
            graph.function,
            self.frame.spill_slot_count(),
        );
        if let Some(threshold) = self.config.optimization_counter_threshold {
            if !info.is_force_optimized {
                self.emit_usage_counter_check(threshold);
            }
        }
        if self.frame.copies_parameters() {
            self.copy_parameters();
        } else if matches!(info.kind, ember_il::object_model::FunctionKind::Closure) {
            self.check_argument_count();
        }
    }

    /// Bumps the function's usage counter and requests optimization once
    /// it reaches `threshold`.
    fn emit_usage_counter_check(&mut self, threshold: u32) {
        let function = self.conv.ic_data;
        let counter = self.conv.result;
        let word = crate::layout::function::USAGE_COUNTER_WORD;
        self.emitter.load_object(
            &mut self.asm,
            function,
            PoolEntry::Function(self.graph.function),
        );
        self.emitter.load_field(&mut self.asm, counter, function, word);
        self.asm.emit(MachInst::Alu {
            op: crate::assembler::AluOp::Add,
            dst: counter,
            src: crate::assembler::Operand::Imm(crate::layout::tag_smi(1)),
        });
        self.emitter.store_field(&mut self.asm, counter, function, word);
        self.asm.emit(MachInst::Compare {
            lhs: counter,
            rhs: crate::assembler::Operand::Imm(crate::layout::tag_smi(i64::from(threshold))),
        });
        let entry = self.asm.new_label();
        let exit = self.asm.new_label();
        self.asm.emit(MachInst::BranchIf {
            cond: Condition::GreaterEqual,
            target: entry,
        });
        self.asm.bind(exit);
        self.slow_paths.push(SlowPath::OptimizeFunction { entry, exit });
    }

    fn emit_block(&mut self, block: BlockId) -> Result<(), CodegenError> {
        let graph = self.graph;
        self.current_block = block;
        let label = self.block_label(block);
        self.asm.bind(label);
        trace!(block = ?block, kind = graph.blocks[block].kind.name(), "block");

        match graph.blocks[block].kind {
            BlockKind::OsrEntry => self.emit_osr_entry(),
            BlockKind::CatchBlockEntry { catch_try_index } => {
                self.emit_catch_entry(block, catch_try_index)
            }
            _ => {}
        }

        for instr in graph.block_instrs(block) {
            self.emit_instruction(instr)?;
        }
        Ok(())
    }

    /// Entry from an unoptimized frame interrupted in a loop. Parameters
    /// and locals are already in their homes.
    fn emit_osr_entry(&mut self) {
        let pc_offset = self.asm.code_size();
        self.metadata.osr_entry_pc_offset = Some(pc_offset);
        self.emitter
            .enter_osr_frame(&mut self.asm, self.frame.spill_slot_count());
        self.add_descriptor(PcDescriptorKind::OsrEntry, pc_offset, None, None);
    }

    /// Handler entry. The runtime unwinds to the frame with the exception
    /// and stack trace in registers.
    fn emit_catch_entry(&mut self, block: BlockId, try_index: u32) {
        let graph = self.graph;
        self.metadata.catch_entries.push(CatchEntry {
            try_index,
            handler_pc_offset: self.asm.code_size(),
        });
        self.emitter
            .enter_osr_frame(&mut self.asm, self.frame.spill_slot_count());
        for &def in &graph.blocks[block].initial_definitions {
            let InstrKind::Parameter(param) = &graph.instrs[def].kind else {
                continue;
            };
            let src = match param.index {
                0 => self.conv.result,
                _ => self.conv.stack_trace,
            };
            self.move_value(
                Location::Register(src),
                self.frame.home(def),
                Representation::Tagged,
            );
        }
    }

    fn block_label(&self, block: BlockId) -> Label {
        self.block_labels[block]
            .unwrap_or_else(|| panic!("block {block:?} is not emitted"))
    }

    fn generate_deferred_code(&mut self) -> Result<(), CodegenError> {
        let slow_paths = std::mem::take(&mut self.slow_paths);
        for slow_path in slow_paths {
            self.emit_slow_path(slow_path);
        }
        for i in 0..self.deopt_infos.len() {
            let Some(entry) = self.deopt_infos[i].entry_label else {
                continue;
            };
            self.asm.bind(entry);
            if self.config.trap_on_deoptimization {
                self.asm.emit(MachInst::Breakpoint);
            }
            let pc_offset = self
                .emitter
                .call(&mut self.asm, CallTarget::Stub(StubId::Deoptimize));
            self.deopt_infos[i].pc_offset = pc_offset;
        }
        Ok(())
    }

    fn emit_slow_path(&mut self, slow_path: SlowPath) {
        match slow_path {
            SlowPath::OptimizeFunction { entry, exit } => {
                self.asm.bind(entry);
                let pc_offset = self
                    .emitter
                    .call(&mut self.asm, CallTarget::Stub(StubId::OptimizeFunction));
                self.add_descriptor(PcDescriptorKind::OtherCall, pc_offset, None, None);
                // Nothing in the frame has been written yet.
                self.metadata.stack_maps.push(StackMap {
                    pc_offset,
                    spill_slots: vec![false; self.frame.spill_slot_count() as usize],
                    outgoing_arguments: 0,
                });
                self.asm.emit(MachInst::Jump(exit));
            }
            SlowPath::StackOverflow { instr, entry, exit } => {
                self.asm.bind(entry);
                let pc_offset = self
                    .emitter
                    .call(&mut self.asm, CallTarget::Stub(StubId::StackOverflow));
                self.emit_call_metadata(instr, pc_offset, PcDescriptorKind::OtherCall, 0);
                self.asm.emit(MachInst::Jump(exit));
            }
            SlowPath::Throw {
                instr,
                entry,
                runtime,
                args,
            } => {
                self.asm.bind(entry);
                for reg in args {
                    self.asm.emit(MachInst::Push(reg));
                }
                self.call_runtime(instr, runtime);
            }
            SlowPath::CheckedSmi {
                instr,
                entry,
                exit,
                op,
                left,
                right,
                out,
            } => self.emit_checked_smi_slow_path(instr, entry, exit, op, [left, right], out),
            SlowPath::BoxInt64 {
                instr,
                entry,
                exit,
                value,
                out,
            } => self.emit_box_int64_slow_path(instr, entry, exit, value, out),
            SlowPath::NoSuchMethod { entry } => {
                self.asm.bind(entry);
                self.emitter.leave_dart_frame(&mut self.asm);
                self.asm.emit(MachInst::TailCall(CallTarget::Stub(
                    StubId::NoSuchMethodDispatcher,
                )));
            }
        }
    }

    fn finalize(mut self) -> CompiledCode {
        let mut builder = DeoptInfoBuilder::new(self.graph, &self.frame);
        for point in &self.deopt_infos {
            let info = point.create_deopt_info(&mut builder);
            self.metadata.deopt_table.add(point, info);
        }
        self.metadata.spill_slot_count = self.frame.spill_slot_count();
        CompiledCode::new(
            self.graph.function,
            self.arch,
            self.asm.finalize(),
            self.metadata,
        )
    }

    // Shared helpers for the instruction emitters.

    pub(crate) fn unsupported(&self, what: impl Into<CompactString>) -> CodegenError {
        CodegenError::Unsupported {
            arch: self.arch,
            what: what.into(),
        }
    }

    fn try_index_of(&self, instr: Option<InstrId>) -> Option<u32> {
        let block = match instr {
            Some(instr) => self.graph.block_of(instr).unwrap_or(self.current_block),
            None => self.current_block,
        };
        self.graph.blocks[block].try_index
    }

    pub(crate) fn add_descriptor(
        &mut self,
        kind: PcDescriptorKind,
        pc_offset: u32,
        deopt_id: Option<DeoptId>,
        instr: Option<InstrId>,
    ) {
        let token_pos = instr
            .map(|instr| self.graph.instrs[instr].token_pos)
            .unwrap_or_default();
        self.metadata.pc_descriptors.push(PcDescriptor {
            kind,
            pc_offset,
            deopt_id,
            token_pos,
            try_index: self.try_index_of(instr),
        });
    }

    fn record_safepoint(&mut self, instr: InstrId, pc_offset: u32, outgoing_arguments: u32) {
        let map = self
            .frame
            .stack_map(self.graph, instr, pc_offset, outgoing_arguments);
        self.metadata.stack_maps.push(map);
    }

    /// Records everything the runtime needs at the return address of a
    /// call made by `instr`: the call descriptor, the stack map, and
    /// where unoptimized code resumes if the frame is deoptimized while
    /// the callee runs.
    pub(crate) fn emit_call_metadata(
        &mut self,
        instr: InstrId,
        pc_offset: u32,
        kind: PcDescriptorKind,
        outgoing_arguments: u32,
    ) {
        let graph = self.graph;
        let data = &graph.instrs[instr];
        self.add_descriptor(kind, pc_offset, data.deopt_id, Some(instr));
        self.record_safepoint(instr, pc_offset, outgoing_arguments);
        let Some(deopt_id) = data.deopt_id else {
            return;
        };
        if !self.config.optimizing {
            self.add_descriptor(
                PcDescriptorKind::Deopt,
                pc_offset,
                Some(deopt_id.after()),
                Some(instr),
            );
        } else if data.env.is_some() && !graph.function_info().is_force_optimized {
            let point = if data.kind.has_unknown_side_effects() {
                CompilerDeoptInfo::at_call(graph, instr, pc_offset)
            } else {
                CompilerDeoptInfo::at_slow_path(graph, instr, pc_offset)
            };
            self.deopt_infos.push(point);
        }
    }

    /// Returns the label of a new eager deoptimization stub for `instr`.
    pub(crate) fn add_deopt_stub(
        &mut self,
        instr: InstrId,
        reason: DeoptReason,
    ) -> Result<Label, CodegenError> {
        let graph = self.graph;
        if graph.function_info().is_force_optimized {
            return Err(Bailout::CannotDeoptimize {
                function: graph.name().into(),
            }
            .into());
        }
        let deopt_id = self.deopt_id_of(instr);
        let label = self.asm.new_label();
        trace!(instr = ?instr, %deopt_id, %reason, "deopt stub");
        self.deopt_infos
            .push(CompilerDeoptInfo::eager(instr, deopt_id, reason, label));
        Ok(label)
    }

    pub(crate) fn deopt_id_of(&self, instr: InstrId) -> DeoptId {
        self.graph.instrs[instr].deopt_id.unwrap_or_else(|| {
            panic!(
                "{} {instr:?} needs a deopt id",
                self.graph.instrs[instr].kind.name()
            )
        })
    }

    /// Calls a runtime entry whose arguments have been pushed, then drops
    /// them. Throwing entries do not return.
    pub(crate) fn call_runtime(&mut self, instr: InstrId, entry: RuntimeEntry) {
        let count = entry.argument_count();
        let pc_offset = self.emitter.call(&mut self.asm, CallTarget::Runtime(entry));
        if entry.is_throwing() {
            self.add_descriptor(PcDescriptorKind::RuntimeCall, pc_offset, None, Some(instr));
            self.record_safepoint(instr, pc_offset, count);
            self.asm.emit(MachInst::Breakpoint);
        } else {
            self.emit_call_metadata(instr, pc_offset, PcDescriptorKind::RuntimeCall, count);
            self.emitter.drop_arguments(&mut self.asm, count);
        }
    }

    /// Calls a stub that can allocate, recording a safepoint for `instr`.
    pub(crate) fn call_allocation_stub(&mut self, instr: InstrId, stub: StubId) {
        debug_assert!(stub.can_allocate());
        let pc_offset = self.emitter.call(&mut self.asm, CallTarget::Stub(stub));
        self.emit_call_metadata(instr, pc_offset, PcDescriptorKind::OtherCall, 0);
    }

    /// Allocates registers for `instr` and moves its inputs into them.
    pub(crate) fn prepare(
        &mut self,
        instr: InstrId,
        summary: &LocationSummary,
    ) -> AllocatedLocations {
        let graph = self.graph;
        let locs = summary.allocate(self.conv);
        let kind = &graph.instrs[instr].kind;
        let mut moves = BumpVec::with_capacity_in(locs.inputs.len(), self.bump);
        for (i, &dst) in locs.inputs.iter().enumerate() {
            let def = graph.input_at(instr, i);
            let src = self.frame.home(def);
            debug_assert!(!src.is_invalid(), "{def:?} has no home");
            let rep = if src.is_constant() {
                kind.required_input_representation(i)
            } else {
                graph.instrs[def].representation
            };
            moves.push(MoveOperands::new(src, dst, rep));
        }
        ParallelMoveResolver::new(&mut self.asm, self.emitter, graph, self.bump).resolve(&moves);
        locs
    }

    /// Writes the output of `instr` from `out` to its home.
    pub(crate) fn store_output(&mut self, instr: InstrId, out: Location) {
        let home = self.frame.home(instr);
        if out.is_invalid() || home.is_invalid() || home == out {
            return;
        }
        let rep = self.graph.instrs[instr].representation;
        self.move_value(out, home, rep);
    }

    pub(crate) fn move_value(&mut self, src: Location, dst: Location, rep: Representation) {
        let moves = [MoveOperands::new(src, dst, rep)];
        ParallelMoveResolver::new(&mut self.asm, self.emitter, self.graph, self.bump)
            .resolve(&moves);
    }

    /// Loads the tagged value of `def` into `dst`.
    pub(crate) fn load_value(&mut self, dst: Register, def: InstrId) {
        self.move_value(
            self.frame.home(def),
            Location::Register(dst),
            Representation::Tagged,
        );
    }

    pub(crate) fn load_bool(&mut self, dst: Register, value: bool) {
        self.emitter.load_object(
            &mut self.asm,
            dst,
            PoolEntry::Object(ConstValue::Bool(value)),
        );
    }

    /// Loads true into `out` if `cond` holds, false otherwise.
    pub(crate) fn materialize_condition(&mut self, cond: Condition, out: Register) {
        let is_true = self.asm.new_label();
        let done = self.asm.new_label();
        self.asm.emit(MachInst::BranchIf {
            cond,
            target: is_true,
        });
        self.load_bool(out, false);
        self.asm.emit(MachInst::Jump(done));
        self.asm.bind(is_true);
        self.load_bool(out, true);
        self.asm.bind(done);
    }

    /// Allocatable registers other than `exclude`, in allocation order.
    pub(crate) fn free_registers<const N: usize>(&self, exclude: &[Register]) -> [Register; N] {
        let mut regs = self
            .conv
            .allocatable
            .iter()
            .copied()
            .filter(|reg| !exclude.contains(reg));
        std::array::from_fn(|_| {
            regs.next()
                .unwrap_or_else(|| panic!("out of registers on {}", self.arch))
        })
    }

    /// Whether `instr` is emitted by the branch that consumes it.
    pub(crate) fn is_fused(&self, instr: InstrId) -> bool {
        fuses_into_branch(self.graph, instr)
    }
}

//! Deoptimization metadata.
//!
//! Every deoptimization point of optimized code carries a [`DeoptInfo`]:
//! a list of [`DeoptInstr`] that tells the runtime how to fill each word
//! of the unoptimized frames replacing the optimized one. The list starts
//! with the objects to materialize (allocations removed by sinking),
//! followed by the frame words in increasing address order:
//!
//! ```text
//!   [pp] pc-marker caller-fp return-address(innermost, deopt id)
//!   materialization arguments
//!   innermost locals, last first
//!   for each outer frame:
//!     [pp] pc-marker caller-fp return-address(outer, call deopt id after)
//!     parameters of the frame inlined into it, last first
//!     outer locals, last first
//!   [caller-pp] pc-marker caller-fp caller-pc
//!   outermost parameters, last first
//! ```

use crate::{
    assembler::Label,
    frame::FrameAllocation,
    locations::Location,
};
use cranelift_entity::EntityRef;
use ember_il::{
    DeoptId, FlowGraph, InstrId, InstrKind,
    ir::{ConstValue, EnvFrame, Representation},
    object_model::{ClassId, FunctionId},
};
use std::fmt::{self, Display, Formatter};
use tracing::trace;

/// Why optimized code gave up.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeoptReason {
    CheckClass,
    HoistedCheckClass,
    CheckSmi,
    HoistedCheckSmi,
    CheckClassId,
    CheckArrayBound,
    CheckNull,
    BinarySmiOp,
    BinaryInt64Op,
    UnaryOp,
    Unbox,
    /// A call returned into code that was invalidated while it ran.
    AtCall,
}

impl DeoptReason {
    pub fn name(self) -> &'static str {
        match self {
            DeoptReason::CheckClass => "CheckClass",
            DeoptReason::HoistedCheckClass => "HoistedCheckClass",
            DeoptReason::CheckSmi => "CheckSmi",
            DeoptReason::HoistedCheckSmi => "HoistedCheckSmi",
            DeoptReason::CheckClassId => "CheckClassId",
            DeoptReason::CheckArrayBound => "CheckArrayBound",
            DeoptReason::CheckNull => "CheckNull",
            DeoptReason::BinarySmiOp => "BinarySmiOp",
            DeoptReason::BinaryInt64Op => "BinaryInt64Op",
            DeoptReason::UnaryOp => "UnaryOp",
            DeoptReason::Unbox => "Unbox",
            DeoptReason::AtCall => "AtCall",
        }
    }
}

impl Display for DeoptReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeoptInstr {
    /// Allocates an instance of `cls`. Its class, field count and
    /// (offset, value) pairs are found among the materialization
    /// arguments of the innermost frame.
    MaterializeObject { cls: ClassId, field_count: u32 },
    /// Pool pointer of `function`'s unoptimized code.
    Pp(FunctionId),
    CallerPp,
    /// PC marker of the frame; `None` for the frame of the deoptimization
    /// stub itself.
    PcMarker(Option<FunctionId>),
    CallerFp,
    /// Return address into `function`'s unoptimized code at `deopt_id`.
    RetAddress { function: FunctionId, deopt_id: DeoptId },
    CallerPc,
    Constant(ConstValue),
    /// A tagged word at the FP-relative word index of the optimized frame.
    StackSlot(i32),
    /// An unboxed double to be boxed.
    DoubleStackSlot(i32),
    /// An unboxed 64-bit integer to be boxed (as a smi when it fits).
    Int64StackSlot(i32),
    /// The object built by materialization `index`.
    MaterializedObjectRef(u32),
}

impl Display for DeoptInstr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DeoptInstr::MaterializeObject { cls, field_count } => {
                write!(f, "mat cid {cls} ({field_count} fields)")
            }
            DeoptInstr::Pp(function) => write!(f, "pp f{}", function.index()),
            DeoptInstr::CallerPp => write!(f, "callerpp"),
            DeoptInstr::PcMarker(Some(function)) => write!(f, "pcmark f{}", function.index()),
            DeoptInstr::PcMarker(None) => write!(f, "pcmark -"),
            DeoptInstr::CallerFp => write!(f, "callerfp"),
            DeoptInstr::RetAddress { function, deopt_id } => {
                write!(f, "ret f{} deopt {deopt_id}", function.index())
            }
            DeoptInstr::CallerPc => write!(f, "callerpc"),
            DeoptInstr::Constant(value) => write!(f, "const {value}"),
            DeoptInstr::StackSlot(index) => write!(f, "s{index:+}"),
            DeoptInstr::DoubleStackSlot(index) => write!(f, "ds{index:+}"),
            DeoptInstr::Int64StackSlot(index) => write!(f, "ms{index:+}"),
            DeoptInstr::MaterializedObjectRef(index) => write!(f, "mat#{index}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeoptInfo {
    pub instructions: Vec<DeoptInstr>,
    /// Index of the first frame word; everything before it describes
    /// materializations.
    pub frame_start: usize,
}

impl DeoptInfo {
    /// Number of words of the unoptimized frames.
    pub fn frame_size(&self) -> usize {
        self.instructions.len() - self.frame_start
    }

    pub fn frame_slots(&self) -> &[DeoptInstr] {
        &self.instructions[self.frame_start..]
    }

    pub fn materializations(&self) -> &[DeoptInstr] {
        &self.instructions[..self.frame_start]
    }
}

impl Display for DeoptInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, instr) in self.instructions.iter().enumerate() {
            if i == self.frame_start {
                writeln!(f, "--")?;
            }
            writeln!(f, "{instr}")?;
        }
        Ok(())
    }
}

/// Accumulates the deopt instructions of one deoptimization point.
///
/// Every `add_*` method after [`mark_frame_start`](Self::mark_frame_start)
/// takes the index of the frame word it fills, which must be the next
/// one.
pub struct DeoptInfoBuilder<'a> {
    graph: &'a FlowGraph,
    frame: &'a FrameAllocation,
    instructions: Vec<DeoptInstr>,
    materializations: Vec<InstrId>,
    frame_start: Option<usize>,
}

impl<'a> DeoptInfoBuilder<'a> {
    pub fn new(graph: &'a FlowGraph, frame: &'a FrameAllocation) -> Self {
        Self {
            graph,
            frame,
            instructions: Vec::new(),
            materializations: Vec::new(),
            frame_start: None,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.instructions.len() - self.frame_start.unwrap_or(0)
    }

    fn push(&mut self, slot_ix: usize, instr: DeoptInstr) {
        debug_assert!(self.frame_start.is_some(), "frame word before the frame start");
        debug_assert_eq!(slot_ix, self.frame_size(), "deopt slots out of order");
        self.instructions.push(instr);
    }

    pub fn mark_frame_start(&mut self) {
        debug_assert!(self.frame_start.is_none());
        self.frame_start = Some(self.instructions.len());
    }

    pub fn add_pp(&mut self, function: FunctionId, slot_ix: usize) {
        self.push(slot_ix, DeoptInstr::Pp(function));
    }

    pub fn add_caller_pp(&mut self, slot_ix: usize) {
        self.push(slot_ix, DeoptInstr::CallerPp);
    }

    pub fn add_pc_marker(&mut self, function: Option<FunctionId>, slot_ix: usize) {
        self.push(slot_ix, DeoptInstr::PcMarker(function));
    }

    pub fn add_caller_fp(&mut self, slot_ix: usize) {
        self.push(slot_ix, DeoptInstr::CallerFp);
    }

    pub fn add_return_address(&mut self, function: FunctionId, deopt_id: DeoptId, slot_ix: usize) {
        self.push(slot_ix, DeoptInstr::RetAddress { function, deopt_id });
    }

    pub fn add_caller_pc(&mut self, slot_ix: usize) {
        self.push(slot_ix, DeoptInstr::CallerPc);
    }

    pub fn add_constant(&mut self, value: ConstValue, slot_ix: usize) {
        self.push(slot_ix, DeoptInstr::Constant(value));
    }

    /// Copies the value of `def` from wherever the optimized frame keeps
    /// it.
    pub fn add_copy(&mut self, def: InstrId, slot_ix: usize) {
        let source = self.copy_source(def);
        self.push(slot_ix, source);
    }

    fn copy_source(&self, def: InstrId) -> DeoptInstr {
        if let InstrKind::MaterializeObject(_) = self.graph.instrs[def].kind {
            let index = self
                .materializations
                .iter()
                .position(|&m| m == def)
                .unwrap_or_else(|| panic!("materialization {def:?} was not collected"));
            return DeoptInstr::MaterializedObjectRef(index as u32);
        }
        match self.frame.home(def) {
            Location::Constant(constant) => DeoptInstr::Constant(
                self.graph
                    .constant_value(constant)
                    .cloned()
                    .unwrap_or(ConstValue::OptimizedOut),
            ),
            Location::StackSlot(index) => match self.graph.instrs[def].representation {
                Representation::UnboxedInt64 => DeoptInstr::Int64StackSlot(index),
                _ => DeoptInstr::StackSlot(index),
            },
            Location::DoubleStackSlot(index) => DeoptInstr::DoubleStackSlot(index),
            other => panic!("value {def:?} has no home for deoptimization: {other:?}"),
        }
    }

    /// Registers a materialization, after the materializations its
    /// fields refer to.
    pub fn add_materialization(&mut self, mat: InstrId) {
        if self.materializations.contains(&mat) {
            return;
        }
        debug_assert!(self.frame_start.is_none());
        for input in self.graph.inputs(mat).collect::<Vec<_>>() {
            if let InstrKind::MaterializeObject(_) = self.graph.instrs[input].kind {
                self.add_materialization(input);
            }
        }
        let InstrKind::MaterializeObject(object) = &self.graph.instrs[mat].kind else {
            panic!("{mat:?} is not a materialization");
        };
        let field_count = self.materialized_fields(mat).count() as u32;
        self.instructions.push(DeoptInstr::MaterializeObject {
            cls: object.cls,
            field_count,
        });
        self.materializations.push(mat);
    }

    /// Fields of a materialization that need a store; null fields are
    /// already null in a fresh object.
    fn materialized_fields(&self, mat: InstrId) -> impl Iterator<Item = (u32, InstrId)> + '_ {
        let InstrKind::MaterializeObject(object) = &self.graph.instrs[mat].kind else {
            panic!("{mat:?} is not a materialization");
        };
        object
            .slots
            .iter()
            .zip(self.graph.inputs(mat))
            .filter(|&(_, value)| {
                !self
                    .graph
                    .constant_value(value)
                    .is_some_and(ConstValue::is_null)
            })
            .map(|(slot, value)| (slot.offset_in_words, value))
    }

    /// Emits class, field count and (offset, value) pairs of every
    /// materialization as part of the innermost frame, where the GC can
    /// see them while objects are allocated.
    pub fn emit_materialization_arguments(&mut self, mut slot_ix: usize) -> usize {
        for i in 0..self.materializations.len() {
            let mat = self.materializations[i];
            let InstrKind::MaterializeObject(object) = &self.graph.instrs[mat].kind else {
                unreachable!()
            };
            let fields: Vec<(u32, InstrId)> = self.materialized_fields(mat).collect();
            self.add_constant(ConstValue::Int(i64::from(object.cls)), slot_ix);
            slot_ix += 1;
            self.add_constant(ConstValue::Int(fields.len() as i64), slot_ix);
            slot_ix += 1;
            for (offset, value) in fields {
                self.add_constant(ConstValue::Int(i64::from(offset)), slot_ix);
                slot_ix += 1;
                self.add_copy(value, slot_ix);
                slot_ix += 1;
            }
        }
        slot_ix
    }

    fn finish(&mut self) -> DeoptInfo {
        let frame_start = self
            .frame_start
            .take()
            .unwrap_or_else(|| panic!("deopt info without a frame"));
        self.materializations.clear();
        DeoptInfo {
            instructions: std::mem::take(&mut self.instructions),
            frame_start,
        }
    }
}

/// A deoptimization point recorded while emitting code.
#[derive(Clone, Debug)]
pub struct CompilerDeoptInfo {
    pub instr: InstrId,
    /// Where unoptimized code resumes.
    pub deopt_id: DeoptId,
    pub reason: DeoptReason,
    /// Lazy deoptimization after a call: the call's arguments are gone
    /// from the resumed frame.
    pub drops_arguments: bool,
    /// Start of the out-of-line stub call, for eager deoptimization.
    pub entry_label: Option<Label>,
    /// Return address of the call into the deoptimization stub (eager)
    /// or of the call itself (lazy).
    pub pc_offset: u32,
}

impl CompilerDeoptInfo {
    pub fn eager(instr: InstrId, deopt_id: DeoptId, reason: DeoptReason, entry_label: Label) -> Self {
        Self {
            instr,
            deopt_id,
            reason,
            drops_arguments: false,
            entry_label: Some(entry_label),
            pc_offset: 0,
        }
    }

    /// Deoptimization at the return address of the call `instr`.
    pub fn at_call(graph: &FlowGraph, instr: InstrId, pc_offset: u32) -> Self {
        let data = &graph.instrs[instr];
        let deopt_id = data
            .deopt_id
            .unwrap_or_else(|| panic!("call {instr:?} without a deopt id"));
        let before = data.env.as_ref().is_some_and(|env| env.lazy_deopt_to_before);
        Self {
            instr,
            deopt_id: if before { deopt_id } else { deopt_id.after() },
            reason: DeoptReason::AtCall,
            drops_arguments: !before,
            entry_label: None,
            pc_offset,
        }
    }

    /// Deoptimization at the return address of a runtime or stub call made
    /// by a non-call instruction. Unoptimized code re-executes the
    /// instruction.
    pub fn at_slow_path(graph: &FlowGraph, instr: InstrId, pc_offset: u32) -> Self {
        let deopt_id = graph.instrs[instr]
            .deopt_id
            .unwrap_or_else(|| panic!("{instr:?} calls out without a deopt id"));
        Self {
            instr,
            deopt_id,
            reason: DeoptReason::AtCall,
            drops_arguments: false,
            entry_label: None,
            pc_offset,
        }
    }

    /// Translates the environment of the instruction into deopt
    /// instructions. Returns `None` when the instruction has no
    /// environment.
    pub fn create_deopt_info(&self, builder: &mut DeoptInfoBuilder<'_>) -> Option<DeoptInfo> {
        let graph = builder.graph;
        let env = graph.instrs[self.instr].env.as_ref()?;
        let has_pp = builder.frame.arch().uses_object_pool();
        let value = |frame: &EnvFrame, i: usize| graph.uses[frame.values[i]].definition;

        for frame in &env.frames {
            for &u in &frame.values {
                let def = graph.uses[u].definition;
                if let InstrKind::MaterializeObject(_) = graph.instrs[def].kind {
                    builder.add_materialization(def);
                }
            }
        }
        builder.mark_frame_start();

        let innermost = env.innermost();
        let mut slot_ix = 0;
        if has_pp {
            builder.add_pp(innermost.function, slot_ix);
            slot_ix += 1;
        }
        builder.add_pc_marker(None, slot_ix);
        slot_ix += 1;
        builder.add_caller_fp(slot_ix);
        slot_ix += 1;
        builder.add_return_address(innermost.function, self.deopt_id, slot_ix);
        slot_ix += 1;

        slot_ix = builder.emit_materialization_arguments(slot_ix);

        let fixed = innermost.fixed_parameter_count as usize;
        let mut len = innermost.values.len();
        if self.drops_arguments {
            let data = &graph.instrs[self.instr];
            // Checked smi operations call out with their operands as the
            // arguments.
            let args = if data.kind.is_call() {
                data.argument_count()
            } else {
                data.inputs.len()
            };
            len = len.saturating_sub(args).max(fixed);
        }
        for i in (fixed..len).rev() {
            builder.add_copy(value(innermost, i), slot_ix);
            slot_ix += 1;
        }

        let mut previous = innermost;
        for current in env.frames[..env.frames.len() - 1].iter().rev() {
            if has_pp {
                builder.add_pp(current.function, slot_ix);
                slot_ix += 1;
            }
            builder.add_pc_marker(Some(previous.function), slot_ix);
            slot_ix += 1;
            builder.add_caller_fp(slot_ix);
            slot_ix += 1;
            builder.add_return_address(current.function, current.deopt_id.after(), slot_ix);
            slot_ix += 1;

            // The caller's frame at an inlined call has its outgoing
            // arguments dropped, and the callee may have rebound them; the
            // inlined frame's parameters are the values to restore.
            for i in (0..previous.fixed_parameter_count as usize).rev() {
                builder.add_copy(value(previous, i), slot_ix);
                slot_ix += 1;
            }
            for i in (current.fixed_parameter_count as usize..current.values.len()).rev() {
                builder.add_copy(value(current, i), slot_ix);
                slot_ix += 1;
            }
            previous = current;
        }

        if has_pp {
            builder.add_caller_pp(slot_ix);
            slot_ix += 1;
        }
        builder.add_pc_marker(Some(previous.function), slot_ix);
        slot_ix += 1;
        builder.add_caller_fp(slot_ix);
        slot_ix += 1;
        builder.add_caller_pc(slot_ix);
        slot_ix += 1;
        for i in (0..previous.fixed_parameter_count as usize).rev() {
            builder.add_copy(value(previous, i), slot_ix);
            slot_ix += 1;
        }

        let info = builder.finish();
        debug_assert_eq!(info.frame_size(), slot_ix);
        trace!(deopt_id = %self.deopt_id, reason = %self.reason, words = slot_ix, "deopt info");
        Some(info)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeoptEntry {
    /// Return address identifying the deoptimization point.
    pub pc_offset: u32,
    pub deopt_id: DeoptId,
    pub reason: DeoptReason,
    pub info_number: u32,
}

/// Deoptimization points of one piece of code. Info numbers are dense:
/// a point without an environment still takes a number, with no info.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeoptTable {
    pub entries: Vec<DeoptEntry>,
    pub infos: Vec<Option<DeoptInfo>>,
}

impl DeoptTable {
    pub fn add(&mut self, point: &CompilerDeoptInfo, info: Option<DeoptInfo>) {
        let info_number = self.infos.len() as u32;
        self.infos.push(info);
        self.entries.push(DeoptEntry {
            pc_offset: point.pc_offset,
            deopt_id: point.deopt_id,
            reason: point.reason,
            info_number,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_at(&self, pc_offset: u32) -> Option<&DeoptEntry> {
        self.entries.iter().find(|e| e.pc_offset == pc_offset)
    }

    pub fn info(&self, entry: &DeoptEntry) -> Option<&DeoptInfo> {
        self.infos
            .get(entry.info_number as usize)
            .and_then(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::Arch;
    use ember_il::{object_model::cid, parser::parse_program};
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn find(graph: &FlowGraph, name: &str) -> InstrId {
        graph
            .instrs
            .keys()
            .find(|&i| graph.is_attached(i) && graph.instrs[i].kind.name() == name)
            .unwrap_or_else(|| panic!("no {name} in graph"))
    }

    const INLINED: &str = indoc! {"
        (program
            (class P Object (fields x y))
            (function callee (fixed 1) static)
            (function outer (fixed 2) static)
            (graph outer
                (block B0 graph_entry (v9 constant 7))
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 parameter 1)
                    (v2 materialize_object P (slots (slot x 1) (slot y 2)) v0 null)
                    (v3 binary_smi_op + v0 v1 (deopt 10)
                        (env (frame outer 2 4 v0 v1 v2 v9) (frame callee 1 10 v1 v0)))
                    (return v3))))
    "};

    #[test]
    fn inlined_frames_are_described_innermost_first() {
        let program = parse_program(INLINED).unwrap();
        let graph = &program.functions[0].graph;
        let outer = graph.function;
        let callee = program.classes.function_by_name("callee").unwrap();
        let p = program.classes.class_by_name("P").unwrap();
        assert_eq!(p, cid::NUM_PREDEFINED);

        let frame = FrameAllocation::allocate(graph, Arch::X64).unwrap();
        let add = find(graph, "binary_smi_op");
        let point = CompilerDeoptInfo {
            instr: add,
            deopt_id: DeoptId(10),
            reason: DeoptReason::BinarySmiOp,
            drops_arguments: false,
            entry_label: None,
            pc_offset: 0,
        };
        let mut builder = DeoptInfoBuilder::new(graph, &frame);
        let info = point.create_deopt_info(&mut builder).unwrap();

        use DeoptInstr::*;
        let int = |v: i64| Constant(ConstValue::Int(v));
        assert_eq!(info.materializations(), &[MaterializeObject { cls: p, field_count: 1 }]);
        assert_eq!(
            info.frame_slots(),
            &[
                Pp(callee),
                PcMarker(None),
                CallerFp,
                RetAddress { function: callee, deopt_id: DeoptId(10) },
                // P, one field: x = v0
                int(i64::from(p)),
                int(1),
                int(1),
                StackSlot(3),
                // callee local
                StackSlot(3),
                Pp(outer),
                PcMarker(Some(callee)),
                CallerFp,
                RetAddress { function: outer, deopt_id: DeoptId(5) },
                // callee parameter, read from the callee frame
                StackSlot(2),
                // outer locals, last first
                int(7),
                MaterializedObjectRef(0),
                CallerPp,
                PcMarker(Some(outer)),
                CallerFp,
                CallerPc,
                StackSlot(2),
                StackSlot(3),
            ]
        );
    }

    #[test]
    fn outgoing_arguments_come_from_the_inlined_frame() {
        // The callee rebinds its parameter to 5; the caller's frame no
        // longer holds the argument at all.
        let program = parse_program(indoc! {"
            (program
                (function callee (fixed 1) static)
                (function outer (fixed 1) static)
                (graph outer
                    (block B0 graph_entry (v5 constant 5))
                    (block B1 function_entry
                        (v0 parameter 0)
                        (v1 binary_smi_op + v0 v0 (deopt 10)
                            (env (frame outer 1 4 v0) (frame callee 1 10 v5)))
                        (return v1))))
        "})
        .unwrap();
        let graph = &program.functions[0].graph;
        let outer = graph.function;
        let frame = FrameAllocation::allocate(graph, Arch::X64).unwrap();
        let point = CompilerDeoptInfo {
            instr: find(graph, "binary_smi_op"),
            deopt_id: DeoptId(10),
            reason: DeoptReason::BinarySmiOp,
            drops_arguments: false,
            entry_label: None,
            pc_offset: 0,
        };
        let mut builder = DeoptInfoBuilder::new(graph, &frame);
        let info = point.create_deopt_info(&mut builder).unwrap();

        let slots = info.frame_slots();
        let ret = slots
            .iter()
            .position(|i| matches!(i, DeoptInstr::RetAddress { function, .. } if *function == outer))
            .unwrap();
        assert_eq!(slots[ret + 1], DeoptInstr::Constant(ConstValue::Int(5)));
        assert_eq!(slots[ret + 2], DeoptInstr::CallerPp);
    }

    #[test]
    fn ia32_frames_have_no_pool_pointers() {
        let program = parse_program(INLINED).unwrap();
        let graph = &program.functions[0].graph;
        let frame = FrameAllocation::allocate(graph, Arch::Ia32).unwrap();
        let add = find(graph, "binary_smi_op");
        let point = CompilerDeoptInfo {
            instr: add,
            deopt_id: DeoptId(10),
            reason: DeoptReason::BinarySmiOp,
            drops_arguments: false,
            entry_label: None,
            pc_offset: 0,
        };
        let mut builder = DeoptInfoBuilder::new(graph, &frame);
        let info = point.create_deopt_info(&mut builder).unwrap();
        assert!(
            !info
                .frame_slots()
                .iter()
                .any(|i| matches!(i, DeoptInstr::Pp(_) | DeoptInstr::CallerPp))
        );
        assert_eq!(info.frame_size(), 22 - 3);
    }

    #[test]
    fn lazy_deoptimization_drops_the_outgoing_arguments() {
        let program = parse_program(indoc! {"
            (program
                (function callee (fixed 1) static)
                (function caller (fixed 2) static)
                (graph caller
                    (block B0 graph_entry)
                    (block B1 function_entry
                        (v0 parameter 0)
                        (v1 parameter 1)
                        (v2 static_call callee (args 1) v1 (deopt 6))
                        (return v2))))
        "})
        .unwrap();
        let graph = &program.functions[0].graph;
        let frame = FrameAllocation::allocate(graph, Arch::Arm).unwrap();
        let call = find(graph, "static_call");
        assert_eq!(graph.instrs[call].env.as_ref().unwrap().innermost().values.len(), 3);

        let point = CompilerDeoptInfo::at_call(graph, call, 24);
        assert_eq!(point.deopt_id, DeoptId(7));
        let mut builder = DeoptInfoBuilder::new(graph, &frame);
        let info = point.create_deopt_info(&mut builder).unwrap();

        use DeoptInstr::*;
        assert_eq!(
            info.frame_slots(),
            &[
                Pp(graph.function),
                PcMarker(None),
                CallerFp,
                RetAddress { function: graph.function, deopt_id: DeoptId(7) },
                CallerPp,
                PcMarker(Some(graph.function)),
                CallerFp,
                CallerPc,
                StackSlot(2),
                StackSlot(3),
            ]
        );
    }

    #[test]
    fn points_without_environment_still_take_a_number() {
        let program = parse_program(indoc! {"
            (graph f
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (check_smi v0 noenv)
                    (check_smi v0)
                    (return v0)))
        "})
        .unwrap();
        let graph = &program.functions[0].graph;
        let frame = FrameAllocation::allocate(graph, Arch::X64).unwrap();
        let checks: Vec<InstrId> = graph
            .block_instrs(graph.normal_entry().unwrap())
            .filter(|&i| graph.instrs[i].kind.name() == "check_smi")
            .collect();

        let mut table = DeoptTable::default();
        let mut builder = DeoptInfoBuilder::new(graph, &frame);
        for (n, &check) in checks.iter().enumerate() {
            let mut point = CompilerDeoptInfo {
                instr: check,
                deopt_id: graph.instrs[check].deopt_id.unwrap(),
                reason: DeoptReason::CheckSmi,
                drops_arguments: false,
                entry_label: None,
                pc_offset: 0,
            };
            point.pc_offset = 10 * (n as u32 + 1);
            let info = point.create_deopt_info(&mut builder);
            table.add(&point, info);
        }
        assert_eq!(table.len(), 2);
        let first = table.entry_at(10).unwrap();
        let second = table.entry_at(20).unwrap();
        assert_eq!((first.info_number, second.info_number), (0, 1));
        assert!(table.info(first).is_none());
        assert_eq!(table.info(second).unwrap().frame_size(), 4 + 1 + 4 + 1);
    }
}

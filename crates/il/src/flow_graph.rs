//! The flow graph: arenas of blocks, instructions and uses, plus the
//! operations that keep them consistent.
//!
//! Every use of a definition is a [`ValueData`] node linked into one of
//! two intrusive lists on its definition (input uses and environment
//! uses), so adding, removing and retargeting a use is O(1). Instructions
//! form a doubly linked list per block. Removing an instruction from its
//! block detaches its own input and environment uses but keeps them
//! allocated, so the instruction can be re-inserted elsewhere.

use crate::{
    compile_type::CompileType,
    ir::{
        BlockData, BlockId, BlockKind, ConstValue, DeoptId, EnvFrame, Environment, GraphEntry,
        InstrData, InstrId, InstrKind, MoveArgument, Representation, UseId, UseSite, ValueData,
    },
    object_model::{ClassId, ClassTable, FunctionId, FunctionInfo, Slot, cid},
};
use cranelift_entity::{EntitySet, PrimaryMap, SecondaryMap, packed_option::PackedOption};
use ember_core::HashMap;
use smallvec::SmallVec;
use std::sync::Arc;

/// Describes one environment frame in terms of definitions, before uses
/// are allocated for it.
#[derive(Clone, Debug)]
pub struct EnvFrameSpec {
    pub function: FunctionId,
    pub values: Vec<InstrId>,
    pub fixed_parameter_count: u32,
    pub deopt_id: DeoptId,
}

#[derive(Clone, Debug)]
pub struct FlowGraph {
    pub function: FunctionId,
    pub classes: Arc<ClassTable>,
    pub instrs: PrimaryMap<InstrId, InstrData>,
    pub uses: PrimaryMap<UseId, ValueData>,
    pub blocks: PrimaryMap<BlockId, BlockData>,
    graph_entry: BlockId,
    preorder: Vec<BlockId>,
    postorder: Vec<BlockId>,
    reverse_postorder: Vec<BlockId>,
    constants: HashMap<ConstValue, InstrId>,
    next_ssa_temp: u32,
    next_deopt_id: u32,
}

impl FlowGraph {
    pub fn new(classes: Arc<ClassTable>, function: FunctionId) -> Self {
        let mut blocks = PrimaryMap::new();
        let graph_entry = blocks.push(BlockData::new(BlockKind::Graph(GraphEntry::default())));
        Self {
            function,
            classes,
            instrs: PrimaryMap::new(),
            uses: PrimaryMap::new(),
            blocks,
            graph_entry,
            preorder: Vec::new(),
            postorder: Vec::new(),
            reverse_postorder: Vec::new(),
            constants: HashMap::default(),
            next_ssa_temp: 0,
            next_deopt_id: 0,
        }
    }

    pub fn function_info(&self) -> &FunctionInfo {
        self.classes.function(self.function)
    }

    pub fn name(&self) -> &str {
        &self.function_info().name
    }

    pub fn graph_entry(&self) -> BlockId {
        self.graph_entry
    }

    pub fn graph_entry_data(&self) -> &GraphEntry {
        match &self.blocks[self.graph_entry].kind {
            BlockKind::Graph(entry) => entry,
            _ => unreachable!("graph entry block has wrong kind"),
        }
    }

    fn graph_entry_data_mut(&mut self) -> &mut GraphEntry {
        match &mut self.blocks[self.graph_entry].kind {
            BlockKind::Graph(entry) => entry,
            _ => unreachable!("graph entry block has wrong kind"),
        }
    }

    pub fn normal_entry(&self) -> Option<BlockId> {
        self.graph_entry_data().normal_entry.expand()
    }

    pub fn alloc_ssa_temp(&mut self) -> u32 {
        let temp = self.next_ssa_temp;
        self.next_ssa_temp += 1;
        temp
    }

    pub fn max_ssa_temp(&self) -> u32 {
        self.next_ssa_temp
    }

    pub fn alloc_deopt_id(&mut self) -> DeoptId {
        let id = DeoptId(self.next_deopt_id);
        self.next_deopt_id += 2;
        id
    }

    pub fn max_deopt_id(&self) -> u32 {
        self.next_deopt_id
    }

    /// Makes sure fresh deopt ids do not collide with ids up to `id`.
    pub fn reserve_deopt_ids_up_to(&mut self, id: DeoptId) {
        let next = (id.0 | 1) + 1;
        self.next_deopt_id = self.next_deopt_id.max(next);
    }

    // ---------------------------------------------------------------
    // Blocks

    /// Adds a block. Entry kinds are registered as graph entry successors.
    pub fn add_block(&mut self, kind: BlockKind) -> BlockId {
        let is_entry = kind.is_graph_entry_successor();
        let block = self.blocks.push(BlockData::new(kind.clone()));
        if is_entry {
            let entry = self.graph_entry;
            let ge = self.graph_entry_data_mut();
            match kind {
                BlockKind::FunctionEntry => ge.normal_entry = block.into(),
                BlockKind::OsrEntry => ge.osr_entry = block.into(),
                BlockKind::CatchBlockEntry { .. } => ge.catch_entries.push(block),
                BlockKind::IndirectEntry { .. } => ge.indirect_entries.push(block),
                _ => unreachable!(),
            }
            self.blocks[block].predecessors.push(entry);
        }
        block
    }

    pub fn successors(&self, block: BlockId) -> SmallVec<[BlockId; 4]> {
        match &self.blocks[block].kind {
            BlockKind::Graph(entry) => entry.successors(),
            _ => match self.blocks[block].last.expand() {
                Some(last) => self.instrs[last].kind.successors().into_iter().collect(),
                None => SmallVec::new(),
            },
        }
    }

    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        &self.blocks[block].predecessors
    }

    pub fn preorder(&self) -> &[BlockId] {
        &self.preorder
    }

    pub fn postorder(&self) -> &[BlockId] {
        &self.postorder
    }

    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.reverse_postorder
    }

    pub fn last_instruction(&self, block: BlockId) -> Option<InstrId> {
        self.blocks[block].last.expand()
    }

    pub fn block_of(&self, instr: InstrId) -> Option<BlockId> {
        self.instrs[instr].block.expand()
    }

    /// Iterates a block's instruction list (phis and initial definitions
    /// excluded). The list must not be modified during iteration; use
    /// [`FlowGraph::block_instrs_snapshot`] for that.
    pub fn block_instrs(&self, block: BlockId) -> InstrIter<'_> {
        InstrIter {
            graph: self,
            current: self.blocks[block].first.expand(),
        }
    }

    pub fn block_instrs_snapshot(&self, block: BlockId) -> Vec<InstrId> {
        self.block_instrs(block).collect()
    }

    /// Removes predecessor `pred` from `block`, dropping the matching
    /// input of every phi.
    pub fn remove_predecessor(&mut self, block: BlockId, pred: BlockId) {
        let Some(index) = self.blocks[block]
            .predecessors
            .iter()
            .position(|&p| p == pred)
        else {
            return;
        };
        self.blocks[block].predecessors.remove(index);
        for phi in self.blocks[block].phis.clone() {
            let removed = self.instrs[phi].inputs.remove(index);
            self.detach_use(removed);
            self.renumber_inputs(phi);
        }
    }

    fn renumber_inputs(&mut self, instr: InstrId) {
        for (i, &u) in self.instrs[instr].inputs.iter().enumerate() {
            self.uses[u].use_index = i as u32;
        }
    }

    // ---------------------------------------------------------------
    // Instructions and uses

    /// Creates an instruction that is not yet part of any block. Input
    /// uses are created but only linked once the instruction is inserted.
    pub fn new_instr(&mut self, kind: InstrKind, inputs: &[InstrId]) -> InstrId {
        if let Some(count) = kind.fixed_input_count() {
            assert_eq!(
                count,
                inputs.len(),
                "{} expects {count} inputs",
                kind.name()
            );
        }
        let is_definition = kind.is_definition();
        let instr = self.instrs.push(InstrData::new(kind));
        if is_definition {
            self.instrs[instr].ssa_temp = Some(self.alloc_ssa_temp());
        }
        for (index, &def) in inputs.iter().enumerate() {
            let u = self.new_use(def, instr, index as u32, UseSite::Input);
            self.instrs[instr].inputs.push(u);
        }
        instr
    }

    fn new_use(&mut self, definition: InstrId, instruction: InstrId, use_index: u32, site: UseSite) -> UseId {
        self.uses.push(ValueData {
            definition,
            instruction,
            use_index,
            site,
            prev_use: PackedOption::default(),
            next_use: PackedOption::default(),
            reaching_type: None,
            attached: false,
        })
    }

    fn use_list_head(&mut self, u: UseId) -> &mut PackedOption<UseId> {
        let value = &self.uses[u];
        let def = &mut self.instrs[value.definition];
        match value.site {
            UseSite::Input => &mut def.input_use_list,
            UseSite::Env { .. } => &mut def.env_use_list,
        }
    }

    /// Links a use into its definition's use list.
    pub fn attach_use(&mut self, u: UseId) {
        assert!(!self.uses[u].attached, "use {u:?} attached twice");
        let head = self.use_list_head(u).expand();
        if let Some(head) = head {
            self.uses[head].prev_use = u.into();
        }
        let value = &mut self.uses[u];
        value.next_use = head.into();
        value.prev_use = PackedOption::default();
        value.attached = true;
        *self.use_list_head(u) = u.into();
    }

    /// Unlinks a use from its definition's use list.
    pub fn detach_use(&mut self, u: UseId) {
        if !self.uses[u].attached {
            return;
        }
        let prev = self.uses[u].prev_use.expand();
        let next = self.uses[u].next_use.expand();
        match prev {
            Some(prev) => self.uses[prev].next_use = next.into(),
            None => *self.use_list_head(u) = next.into(),
        }
        if let Some(next) = next {
            self.uses[next].prev_use = prev.into();
        }
        let value = &mut self.uses[u];
        value.prev_use = PackedOption::default();
        value.next_use = PackedOption::default();
        value.attached = false;
    }

    /// Points a use at a different definition.
    pub fn set_use_definition(&mut self, u: UseId, def: InstrId) {
        let attached = self.uses[u].attached;
        self.detach_use(u);
        self.uses[u].definition = def;
        self.uses[u].reaching_type = None;
        if attached {
            self.attach_use(u);
        }
    }

    pub fn input_at(&self, instr: InstrId, index: usize) -> InstrId {
        self.uses[self.instrs[instr].inputs[index]].definition
    }

    pub fn input_use(&self, instr: InstrId, index: usize) -> UseId {
        self.instrs[instr].inputs[index]
    }

    pub fn inputs(&self, instr: InstrId) -> impl Iterator<Item = InstrId> + '_ {
        self.instrs[instr]
            .inputs
            .iter()
            .map(|&u| self.uses[u].definition)
    }

    pub fn set_input(&mut self, instr: InstrId, index: usize, def: InstrId) {
        let u = self.instrs[instr].inputs[index];
        self.set_use_definition(u, def);
    }

    /// Appends an input to a phi or call.
    pub fn add_input(&mut self, instr: InstrId, def: InstrId) {
        let index = self.instrs[instr].inputs.len() as u32;
        let u = self.new_use(def, instr, index, UseSite::Input);
        self.instrs[instr].inputs.push(u);
        if self.is_attached(instr) {
            self.attach_use(u);
        }
    }

    pub fn input_uses(&self, def: InstrId) -> UseIter<'_> {
        UseIter {
            graph: self,
            current: self.instrs[def].input_use_list.expand(),
        }
    }

    pub fn env_uses(&self, def: InstrId) -> UseIter<'_> {
        UseIter {
            graph: self,
            current: self.instrs[def].env_use_list.expand(),
        }
    }

    pub fn all_uses(&self, def: InstrId) -> Vec<UseId> {
        self.input_uses(def).chain(self.env_uses(def)).collect()
    }

    pub fn has_uses(&self, def: InstrId) -> bool {
        self.instrs[def].input_use_list.is_some() || self.instrs[def].env_use_list.is_some()
    }

    pub fn has_input_uses(&self, def: InstrId) -> bool {
        self.instrs[def].input_use_list.is_some()
    }

    pub fn replace_all_uses_with(&mut self, def: InstrId, other: InstrId) {
        if def == other {
            return;
        }
        for u in self.all_uses(def) {
            self.detach_use(u);
            self.uses[u].definition = other;
            self.attach_use(u);
        }
    }

    /// Whether the instruction is linked into a block (or is a phi or
    /// initial definition of one).
    pub fn is_attached(&self, instr: InstrId) -> bool {
        self.instrs[instr].block.is_some()
    }

    fn attach_instr_uses(&mut self, instr: InstrId) {
        let data = &self.instrs[instr];
        let uses: SmallVec<[UseId; 8]> = data
            .inputs
            .iter()
            .copied()
            .chain(data.env.iter().flat_map(|env| env.uses()))
            .collect();
        for u in uses {
            self.attach_use(u);
        }
    }

    fn detach_instr_uses(&mut self, instr: InstrId) {
        let data = &self.instrs[instr];
        let uses: SmallVec<[UseId; 8]> = data
            .inputs
            .iter()
            .copied()
            .chain(data.env.iter().flat_map(|env| env.uses()))
            .collect();
        for u in uses {
            self.detach_use(u);
        }
    }

    fn link_instr(
        &mut self,
        instr: InstrId,
        block: BlockId,
        prev: Option<InstrId>,
        next: Option<InstrId>,
    ) {
        assert!(
            !self.is_attached(instr),
            "instruction {instr:?} is already in the graph"
        );
        let data = &mut self.instrs[instr];
        data.block = block.into();
        data.prev = prev.into();
        data.next = next.into();
        match prev {
            Some(prev) => self.instrs[prev].next = instr.into(),
            None => self.blocks[block].first = instr.into(),
        }
        match next {
            Some(next) => self.instrs[next].prev = instr.into(),
            None => self.blocks[block].last = instr.into(),
        }
        self.attach_instr_uses(instr);
    }

    pub fn insert_before(&mut self, next: InstrId, instr: InstrId) {
        let block = self
            .block_of(next)
            .unwrap_or_else(|| panic!("insert_before a detached instruction"));
        let prev = self.instrs[next].prev.expand();
        self.link_instr(instr, block, prev, Some(next));
    }

    pub fn insert_after(&mut self, prev: InstrId, instr: InstrId) {
        assert!(
            !self.instrs[prev].kind.is_control_flow(),
            "cannot insert after a block terminator"
        );
        let block = self
            .block_of(prev)
            .unwrap_or_else(|| panic!("insert_after a detached instruction"));
        let next = self.instrs[prev].next.expand();
        self.link_instr(instr, block, Some(prev), next);
    }

    /// Appends to the end of a block. Appending a control-flow
    /// instruction registers the block as a predecessor of its
    /// successors.
    pub fn append(&mut self, block: BlockId, instr: InstrId) {
        if let Some(last) = self.blocks[block].last.expand() {
            assert!(
                !self.instrs[last].kind.is_control_flow(),
                "block {block:?} is already terminated"
            );
        }
        let prev = self.blocks[block].last.expand();
        self.link_instr(instr, block, prev, None);
        for succ in self.instrs[instr].kind.successors() {
            self.blocks[succ].predecessors.push(block);
        }
    }

    /// Unlinks a straight-line instruction from its block. Its own use
    /// list is untouched; its input and environment uses are detached.
    /// Returns the instruction that followed it.
    pub fn remove_from_graph(&mut self, instr: InstrId) -> Option<InstrId> {
        let data = &self.instrs[instr];
        assert!(
            !data.kind.is_control_flow() && !data.is_phi(),
            "remove_from_graph on {}",
            data.kind.name()
        );
        let block = data
            .block
            .expand()
            .unwrap_or_else(|| panic!("{instr:?} is not in the graph"));
        let prev = data.prev.expand();
        let next = data.next.expand();
        match prev {
            Some(prev) => self.instrs[prev].next = next.into(),
            None => self.blocks[block].first = next.into(),
        }
        match next {
            Some(next) => self.instrs[next].prev = prev.into(),
            None => self.blocks[block].last = prev.into(),
        }
        self.detach_instr_uses(instr);
        let data = &mut self.instrs[instr];
        data.block = PackedOption::default();
        data.prev = PackedOption::default();
        data.next = PackedOption::default();
        next
    }

    /// Inserts `new` in place of `old` and redirects all uses of `old`.
    pub fn replace_instruction(&mut self, old: InstrId, new: InstrId) {
        self.insert_before(old, new);
        self.replace_all_uses_with(old, new);
        self.remove_from_graph(old);
    }

    /// Replaces the control-flow instruction ending `block`, keeping
    /// predecessor lists of the successors consistent.
    pub fn replace_terminator(&mut self, block: BlockId, new: InstrId) {
        let old = self.blocks[block]
            .last
            .expand()
            .unwrap_or_else(|| panic!("block {block:?} has no terminator"));
        let old_succs = self.instrs[old].kind.successors();
        let new_succs = self.instrs[new].kind.successors();
        for &succ in &old_succs {
            if !new_succs.contains(&succ) {
                self.remove_predecessor(succ, block);
            }
        }

        let prev = self.instrs[old].prev.expand();
        self.detach_instr_uses(old);
        {
            let data = &mut self.instrs[old];
            data.block = PackedOption::default();
            data.prev = PackedOption::default();
        }
        match prev {
            Some(prev) => self.instrs[prev].next = PackedOption::default(),
            None => self.blocks[block].first = PackedOption::default(),
        }
        self.blocks[block].last = prev.into();

        let prev = self.blocks[block].last.expand();
        self.link_instr(new, block, prev, None);
        for succ in new_succs {
            if !old_succs.contains(&succ) {
                self.blocks[succ].predecessors.push(block);
            }
        }
    }

    // ---------------------------------------------------------------
    // Phis, initial definitions, constants

    pub fn add_phi(&mut self, block: BlockId, inputs: &[InstrId]) -> InstrId {
        assert!(self.blocks[block].is_join(), "phis live in join blocks");
        let phi = self.new_instr(InstrKind::Phi, inputs);
        self.instrs[phi].block = block.into();
        self.attach_instr_uses(phi);
        self.blocks[block].phis.push(phi);
        phi
    }

    pub fn remove_phi(&mut self, phi: InstrId) {
        let block = self
            .block_of(phi)
            .unwrap_or_else(|| panic!("phi {phi:?} is not in the graph"));
        self.detach_instr_uses(phi);
        self.blocks[block].phis.retain(|&p| p != phi);
        self.instrs[phi].block = PackedOption::default();
    }

    pub fn add_initial_definition(&mut self, block: BlockId, kind: InstrKind) -> InstrId {
        assert!(self.blocks[block].kind.has_initial_definitions());
        let def = self.new_instr(kind, &[]);
        self.instrs[def].block = block.into();
        self.blocks[block].initial_definitions.push(def);
        def
    }

    /// The canonical constant definition for `value`.
    pub fn constant(&mut self, value: ConstValue) -> InstrId {
        if let Some(&existing) = self.constants.get(&value) {
            return existing;
        }
        let entry = self.graph_entry;
        let def = self.add_initial_definition(entry, InstrKind::Constant(value.clone()));
        self.constants.insert(value, def);
        def
    }

    pub fn constant_null(&mut self) -> InstrId {
        self.constant(ConstValue::Null)
    }

    pub fn is_constant(&self, def: InstrId) -> bool {
        self.instrs[def].as_constant().is_some()
    }

    pub fn constant_value(&self, def: InstrId) -> Option<&ConstValue> {
        self.instrs[def].as_constant()
    }

    // ---------------------------------------------------------------
    // Environments

    pub fn set_environment(&mut self, instr: InstrId, frames: Vec<EnvFrameSpec>) {
        self.remove_environment(instr);
        let mut env_frames = Vec::with_capacity(frames.len());
        for (frame_index, spec) in frames.into_iter().enumerate() {
            let values = spec
                .values
                .iter()
                .enumerate()
                .map(|(i, &def)| {
                    self.new_use(
                        def,
                        instr,
                        i as u32,
                        UseSite::Env {
                            frame: frame_index as u16,
                        },
                    )
                })
                .collect();
            env_frames.push(EnvFrame {
                function: spec.function,
                values,
                fixed_parameter_count: spec.fixed_parameter_count,
                deopt_id: spec.deopt_id,
            });
        }
        self.instrs[instr].env = Some(Environment {
            frames: env_frames,
            lazy_deopt_to_before: false,
        });
        if self.is_attached(instr) {
            let uses: Vec<UseId> = self.instrs[instr]
                .env
                .iter()
                .flat_map(|env| env.uses())
                .collect();
            for u in uses {
                self.attach_use(u);
            }
        }
    }

    /// The environment of `instr` expressed as frame specs.
    pub fn environment_spec(&self, instr: InstrId) -> Option<Vec<EnvFrameSpec>> {
        let env = self.instrs[instr].env.as_ref()?;
        Some(
            env.frames
                .iter()
                .map(|frame| EnvFrameSpec {
                    function: frame.function,
                    values: frame
                        .values
                        .iter()
                        .map(|&u| self.uses[u].definition)
                        .collect(),
                    fixed_parameter_count: frame.fixed_parameter_count,
                    deopt_id: frame.deopt_id,
                })
                .collect(),
        )
    }

    /// Gives `to` a deep copy of the environment of `from`.
    pub fn copy_environment(&mut self, from: InstrId, to: InstrId) {
        match self.environment_spec(from) {
            Some(spec) => {
                let lazy = self.instrs[from]
                    .env
                    .as_ref()
                    .is_some_and(|env| env.lazy_deopt_to_before);
                self.set_environment(to, spec);
                if let Some(env) = &mut self.instrs[to].env {
                    env.lazy_deopt_to_before = lazy;
                }
            }
            None => self.remove_environment(to),
        }
    }

    pub fn remove_environment(&mut self, instr: InstrId) {
        if let Some(env) = self.instrs[instr].env.take() {
            for u in env.uses() {
                self.detach_use(u);
            }
        }
    }

    pub fn env_value(&self, instr: InstrId, frame: usize, index: usize) -> InstrId {
        let env = self.instrs[instr]
            .env
            .as_ref()
            .unwrap_or_else(|| panic!("{instr:?} has no environment"));
        self.uses[env.frames[frame].values[index]].definition
    }

    // ---------------------------------------------------------------
    // Calls

    /// The definition passed as argument `index`, read through a
    /// `MoveArgument` if the call was lowered.
    pub fn argument_at(&self, call: InstrId, index: usize) -> InstrId {
        match &self.instrs[call].move_arguments {
            Some(moves) => self.input_at(moves[index], 0),
            None => self.input_at(call, index),
        }
    }

    pub fn move_argument_at(&self, call: InstrId, index: usize) -> Option<InstrId> {
        self.instrs[call]
            .move_arguments
            .as_ref()
            .map(|moves| moves[index])
    }

    /// Lowers every call to move-argument form: one `MoveArgument` per
    /// argument precedes the call, the call's own argument inputs are
    /// dropped, and the argument slots of its environment are redirected to
    /// the `MoveArgument` definitions.
    pub fn insert_move_arguments(&mut self) {
        for block in self.reverse_postorder.clone() {
            for instr in self.block_instrs_snapshot(block) {
                if !self.instrs[instr].kind.is_call() || self.instrs[instr].move_arguments.is_some()
                {
                    continue;
                }
                let args: SmallVec<[InstrId; 4]> = self.inputs(instr).collect();
                let count = args.len();
                let mut moves = SmallVec::<[InstrId; 4]>::new();
                for (i, &arg) in args.iter().enumerate() {
                    let mv = self.new_instr(
                        InstrKind::MoveArgument(MoveArgument {
                            sp_relative_index: (count - 1 - i) as u32,
                        }),
                        &[arg],
                    );
                    self.instrs[mv].representation = self.instrs[arg].representation;
                    self.instrs[mv].token_pos = self.instrs[instr].token_pos;
                    self.insert_before(instr, mv);
                    moves.push(mv);
                }

                if let Some(env) = self.instrs[instr].env.clone() {
                    let frame = env.innermost();
                    if frame.values.len() >= count {
                        let base = frame.values.len() - count;
                        for (i, &mv) in moves.iter().enumerate() {
                            let u = frame.values[base + i];
                            if self.original_definition(self.uses[u].definition)
                                == self.original_definition(args[i])
                            {
                                self.set_use_definition(u, mv);
                            }
                        }
                    }
                }

                let inputs = std::mem::take(&mut self.instrs[instr].inputs);
                for u in inputs {
                    self.detach_use(u);
                }
                self.instrs[instr].move_arguments = Some(moves);
            }
        }
    }

    // ---------------------------------------------------------------
    // Definitions

    /// Strips redefinitions and checks that forward their input.
    pub fn original_definition(&self, mut def: InstrId) -> InstrId {
        while let Some(index) = self.instrs[def].kind.redefined_input() {
            if self.instrs[def].inputs.len() <= index {
                break;
            }
            def = self.input_at(def, index);
        }
        def
    }

    /// Like [`FlowGraph::original_definition`], also looking through
    /// boxing conversions.
    pub fn original_definition_ignore_boxing(&self, mut def: InstrId) -> InstrId {
        loop {
            def = self.original_definition(def);
            match self.instrs[def].kind {
                InstrKind::Box(_) | InstrKind::Unbox(_) => def = self.input_at(def, 0),
                _ => return def,
            }
        }
    }

    /// Redirects input uses of `def` that are dominated by `redefinition`
    /// to it.
    pub fn rename_uses_dominated_by(&mut self, def: InstrId, redefinition: InstrId) {
        let uses: Vec<UseId> = self.input_uses(def).collect();
        for u in uses {
            let user = self.uses[u].instruction;
            if user == redefinition {
                continue;
            }
            let dominated = if self.instrs[user].is_phi() {
                let Some(block) = self.block_of(user) else {
                    continue;
                };
                let pred = self.blocks[block].predecessors[self.uses[u].use_index as usize];
                match self.last_instruction(pred) {
                    Some(last) => self.instr_dominates(redefinition, last),
                    None => false,
                }
            } else {
                self.instr_dominates(redefinition, user)
            };
            if dominated {
                self.set_use_definition(u, redefinition);
            }
        }
    }

    /// All definitions in reverse postorder: initial definitions, phis,
    /// then the block's instructions.
    pub fn definitions(&self) -> Vec<InstrId> {
        let mut defs = Vec::new();
        for &block in &self.reverse_postorder {
            let data = &self.blocks[block];
            defs.extend(data.initial_definitions.iter().copied());
            defs.extend(data.phis.iter().copied());
            defs.extend(
                self.block_instrs(block)
                    .filter(|&i| self.instrs[i].is_definition()),
            );
        }
        defs
    }

    // ---------------------------------------------------------------
    // Types

    /// The cached static type of a definition, or the type computed from
    /// its kind and inputs.
    pub fn type_of(&self, def: InstrId) -> CompileType {
        match &self.instrs[def].compile_type {
            Some(ty) => ty.clone(),
            None => self.compute_type(def),
        }
    }

    /// Static type of the value flowing through a use.
    pub fn reaching_type(&self, u: UseId) -> CompileType {
        match &self.uses[u].reaching_type {
            Some(ty) => ty.clone(),
            None => self.type_of(self.uses[u].definition),
        }
    }

    pub fn input_type(&self, instr: InstrId, index: usize) -> CompileType {
        self.reaching_type(self.instrs[instr].inputs[index])
    }

    pub fn compute_type(&self, def: InstrId) -> CompileType {
        let classes = &*self.classes;
        let data = &self.instrs[def];
        match &data.kind {
            InstrKind::Constant(value) => match value {
                ConstValue::Null => CompileType::null(),
                ConstValue::OptimizedOut => CompileType::dynamic(),
                other => CompileType::from_cid(other.cid()),
            },
            InstrKind::Parameter(_) => CompileType::dynamic(),
            InstrKind::Phi => data.inputs.iter().fold(CompileType::none(), |acc, &u| {
                let input_ty = self.uses[u].reaching_type.clone().unwrap_or_else(|| {
                    self.instrs[self.uses[u].definition]
                        .compile_type
                        .clone()
                        .unwrap_or_else(CompileType::none)
                });
                acc.union(&input_ty, classes)
            }),
            InstrKind::Redefinition(redef) => {
                let input = self.input_type(def, 0);
                match &redef.constrained_type {
                    Some(constraint) => {
                        CompileType::compute_refined_type(&input, constraint, classes)
                    }
                    None => input,
                }
            }
            InstrKind::BinarySmiOp(_) | InstrKind::UnarySmiOp(_) | InstrKind::LoadClassId => {
                CompileType::smi()
            }
            InstrKind::BinaryInt64Op(_) => CompileType::int(),
            InstrKind::BinaryDoubleOp(_) => CompileType::double(),
            InstrKind::Box(boxed) => match boxed.from {
                Representation::UnboxedDouble => CompileType::double(),
                _ => CompileType::int(),
            },
            InstrKind::Unbox(unbox) => match unbox.to {
                Representation::UnboxedDouble => CompileType::double(),
                _ => CompileType::int(),
            },
            InstrKind::RelationalOp(_)
            | InstrKind::EqualityCompare(_)
            | InstrKind::StrictCompare(_)
            | InstrKind::TestCids(_)
            | InstrKind::BooleanNegate
            | InstrKind::CheckedSmiComparison(_)
            | InstrKind::InstanceOf(_)
            | InstrKind::AssertBoolean => CompileType::bool(),
            InstrKind::AllocateObject(alloc) => CompileType::from_cid(alloc.cls),
            InstrKind::MaterializeObject(mat) => CompileType::from_cid(mat.cls),
            InstrKind::LoadField(load) if load.slot == Slot::array_length() => {
                CompileType::smi()
            }
            InstrKind::CheckArrayBound => CompileType::smi(),
            InstrKind::CheckNull => self.input_type(def, 0).copy_non_nullable(),
            InstrKind::MoveArgument(_) => self.input_type(def, 0),
            InstrKind::AssertAssignable(assert) => {
                let input = self.input_type(def, 0);
                let asserted = CompileType::from_abstract_type(assert.ty.clone());
                CompileType::compute_refined_type(&input, &asserted, classes)
            }
            _ => CompileType::dynamic(),
        }
    }

    pub fn value_cid(&self, u: UseId) -> ClassId {
        self.reaching_type(u).to_cid(&self.classes)
    }

    pub fn is_smi_value(&self, u: UseId) -> bool {
        self.value_cid(u) == cid::SMI
    }

    // ---------------------------------------------------------------
    // Orders and dominance

    /// Recomputes preorder, postorder and reverse postorder, and removes
    /// blocks that are no longer reachable from the graph entry.
    pub fn discover_blocks(&mut self) {
        for block in self.blocks.values_mut() {
            block.preorder_number = None;
            block.postorder_number = None;
        }
        self.preorder.clear();
        self.postorder.clear();

        let entry = self.graph_entry;
        let mut visited = EntitySet::<BlockId>::new();
        let mut stack: Vec<(BlockId, SmallVec<[BlockId; 4]>, usize)> = Vec::new();
        visited.insert(entry);
        self.blocks[entry].preorder_number = Some(0);
        self.preorder.push(entry);
        stack.push((entry, self.successors(entry), 0));

        while let Some((block, succs, next)) = stack.last_mut() {
            if let Some(&succ) = succs.get(*next) {
                *next += 1;
                if visited.insert(succ) {
                    self.blocks[succ].preorder_number = Some(self.preorder.len() as u32);
                    self.preorder.push(succ);
                    let succs = self.successors(succ);
                    stack.push((succ, succs, 0));
                }
            } else {
                let block = *block;
                self.blocks[block].postorder_number = Some(self.postorder.len() as u32);
                self.postorder.push(block);
                stack.pop();
            }
        }

        self.reverse_postorder = self.postorder.iter().rev().copied().collect();

        let unreachable: Vec<BlockId> = self
            .blocks
            .keys()
            .filter(|&b| !visited.contains(b) && !self.blocks[b].removed)
            .collect();
        for &block in &self.reverse_postorder.clone() {
            let dead_preds: SmallVec<[BlockId; 2]> = self.blocks[block]
                .predecessors
                .iter()
                .copied()
                .filter(|&p| !visited.contains(p))
                .collect();
            for pred in dead_preds {
                self.remove_predecessor(block, pred);
            }
        }
        for block in unreachable {
            tracing::trace!("removing unreachable block {block:?}");
            self.detach_block(block);
        }
    }

    fn detach_block(&mut self, block: BlockId) {
        let mut instrs = self.block_instrs_snapshot(block);
        instrs.extend(self.blocks[block].phis.iter().copied());
        for instr in instrs {
            self.detach_instr_uses(instr);
            let data = &mut self.instrs[instr];
            data.block = PackedOption::default();
            data.prev = PackedOption::default();
            data.next = PackedOption::default();
        }
        let data = &mut self.blocks[block];
        data.first = PackedOption::default();
        data.last = PackedOption::default();
        data.phis.clear();
        data.predecessors.clear();
        data.dominated.clear();
        data.dominator = PackedOption::default();
        data.removed = true;
    }

    /// Computes immediate dominators (Cooper, Harvey and Kennedy) and the
    /// dominator tree. Requires [`FlowGraph::discover_blocks`].
    pub fn compute_dominators(&mut self) {
        let entry = self.graph_entry;
        let mut idom: SecondaryMap<BlockId, PackedOption<BlockId>> = SecondaryMap::new();
        idom[entry] = entry.into();

        let postorder_number = |graph: &FlowGraph, b: BlockId| {
            graph.blocks[b]
                .postorder_number
                .unwrap_or_else(|| panic!("{b:?} is unreachable"))
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &block in self.reverse_postorder.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &pred in &self.blocks[block].predecessors {
                    if idom[pred].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => {
                            let (mut a, mut b) = (current, pred);
                            while a != b {
                                while postorder_number(self, a) < postorder_number(self, b) {
                                    a = idom[a].expand().unwrap_or_else(|| panic!("no idom"));
                                }
                                while postorder_number(self, b) < postorder_number(self, a) {
                                    b = idom[b].expand().unwrap_or_else(|| panic!("no idom"));
                                }
                            }
                            a
                        }
                    });
                }
                if let Some(new_idom) = new_idom {
                    if idom[block].expand() != Some(new_idom) {
                        idom[block] = new_idom.into();
                        changed = true;
                    }
                }
            }
        }

        for &block in &self.reverse_postorder {
            self.blocks[block].dominated.clear();
        }
        for &block in &self.reverse_postorder.clone() {
            if block == entry {
                self.blocks[block].dominator = PackedOption::default();
                continue;
            }
            let dom = idom[block]
                .expand()
                .unwrap_or_else(|| panic!("{block:?} has no dominator"));
            self.blocks[block].dominator = dom.into();
            self.blocks[dom].dominated.push(block);
        }

        // Number the dominator tree for constant-time queries.
        let mut counter = 0;
        let mut stack = vec![(entry, false)];
        while let Some((block, exiting)) = stack.pop() {
            if exiting {
                self.blocks[block].dom_interval.1 = counter;
                counter += 1;
                continue;
            }
            self.blocks[block].dom_interval.0 = counter;
            counter += 1;
            stack.push((block, true));
            for &child in self.blocks[block].dominated.iter().rev() {
                stack.push((child, false));
            }
        }
    }

    /// Whether block `a` dominates block `b` (reflexively).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let (a_in, a_out) = self.blocks[a].dom_interval;
        let (b_in, b_out) = self.blocks[b].dom_interval;
        a_in <= b_in && b_out <= a_out
    }

    /// Whether definition `def` is available at instruction `user`.
    pub fn instr_dominates(&self, def: InstrId, user: InstrId) -> bool {
        let (Some(def_block), Some(user_block)) = (self.block_of(def), self.block_of(user)) else {
            return false;
        };
        if def_block != user_block {
            return self.dominates(def_block, user_block);
        }
        let def_data = &self.instrs[def];
        if def_data.is_phi() || self.blocks[def_block].initial_definitions.contains(&def) {
            return true;
        }
        if self.instrs[user].is_phi() {
            return false;
        }
        let mut current = def_data.next.expand();
        while let Some(instr) = current {
            if instr == user {
                return true;
            }
            current = self.instrs[instr].next.expand();
        }
        false
    }

    /// Builds orders and dominators in one go.
    pub fn compute_block_info(&mut self) {
        self.discover_blocks();
        self.compute_dominators();
    }
}

pub struct InstrIter<'a> {
    graph: &'a FlowGraph,
    current: Option<InstrId>,
}

impl Iterator for InstrIter<'_> {
    type Item = InstrId;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        self.current = self.graph.instrs[current].next.expand();
        Some(current)
    }
}

pub struct UseIter<'a> {
    graph: &'a FlowGraph,
    current: Option<UseId>,
}

impl Iterator for UseIter<'_> {
    type Item = UseId;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        self.current = self.graph.uses[current].next_use.expand();
        Some(current)
    }
}

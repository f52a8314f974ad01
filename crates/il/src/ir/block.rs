use crate::ir::{BlockId, InstrId};
use cranelift_entity::packed_option::PackedOption;
use smallvec::SmallVec;

/// Successors of the graph entry. The graph entry holds no instructions;
/// its initial definitions are the canonical constants.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphEntry {
    pub normal_entry: PackedOption<BlockId>,
    pub osr_entry: PackedOption<BlockId>,
    pub catch_entries: SmallVec<[BlockId; 2]>,
    pub indirect_entries: SmallVec<[BlockId; 2]>,
}

impl GraphEntry {
    pub fn successors(&self) -> SmallVec<[BlockId; 4]> {
        let mut succs = SmallVec::new();
        succs.extend(self.normal_entry.expand());
        succs.extend(self.osr_entry.expand());
        succs.extend(self.catch_entries.iter().copied());
        succs.extend(self.indirect_entries.iter().copied());
        succs
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BlockKind {
    Graph(GraphEntry),
    /// Normal function entry. Initial definitions are the parameters.
    FunctionEntry,
    /// On-stack-replacement entry. Initial definitions are the parameters
    /// followed by the locals of the interrupted frame.
    OsrEntry,
    /// Block with any number of predecessors, all ending in a goto.
    Join,
    /// Block with exactly one predecessor.
    Target,
    /// Entry reached through a computed jump.
    IndirectEntry { indirect_id: u32 },
    /// Exception handler. Initial definitions are the exception and the
    /// stack trace.
    CatchBlockEntry { catch_try_index: u32 },
}

impl BlockKind {
    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::Graph(_) => "graph_entry",
            BlockKind::FunctionEntry => "function_entry",
            BlockKind::OsrEntry => "osr_entry",
            BlockKind::Join => "join",
            BlockKind::Target => "target",
            BlockKind::IndirectEntry { .. } => "indirect_entry",
            BlockKind::CatchBlockEntry { .. } => "catch_entry",
        }
    }

    /// Blocks entered directly from the graph entry.
    pub fn is_graph_entry_successor(&self) -> bool {
        matches!(
            self,
            BlockKind::FunctionEntry
                | BlockKind::OsrEntry
                | BlockKind::IndirectEntry { .. }
                | BlockKind::CatchBlockEntry { .. }
        )
    }

    pub fn has_initial_definitions(&self) -> bool {
        matches!(
            self,
            BlockKind::Graph(_)
                | BlockKind::FunctionEntry
                | BlockKind::OsrEntry
                | BlockKind::CatchBlockEntry { .. }
        )
    }
}

#[derive(Clone, Debug)]
pub struct BlockData {
    pub kind: BlockKind,
    pub first: PackedOption<InstrId>,
    pub last: PackedOption<InstrId>,
    pub phis: Vec<InstrId>,
    pub initial_definitions: Vec<InstrId>,
    pub predecessors: SmallVec<[BlockId; 2]>,
    pub dominator: PackedOption<BlockId>,
    pub dominated: SmallVec<[BlockId; 2]>,
    pub preorder_number: Option<u32>,
    pub postorder_number: Option<u32>,
    /// Interval of this block in a preorder walk of the dominator tree,
    /// used for constant-time dominance queries.
    pub dom_interval: (u32, u32),
    /// Header of the innermost loop containing the block.
    pub loop_header: PackedOption<BlockId>,
    pub loop_depth: u32,
    pub try_index: Option<u32>,
    /// Set when the block was found unreachable and its contents detached.
    pub removed: bool,
}

impl BlockData {
    pub fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            first: PackedOption::default(),
            last: PackedOption::default(),
            phis: Vec::new(),
            initial_definitions: Vec::new(),
            predecessors: SmallVec::new(),
            dominator: PackedOption::default(),
            dominated: SmallVec::new(),
            preorder_number: None,
            postorder_number: None,
            dom_interval: (0, 0),
            loop_header: PackedOption::default(),
            loop_depth: 0,
            try_index: None,
            removed: false,
        }
    }

    pub fn is_join(&self) -> bool {
        matches!(self.kind, BlockKind::Join)
    }

    pub fn is_graph_entry(&self) -> bool {
        matches!(self.kind, BlockKind::Graph(_))
    }

    pub fn is_reachable(&self) -> bool {
        self.preorder_number.is_some()
    }

    pub fn is_loop_header(&self, id: BlockId) -> bool {
        self.loop_header.expand() == Some(id)
    }
}

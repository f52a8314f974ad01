//! The optimizing compiler's intermediate language: an SSA flow graph
//! over a closed set of instruction kinds, and the passes that run on it.

pub mod builder;
pub mod cids;
pub mod compile_type;
pub mod feedback;
pub mod flow_graph;
pub mod formatter;
pub mod ir;
pub mod object_model;
pub mod parser;
pub mod passes;
pub mod validation;
pub mod visitor;

pub use flow_graph::FlowGraph;
pub use ir::{BlockId, DeoptId, InstrId, InstrKind, UseId};

use compact_str::CompactString;
use thiserror::Error;

/// A typed signal that a function cannot be optimized. The caller keeps
/// running unoptimized code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Bailout {
    #[error("instance call to {selector} has no resolvable target in force-optimized {function}")]
    UnresolvedCall {
        function: CompactString,
        selector: CompactString,
    },
    #[error("{what} is not supported in {function}")]
    Unsupported {
        function: CompactString,
        what: CompactString,
    },
    #[error("deoptimization is not possible in force-optimized {function}")]
    CannotDeoptimize { function: CompactString },
}

//! Defines the IL structure: instructions, blocks, uses and environments.

pub mod block;
pub mod constant;
pub mod environment;
pub mod instr;
pub mod value;

pub use block::*;
pub use constant::*;
pub use environment::*;
pub use instr::*;
pub use value::*;

use std::fmt::{self, Display, Formatter};

ember_core::entity_ref! {
    pub struct InstrId;
}

ember_core::entity_ref! {
    pub struct BlockId;
}

ember_core::entity_ref! {
    /// An edge from a consuming instruction to a definition.
    pub struct UseId;
}

/// Identifies a point in unoptimized code that optimized code can
/// deoptimize to. Ids are allocated in steps of two so that the "after"
/// point of an instruction never collides with the next instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeoptId(pub u32);

impl DeoptId {
    pub fn after(self) -> DeoptId {
        debug_assert_eq!(self.0 % 2, 0, "after() of an after id");
        DeoptId(self.0 + 1)
    }

    pub fn is_after(self) -> bool {
        self.0 % 2 == 1
    }
}

impl Display for DeoptId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source position attached to instructions for descriptors.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TokenPos(pub i32);

impl TokenPos {
    pub const NO_SOURCE: TokenPos = TokenPos(-1);
}

/// How a value is held in machine registers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Representation {
    #[default]
    Tagged,
    UnboxedInt64,
    UnboxedDouble,
    NoRepresentation,
}

impl Representation {
    pub fn name(self) -> &'static str {
        match self {
            Representation::Tagged => "tagged",
            Representation::UnboxedInt64 => "int64",
            Representation::UnboxedDouble => "double",
            Representation::NoRepresentation => "none",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "tagged" => Representation::Tagged,
            "int64" => Representation::UnboxedInt64,
            "double" => Representation::UnboxedDouble,
            "none" => Representation::NoRepresentation,
            _ => return None,
        })
    }

    pub fn is_unboxed(self) -> bool {
        matches!(
            self,
            Representation::UnboxedInt64 | Representation::UnboxedDouble
        )
    }
}

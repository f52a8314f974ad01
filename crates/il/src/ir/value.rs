use crate::{
    compile_type::CompileType,
    ir::{InstrId, UseId},
};
use cranelift_entity::packed_option::PackedOption;

/// Where a use appears in its instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UseSite {
    Input,
    /// A slot of environment frame `frame` (0 is the outermost frame).
    Env { frame: u16 },
}

/// A use of a definition.
///
/// For an input use, `instruction.inputs[use_index] == self`; for an
/// environment use, `instruction.env.frames[frame].values[use_index] == self`.
#[derive(Clone, Debug)]
pub struct ValueData {
    pub definition: InstrId,
    pub instruction: InstrId,
    pub use_index: u32,
    pub site: UseSite,
    pub prev_use: PackedOption<UseId>,
    pub next_use: PackedOption<UseId>,
    /// Type of the value at this use, if narrower than the definition's.
    pub reaching_type: Option<CompileType>,
    /// Whether the use is linked into its definition's use list.
    pub attached: bool,
}

impl ValueData {
    pub fn is_env_use(&self) -> bool {
        matches!(self.site, UseSite::Env { .. })
    }
}

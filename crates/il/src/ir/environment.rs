use crate::{
    ir::{DeoptId, UseId},
    object_model::FunctionId,
};

/// Interpreter-visible state of one (possibly inlined) frame.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvFrame {
    pub function: FunctionId,
    /// Parameters first, then locals and the expression stack.
    pub values: Vec<UseId>,
    pub fixed_parameter_count: u32,
    /// For the innermost frame, the deopt id of the instruction; for outer
    /// frames, the deopt id of the call that was inlined.
    pub deopt_id: DeoptId,
}

/// The full state needed to resume in unoptimized code. Frames are
/// stored outermost first.
#[derive(Clone, Debug, PartialEq)]
pub struct Environment {
    pub frames: Vec<EnvFrame>,
    /// Lazy deoptimization resumes before the instruction instead of after
    /// it, so the environment need not hold the call's arguments.
    pub lazy_deopt_to_before: bool,
}

impl Environment {
    pub fn innermost(&self) -> &EnvFrame {
        self.frames
            .last()
            .unwrap_or_else(|| panic!("environment without frames"))
    }

    pub fn outermost(&self) -> &EnvFrame {
        &self.frames[0]
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Total number of values across frames.
    pub fn len(&self) -> usize {
        self.frames.iter().map(|f| f.values.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn uses(&self) -> impl Iterator<Item = UseId> + '_ {
        self.frames.iter().flat_map(|f| f.values.iter().copied())
    }
}

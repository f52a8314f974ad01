//! Inline-cache feedback collected by unoptimized code.

use crate::{
    ir::DeoptId,
    object_model::{ClassId, FunctionId},
};
use compact_str::CompactString;
use ember_core::{HashMap, HashSet};
use smallvec::SmallVec;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NamedArgument {
    pub name: CompactString,
    /// Index of the argument in call order (type arguments excluded).
    pub position: u32,
}

/// Shape of the arguments passed at a call site.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArgumentsDescriptor {
    pub type_args_len: u32,
    /// Total argument count, including the receiver and named arguments,
    /// excluding the type argument vector.
    pub count: u32,
    /// Named arguments sorted by name.
    pub named: SmallVec<[NamedArgument; 2]>,
}

impl ArgumentsDescriptor {
    /// `names` are the names of the trailing `names.len()` arguments, in
    /// call order.
    pub fn new(count: u32, names: &[&str]) -> Self {
        assert!(names.len() as u32 <= count);
        let first_named = count - names.len() as u32;
        let mut named: SmallVec<[NamedArgument; 2]> = names
            .iter()
            .enumerate()
            .map(|(i, name)| NamedArgument {
                name: (*name).into(),
                position: first_named + i as u32,
            })
            .collect();
        named.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            type_args_len: 0,
            count,
            named,
        }
    }

    pub fn positional(count: u32) -> Self {
        Self::new(count, &[])
    }

    pub fn with_type_args(mut self, type_args_len: u32) -> Self {
        self.type_args_len = type_args_len;
        self
    }

    pub fn positional_count(&self) -> u32 {
        self.count - self.named.len() as u32
    }

    pub fn named_count(&self) -> u32 {
        self.named.len() as u32
    }

    /// Number of argument values pushed by the caller.
    pub fn size_with_type_args(&self) -> u32 {
        self.count + u32::from(self.type_args_len > 0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ICCheck {
    /// Class ids of the first `num_args_tested` arguments.
    pub cids: SmallVec<[ClassId; 2]>,
    pub target: FunctionId,
    pub count: u64,
}

/// Inline cache state of one call site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ICData {
    pub selector: CompactString,
    pub args_desc: ArgumentsDescriptor,
    pub num_args_tested: u8,
    pub checks: Vec<ICCheck>,
}

impl ICData {
    pub fn new(selector: impl Into<CompactString>, args_desc: ArgumentsDescriptor, num_args_tested: u8) -> Self {
        Self {
            selector: selector.into(),
            args_desc,
            num_args_tested,
            checks: Vec::new(),
        }
    }

    pub fn add_check(&mut self, cids: &[ClassId], target: FunctionId, count: u64) {
        assert_eq!(cids.len(), self.num_args_tested as usize);
        if let Some(existing) = self.checks.iter_mut().find(|c| c.cids.as_slice() == cids) {
            existing.count += count;
            return;
        }
        self.checks.push(ICCheck {
            cids: cids.into(),
            target,
            count,
        });
    }

    pub fn number_of_checks(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn aggregate_count(&self) -> u64 {
        self.checks.iter().map(|c| c.count).sum()
    }

    pub fn has_one_target(&self) -> bool {
        self.checks
            .first()
            .is_some_and(|first| self.checks.iter().all(|c| c.target == first.target))
    }

    /// Whether every recorded check saw exactly `cid` for all tested
    /// arguments.
    pub fn has_only_cid(&self, cid: ClassId) -> bool {
        !self.checks.is_empty()
            && self
                .checks
                .iter()
                .all(|c| c.cids.iter().all(|&arg_cid| arg_cid == cid))
    }

    /// Whether every tested argument of every check has one of `cids`.
    pub fn has_only_cids(&self, cids: &[ClassId]) -> bool {
        !self.checks.is_empty()
            && self
                .checks
                .iter()
                .all(|c| c.cids.iter().all(|arg_cid| cids.contains(arg_cid)))
    }

    pub fn has_receiver_class_id(&self, cid: ClassId) -> bool {
        self.checks.iter().any(|c| c.cids.first() == Some(&cid))
    }
}

/// Feedback for one function, keyed by the deopt id of each call site.
#[derive(Clone, Debug, Default)]
pub struct TypeFeedback {
    ic_data: HashMap<DeoptId, ICData>,
    /// Call sites whose speculative specialization deoptimized too often.
    blacklisted: HashSet<DeoptId>,
}

impl TypeFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, deopt_id: DeoptId, data: ICData) {
        self.ic_data.insert(deopt_id, data);
    }

    pub fn get(&self, deopt_id: DeoptId) -> Option<&ICData> {
        self.ic_data.get(&deopt_id)
    }

    pub fn get_mut(&mut self, deopt_id: DeoptId) -> Option<&mut ICData> {
        self.ic_data.get_mut(&deopt_id)
    }

    pub fn blacklist(&mut self, deopt_id: DeoptId) {
        self.blacklisted.insert(deopt_id);
    }

    pub fn is_blacklisted(&self, deopt_id: DeoptId) -> bool {
        self.blacklisted.contains(&deopt_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_arguments_are_sorted_by_name() {
        let desc = ArgumentsDescriptor::new(4, &["z", "a"]);
        assert_eq!(desc.positional_count(), 2);
        assert_eq!(desc.named[0].name, "a");
        assert_eq!(desc.named[0].position, 3);
        assert_eq!(desc.named[1].name, "z");
        assert_eq!(desc.named[1].position, 2);
    }
}

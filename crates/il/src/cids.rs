//! Class-id range projections of inline-cache feedback.

use crate::{
    feedback::ICData,
    object_model::{ClassId, ClassTable, FunctionId, cid},
};
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};

/// An inclusive range of class ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CidRange {
    pub start: ClassId,
    pub end: ClassId,
}

impl CidRange {
    pub fn new(start: ClassId, end: ClassId) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn single(cid: ClassId) -> Self {
        Self::new(cid, cid)
    }

    pub fn contains(&self, cid: ClassId) -> bool {
        self.start <= cid && cid <= self.end
    }

    pub fn is_single_cid(&self) -> bool {
        self.start == self.end
    }

    pub fn extent(&self) -> u32 {
        self.end - self.start
    }
}

impl Display for CidRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_single_cid() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Sorted, non-overlapping, non-adjacent cid ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Cids {
    ranges: SmallVec<[CidRange; 4]>,
}

impl Cids {
    /// Word bits usable for a cid bit mask on every target.
    pub const MAX_BIT_TEST_EXTENT: u32 = 31;

    pub fn create_monomorphic(cid: ClassId) -> Self {
        Self {
            ranges: SmallVec::from_elem(CidRange::single(cid), 1),
        }
    }

    /// Builds a set from arbitrary ranges, sorting them and merging
    /// overlapping or adjacent ones.
    pub fn from_ranges(ranges: impl IntoIterator<Item = CidRange>) -> Self {
        let mut sorted: SmallVec<[CidRange; 4]> = ranges.into_iter().collect();
        sorted.sort_by_key(|r| r.start);

        let mut merged: SmallVec<[CidRange; 4]> = SmallVec::new();
        for range in sorted {
            match merged.last_mut() {
                Some(last) if range.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    /// Receiver (or argument `arg_nr`) class ids seen by an inline cache.
    pub fn from_ic_data(ic_data: &ICData, arg_nr: usize) -> Self {
        Self::from_ranges(
            ic_data
                .checks
                .iter()
                .filter_map(|check| check.cids.get(arg_nr).copied())
                .map(CidRange::single),
        )
    }

    pub fn ranges(&self) -> &[CidRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn is_monomorphic(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0].is_single_cid()
    }

    pub fn monomorphic_receiver_cid(&self) -> Option<ClassId> {
        self.is_monomorphic().then(|| self.ranges[0].start)
    }

    pub fn contains(&self, cid: ClassId) -> bool {
        self.ranges.iter().any(|r| r.contains(cid))
    }

    pub fn lowest(&self) -> ClassId {
        self.ranges.first().map_or(cid::ILLEGAL, |r| r.start)
    }

    pub fn highest(&self) -> ClassId {
        self.ranges.last().map_or(cid::ILLEGAL, |r| r.end)
    }

    pub fn count_cids(&self) -> u32 {
        self.ranges.iter().map(|r| r.extent() + 1).sum()
    }

    /// Whether a membership test is best done with a single bit-mask
    /// test: several ranges spread over a span that fits in a word.
    pub fn is_bit_test(&self) -> bool {
        self.ranges.len() > 2 && self.highest() - self.lowest() < Self::MAX_BIT_TEST_EXTENT
    }

    /// Bit `i` is set when `lowest() + i` is a member.
    pub fn compute_cid_mask(&self) -> u64 {
        let base = self.lowest();
        let mut mask = 0u64;
        for range in &self.ranges {
            for c in range.start..=range.end {
                mask |= 1 << (c - base);
            }
        }
        mask
    }
}

impl Display for Cids {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TargetInfo {
    pub range: CidRange,
    pub target: FunctionId,
    pub count: u64,
}

/// Receiver cid ranges with the function each range dispatches to,
/// sorted by cid.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CallTargets {
    targets: SmallVec<[TargetInfo; 2]>,
}

impl CallTargets {
    pub fn new(mut targets: SmallVec<[TargetInfo; 2]>) -> Self {
        targets.sort_by_key(|t| t.range.start);
        let mut this = Self { targets };
        this.merge_adjacent();
        this
    }

    pub fn create_from_ic_data(ic_data: &ICData) -> Self {
        Self::new(
            ic_data
                .checks
                .iter()
                .filter_map(|check| {
                    let receiver = *check.cids.first()?;
                    Some(TargetInfo {
                        range: CidRange::single(receiver),
                        target: check.target,
                        count: check.count,
                    })
                })
                .collect(),
        )
    }

    /// Like [`CallTargets::create_from_ic_data`], but also widens ranges
    /// over cids that were never seen yet are known to dispatch to the
    /// same target, producing fewer and larger ranges.
    pub fn create_and_expand(ic_data: &ICData, classes: &ClassTable) -> Self {
        let mut this = Self::create_from_ic_data(ic_data);
        let mut i = 0;
        while i + 1 < this.targets.len() {
            let (current, next) = (&this.targets[i], &this.targets[i + 1]);
            let gap_dispatches_same = current.target == next.target
                && (current.range.end + 1..next.range.start).all(|c| {
                    classes.class(c).is_abstract
                        || classes.resolve_dynamic(c, &ic_data.selector) == Some(current.target)
                });
            if gap_dispatches_same {
                let next = this.targets.remove(i + 1);
                let current = &mut this.targets[i];
                current.range.end = next.range.end;
                current.count += next.count;
            } else {
                i += 1;
            }
        }
        this
    }

    fn merge_adjacent(&mut self) {
        let mut merged: SmallVec<[TargetInfo; 2]> = SmallVec::new();
        for info in self.targets.drain(..) {
            match merged.last_mut() {
                Some(last) if last.target == info.target && last.range.end + 1 == info.range.start => {
                    last.range.end = info.range.end;
                    last.count += info.count;
                }
                _ => merged.push(info),
            }
        }
        self.targets = merged;
    }

    pub fn targets(&self) -> &[TargetInfo] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn is_monomorphic(&self) -> bool {
        self.targets.len() == 1 && self.targets[0].range.is_single_cid()
    }

    pub fn aggregate_call_count(&self) -> u64 {
        self.targets.iter().map(|t| t.count).sum()
    }

    pub fn has_single_target(&self) -> bool {
        self.targets
            .first()
            .is_some_and(|first| self.targets.iter().all(|t| t.target == first.target))
    }

    pub fn first_target(&self) -> Option<FunctionId> {
        self.targets.first().map(|t| t.target)
    }

    pub fn most_popular_target(&self) -> Option<FunctionId> {
        self.targets
            .iter()
            .max_by_key(|t| t.count)
            .map(|t| t.target)
    }

    pub fn as_cids(&self) -> Cids {
        Cids::from_ranges(self.targets.iter().map(|t| t.range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{feedback::ArgumentsDescriptor, object_model::FunctionInfo};
    use cranelift_entity::EntityRef;

    #[test]
    fn ranges_are_sorted_and_merged() {
        let cids = Cids::from_ranges([
            CidRange::single(20),
            CidRange::single(18),
            CidRange::single(19),
            CidRange::new(30, 31),
        ]);
        assert_eq!(cids.ranges(), &[CidRange::new(18, 20), CidRange::new(30, 31)]);
        assert_eq!(cids.count_cids(), 5);
        assert!(cids.contains(19));
        assert!(!cids.contains(21));
        assert!(!cids.is_monomorphic());
    }

    #[test]
    fn bit_test_mask() {
        let cids = Cids::from_ranges([CidRange::single(20), CidRange::single(22), CidRange::single(25)]);
        assert!(cids.is_bit_test());
        assert_eq!(cids.compute_cid_mask(), 0b100101);

        let wide = Cids::from_ranges([CidRange::single(20), CidRange::single(22), CidRange::single(90)]);
        assert!(!wide.is_bit_test());
    }

    #[test]
    fn call_targets_expand_over_unseen_subclasses() {
        let mut classes = ClassTable::new();
        let a = classes.add_class("A", cid::OBJECT);
        let b = classes.add_class("B", a);
        let c = classes.add_class("C", a);
        let foo = classes.add_method(a, "foo", FunctionInfo::new("A.foo", a, 1));

        let mut ic = ICData::new("foo", ArgumentsDescriptor::positional(1), 1);
        ic.add_check(&[a], foo, 3);
        ic.add_check(&[c], foo, 4);

        let plain = CallTargets::create_from_ic_data(&ic);
        assert_eq!(plain.len(), 2);

        let expanded = CallTargets::create_and_expand(&ic, &classes);
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded.targets()[0].range, CidRange::new(a, c));
        assert_eq!(expanded.aggregate_call_count(), 7);
        assert!(expanded.as_cids().contains(b));
    }

    #[test]
    fn most_popular_target() {
        let f0 = FunctionId::new(0);
        let f1 = FunctionId::new(1);
        let targets = CallTargets::new(
            [
                TargetInfo {
                    range: CidRange::single(40),
                    target: f0,
                    count: 1,
                },
                TargetInfo {
                    range: CidRange::single(44),
                    target: f1,
                    count: 9,
                },
            ]
            .into_iter()
            .collect(),
        );
        assert!(!targets.has_single_target());
        assert_eq!(targets.most_popular_target(), Some(f1));
    }
}

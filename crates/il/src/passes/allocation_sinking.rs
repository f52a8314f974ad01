//! Allocation sinking.
//!
//! An allocation whose object is only written to and observed by
//! deoptimization environments never needs to exist while the optimized
//! code runs. The allocation and the stores into it are removed, and
//! every environment that referred to the object instead refers to a
//! `MaterializeObject` describing its field values at that point. The
//! deoptimizer rebuilds the object from that description.
//!
//! Objects stored into other sunk objects are sunk too, as long as the
//! stores do not form a cycle. Anything else makes the allocation escape.

use crate::{
    BlockId, FlowGraph, InstrId, InstrKind, UseId,
    ir::{self, UseSite},
    object_model::Slot,
};
use cranelift_entity::SecondaryMap;
use ember_core::{HashMap, HashSet};
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SafeUseCheck {
    /// Stores into any allocation are assumed to be stores into a
    /// candidate.
    Optimistic,
    /// Stores into another allocation are safe only if it is still a
    /// candidate.
    Strict,
}

pub struct AllocationSinking<'g> {
    graph: &'g mut FlowGraph,
    candidates: Vec<InstrId>,
    is_candidate: SecondaryMap<InstrId, bool>,
    /// Materialization of a candidate at an exit.
    materialized: HashMap<(InstrId, InstrId), InstrId>,
    materializations: Vec<InstrId>,
    created_phis: Vec<InstrId>,
    field_values: FieldValues,
}

/// Memoized values of candidate fields at block boundaries.
#[derive(Default)]
struct FieldValues {
    at_entry: HashMap<(InstrId, u32, BlockId), InstrId>,
    at_end: HashMap<(InstrId, u32, BlockId), InstrId>,
}

impl<'g> AllocationSinking<'g> {
    pub fn new(graph: &'g mut FlowGraph) -> Self {
        Self {
            graph,
            candidates: Vec::new(),
            is_candidate: SecondaryMap::new(),
            materialized: HashMap::default(),
            materializations: Vec::new(),
            created_phis: Vec::new(),
            field_values: FieldValues::default(),
        }
    }

    /// Returns whether any allocation was removed. Loads from the
    /// candidates must have been forwarded already.
    pub fn optimize(graph: &'g mut FlowGraph) -> bool {
        let _span = tracing::debug_span!("allocation_sinking", function = graph.name()).entered();
        let mut this = Self::new(graph);
        this.collect_candidates();
        loop {
            this.discover_failed_candidates();
            if this.candidates.is_empty() {
                return false;
            }
            let exits = this.collect_exits();
            this.insert_materializations(&exits);

            // A field value merging a candidate with something else makes
            // that candidate escape into a phi.
            let escaped = this.candidates_used_by_created_phis();
            if escaped.is_empty() {
                break;
            }
            this.roll_back_materializations();
            for candidate in escaped {
                this.is_candidate[candidate] = false;
            }
        }

        for candidate in this.candidates.clone() {
            tracing::debug!("sinking {}", this.graph.display_instr(candidate));
        }
        this.eliminate_allocations();
        this.remove_unused_materializations();
        true
    }

    fn is_safe_use(&self, u: UseId, check: SafeUseCheck) -> bool {
        let value = &self.graph.uses[u];
        if value.is_env_use() {
            return true;
        }
        let user = value.instruction;
        let InstrKind::StoreInstanceField(_) = self.graph.instrs[user].kind else {
            return false;
        };
        if value.use_index == 0 {
            return true;
        }
        let instance = self.graph.input_at(user, 0);
        instance != value.definition
            && matches!(self.graph.instrs[instance].kind, InstrKind::AllocateObject(_))
            && (check == SafeUseCheck::Optimistic || self.is_candidate[instance])
    }

    fn all_uses_safe(&self, alloc: InstrId, check: SafeUseCheck) -> bool {
        self.graph.all_uses(alloc).into_iter().all(|u| self.is_safe_use(u, check))
    }

    pub fn collect_candidates(&mut self) {
        for &block in self.graph.reverse_postorder() {
            for instr in self.graph.block_instrs(block) {
                if matches!(self.graph.instrs[instr].kind, InstrKind::AllocateObject(_))
                    && self.all_uses_safe(instr, SafeUseCheck::Optimistic)
                {
                    self.is_candidate[instr] = true;
                    self.candidates.push(instr);
                }
            }
        }
        tracing::trace!(count = self.candidates.len(), "allocation sinking candidates");
    }

    /// Drops candidates stored into objects that escape, until no more
    /// change, then candidates whose stores form a cycle.
    pub fn discover_failed_candidates(&mut self) {
        loop {
            let mut changed = true;
            while changed {
                changed = false;
                for &candidate in &self.candidates {
                    if self.is_candidate[candidate] && !self.all_uses_safe(candidate, SafeUseCheck::Strict) {
                        self.is_candidate[candidate] = false;
                        changed = true;
                    }
                }
            }
            let is_candidate = &self.is_candidate;
            self.candidates.retain(|&c| is_candidate[c]);

            let cyclic: Vec<InstrId> = self
                .candidates
                .iter()
                .copied()
                .filter(|&c| self.reaches(c, c))
                .collect();
            if cyclic.is_empty() {
                return;
            }
            for candidate in cyclic {
                self.is_candidate[candidate] = false;
            }
        }
    }

    /// Candidates that `candidate` is stored into.
    fn containers(&self, candidate: InstrId) -> SmallVec<[InstrId; 2]> {
        self.graph
            .input_uses(candidate)
            .filter(|&u| {
                let value = &self.graph.uses[u];
                value.use_index == 1
                    && matches!(self.graph.instrs[value.instruction].kind, InstrKind::StoreInstanceField(_))
            })
            .map(|u| self.graph.input_at(self.graph.uses[u].instruction, 0))
            .filter(|&container| self.is_candidate[container])
            .collect()
    }

    /// Whether `to` is reachable from `from` through one or more stores.
    fn reaches(&self, from: InstrId, to: InstrId) -> bool {
        let mut seen: HashSet<InstrId> = HashSet::default();
        let mut stack: Vec<InstrId> = self.containers(from).to_vec();
        while let Some(next) = stack.pop() {
            if next == to {
                return true;
            }
            if seen.insert(next) {
                stack.extend(self.containers(next));
            }
        }
        false
    }

    /// Candidates ordered so that an object comes before the objects it
    /// is stored into.
    fn materialization_order(&self) -> Vec<InstrId> {
        let mut order = Vec::with_capacity(self.candidates.len());
        let mut placed: HashSet<InstrId> = HashSet::default();
        let mut pending = self.candidates.clone();
        while !pending.is_empty() {
            pending.retain(|&c| {
                let ready = self
                    .candidates
                    .iter()
                    .all(|&other| placed.contains(&other) || !self.containers(other).contains(&c));
                if ready {
                    placed.insert(c);
                    order.push(c);
                }
                !ready
            });
        }
        order
    }

    /// For each instruction whose environment needs some candidate, the
    /// candidates to materialize before it, in materialization order.
    fn collect_exits(&self) -> Vec<(InstrId, Vec<InstrId>)> {
        let mut exits: HashMap<InstrId, Vec<InstrId>> = HashMap::default();
        for &candidate in &self.candidates {
            let mut users: Vec<InstrId> = self
                .graph
                .env_uses(candidate)
                .map(|u| self.graph.uses[u].instruction)
                .collect();
            users.sort_unstable();
            users.dedup();
            exits.insert(candidate, users);
        }

        // An object stored into an object materialized at an exit is
        // materialized there too.
        let mut changed = true;
        while changed {
            changed = false;
            for &candidate in &self.candidates {
                for container in self.containers(candidate) {
                    let inherited = exits[&container].clone();
                    let own = exits.get_mut(&candidate).unwrap_or_else(|| unreachable!());
                    for exit in inherited {
                        if !own.contains(&exit) {
                            own.push(exit);
                            changed = true;
                        }
                    }
                }
            }
        }

        let mut by_exit: HashMap<InstrId, Vec<InstrId>> = HashMap::default();
        for candidate in self.materialization_order() {
            for &exit in &exits[&candidate] {
                by_exit.entry(exit).or_default().push(candidate);
            }
        }
        let mut result: Vec<(InstrId, Vec<InstrId>)> = by_exit.into_iter().collect();
        result.sort_unstable_by_key(|(exit, _)| *exit);
        result
    }

    pub fn insert_materializations(&mut self, exits: &[(InstrId, Vec<InstrId>)]) {
        for (exit, candidates) in exits {
            for &candidate in candidates {
                self.create_materialization_at(*exit, candidate);
            }
        }
    }

    fn create_materialization_at(&mut self, exit: InstrId, candidate: InstrId) {
        let InstrKind::AllocateObject(alloc) = &self.graph.instrs[candidate].kind else {
            unreachable!("candidates are allocations")
        };
        let cls = alloc.cls;
        let slots: Vec<Slot> = self.graph.classes.instance_slots(cls);

        let mut values = Vec::with_capacity(slots.len());
        for slot in &slots {
            let mut value = self.value_before(candidate, slot.offset_in_words, exit);
            if let Some(&inner) = self.materialized.get(&(exit, value)) {
                value = inner;
            }
            values.push(value);
        }

        let mat = self.graph.new_instr(
            InstrKind::MaterializeObject(ir::MaterializeObject { cls, slots }),
            &values,
        );
        self.graph.instrs[mat].token_pos = self.graph.instrs[candidate].token_pos;
        self.graph.insert_before(exit, mat);
        self.materialized.insert((exit, candidate), mat);
        self.materializations.push(mat);
    }

    /// The value of field `offset` of `alloc` right before `instr`.
    fn value_before(&mut self, alloc: InstrId, offset: u32, instr: InstrId) -> InstrId {
        let mut current = self.graph.instrs[instr].prev.expand();
        while let Some(i) = current {
            if let Some(value) = self.defined_by(alloc, offset, i) {
                return value;
            }
            current = self.graph.instrs[i].prev.expand();
        }
        let block = self
            .graph
            .block_of(instr)
            .unwrap_or_else(|| panic!("exit {instr:?} is not in the graph"));
        self.value_at_entry(alloc, offset, block)
    }

    /// The field value established by `instr`, if it is the allocation
    /// or a store into the field.
    fn defined_by(&mut self, alloc: InstrId, offset: u32, instr: InstrId) -> Option<InstrId> {
        if instr == alloc {
            return Some(self.graph.constant_null());
        }
        match &self.graph.instrs[instr].kind {
            InstrKind::StoreInstanceField(store)
                if store.slot.offset_in_words == offset && self.graph.input_at(instr, 0) == alloc =>
            {
                Some(self.graph.input_at(instr, 1))
            }
            _ => None,
        }
    }

    fn value_at_end(&mut self, alloc: InstrId, offset: u32, block: BlockId) -> InstrId {
        if let Some(&value) = self.field_values.at_end.get(&(alloc, offset, block)) {
            return value;
        }
        let mut current = self.graph.blocks[block].last.expand();
        let mut found = None;
        while let Some(i) = current {
            if let Some(value) = self.defined_by(alloc, offset, i) {
                found = Some(value);
                break;
            }
            current = self.graph.instrs[i].prev.expand();
        }
        let value = match found {
            Some(value) => value,
            None => self.value_at_entry(alloc, offset, block),
        };
        self.field_values.at_end.insert((alloc, offset, block), value);
        value
    }

    /// The allocation dominates every exit, so walking predecessors from
    /// an exit always ends at the allocation.
    fn value_at_entry(&mut self, alloc: InstrId, offset: u32, block: BlockId) -> InstrId {
        let key = (alloc, offset, block);
        if let Some(&value) = self.field_values.at_entry.get(&key) {
            return value;
        }
        let preds = self.graph.blocks[block].predecessors.clone();
        match preds.as_slice() {
            [] => panic!("allocation {alloc:?} does not dominate block {block:?}"),
            [pred] => {
                let value = self.value_at_end(alloc, offset, *pred);
                self.field_values.at_entry.insert(key, value);
                value
            }
            preds => {
                // Registered before reading the predecessors, which may
                // reach this block again around a loop.
                let phi = self.graph.add_phi(block, &[]);
                self.created_phis.push(phi);
                self.field_values.at_entry.insert(key, phi);
                for &pred in preds {
                    let value = self.value_at_end(alloc, offset, pred);
                    self.graph.add_input(phi, value);
                }
                self.try_remove_trivial_phi(phi)
            }
        }
    }

    fn try_remove_trivial_phi(&mut self, phi: InstrId) -> InstrId {
        let mut same = None;
        for input in self.graph.inputs(phi) {
            if input == phi || Some(input) == same {
                continue;
            }
            if same.is_some() {
                return phi;
            }
            same = Some(input);
        }
        let Some(same) = same else {
            return phi;
        };
        self.graph.replace_all_uses_with(phi, same);
        self.graph.remove_phi(phi);
        for memo in [&mut self.field_values.at_entry, &mut self.field_values.at_end] {
            for value in memo.values_mut() {
                if *value == phi {
                    *value = same;
                }
            }
        }
        same
    }

    fn candidates_used_by_created_phis(&self) -> Vec<InstrId> {
        let mut escaped = Vec::new();
        for &phi in &self.created_phis {
            if !self.graph.is_attached(phi) {
                continue;
            }
            for input in self.graph.inputs(phi) {
                if self.is_candidate[input] && !escaped.contains(&input) {
                    escaped.push(input);
                }
            }
        }
        escaped
    }

    fn roll_back_materializations(&mut self) {
        for mat in std::mem::take(&mut self.materializations).into_iter().rev() {
            self.graph.remove_from_graph(mat);
        }
        for phi in std::mem::take(&mut self.created_phis).into_iter().rev() {
            if self.graph.is_attached(phi) {
                self.graph.remove_phi(phi);
            }
        }
        self.materialized.clear();
        self.field_values = FieldValues::default();
    }

    /// Removes the candidates and the stores into them. Environments see
    /// the materializations instead.
    pub fn eliminate_allocations(&mut self) {
        for candidate in self.candidates.clone() {
            for u in self.graph.input_uses(candidate).collect::<SmallVec<[UseId; 8]>>() {
                let value = &self.graph.uses[u];
                let store = value.instruction;
                if value.use_index == 0 && self.graph.is_attached(store) {
                    self.graph.remove_from_graph(store);
                }
            }
        }
        for candidate in self.candidates.clone() {
            self.eliminate_allocation(candidate);
        }
    }

    fn eliminate_allocation(&mut self, candidate: InstrId) {
        let env_uses: SmallVec<[UseId; 8]> = self.graph.env_uses(candidate).collect();
        for u in env_uses {
            debug_assert!(matches!(self.graph.uses[u].site, UseSite::Env { .. }));
            let exit = self.graph.uses[u].instruction;
            let mat = self
                .materialized
                .get(&(exit, candidate))
                .copied()
                .unwrap_or_else(|| panic!("no materialization of {candidate:?} at {exit:?}"));
            self.graph.set_use_definition(u, mat);
        }
        // Stores of this object into other candidates are gone already.
        debug_assert!(!self.graph.has_uses(candidate));
        self.graph.remove_from_graph(candidate);
    }

    /// Removes materializations that no environment (or other
    /// materialization) ended up referring to, and field phis created for
    /// them.
    pub fn remove_unused_materializations(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            for &mat in self.materializations.iter().rev() {
                if self.graph.is_attached(mat) && !self.graph.has_uses(mat) {
                    self.graph.remove_from_graph(mat);
                    changed = true;
                }
            }
            for &phi in &self.created_phis {
                if self.graph.is_attached(phi) && !self.graph.has_uses(phi) {
                    self.graph.remove_phi(phi);
                    changed = true;
                }
            }
        }
        let graph = &*self.graph;
        self.materializations.retain(|&m| graph.is_attached(m));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parser::parse_program, validation::check_flow_graph};
    use ember_core::CompilerConfig;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn parse(src: &str) -> FlowGraph {
        parse_program(src).unwrap().into_first().unwrap().graph
    }

    fn live(graph: &FlowGraph, name: &str) -> Vec<InstrId> {
        graph
            .instrs
            .keys()
            .filter(|&i| graph.is_attached(i) && graph.instrs[i].kind.name() == name)
            .collect()
    }

    fn check(graph: &FlowGraph) {
        check_flow_graph(graph, &CompilerConfig::default()).unwrap();
    }

    #[test]
    fn object_only_seen_by_deoptimization_is_sunk() {
        tracing_subscriber::fmt::try_init().ok();
        let mut graph = parse(indoc! {"
            (program
                (class P Object (fields x y))
                (graph f
                    (block B1 function_entry
                        (v0 parameter 0)
                        (v1 allocate_object P)
                        (store_field (slot x 1) init v1 v0)
                        (store_field (slot y 2) init v1 2)
                        (check_smi v0 (deopt 4) (env (frame f 1 4 v0 v1)))
                        (return v0))))
        "});
        assert!(AllocationSinking::optimize(&mut graph));
        check(&graph);
        assert!(live(&graph, "allocate_object").is_empty());
        assert!(live(&graph, "store_field").is_empty());

        let [mat] = live(&graph, "materialize_object")[..] else {
            panic!("expected one materialization");
        };
        let check_smi = live(&graph, "check_smi")[0];
        assert_eq!(graph.instrs[mat].next.expand(), Some(check_smi));
        assert_eq!(graph.env_value(check_smi, 0, 1), mat);
        let param = graph.env_value(check_smi, 0, 0);
        assert_eq!(graph.input_at(mat, 0), param);
        assert_eq!(graph.constant_value(graph.input_at(mat, 1)).and_then(|c| c.as_int()), Some(2));
    }

    #[test]
    fn escaping_objects_stay() {
        tracing_subscriber::fmt::try_init().ok();
        let mut graph = parse(indoc! {"
            (program
                (class P Object (fields x))
                (graph f
                    (block B1 function_entry
                        (v0 parameter 0)
                        (v1 allocate_object P)
                        (v2 allocate_object P)
                        (store_field (slot x 1) v1 v2)
                        (check_smi v0 (deopt 4) (env (frame f 1 4 v0 v2)))
                        (return v1))))
        "});
        assert!(!AllocationSinking::optimize(&mut graph));
        assert_eq!(live(&graph, "allocate_object").len(), 2);
        assert!(live(&graph, "materialize_object").is_empty());
    }

    #[test]
    fn field_values_merge_at_joins() {
        tracing_subscriber::fmt::try_init().ok();
        let mut graph = parse(indoc! {"
            (program
                (class P Object (fields x))
                (graph f
                    (block B1 function_entry
                        (v0 parameter 0)
                        (v1 parameter 1)
                        (v2 allocate_object P)
                        (branch B2 B3 v1))
                    (block B2 target
                        (store_field (slot x 1) v2 1)
                        (goto B4))
                    (block B3 target
                        (goto B4))
                    (block B4 join
                        (check_smi v0 (deopt 4) (env (frame f 2 4 v0 v1 v2)))
                        (return v0))))
        "});
        assert!(AllocationSinking::optimize(&mut graph));
        check(&graph);
        let [mat] = live(&graph, "materialize_object")[..] else {
            panic!("expected one materialization");
        };
        let field = graph.input_at(mat, 0);
        assert!(graph.instrs[field].is_phi());
        let inputs: Vec<_> = graph
            .inputs(field)
            .map(|i| graph.constant_value(i).cloned())
            .collect();
        assert!(inputs.contains(&Some(ir::ConstValue::Int(1))));
        assert!(inputs.contains(&Some(ir::ConstValue::Null)));
    }

    #[test]
    fn nested_objects_materialize_inner_first() {
        tracing_subscriber::fmt::try_init().ok();
        let mut graph = parse(indoc! {"
            (program
                (class P Object (fields x))
                (graph f
                    (block B1 function_entry
                        (v0 parameter 0)
                        (v1 allocate_object P)
                        (v2 allocate_object P)
                        (store_field (slot x 1) v1 v0)
                        (store_field (slot x 1) v2 v1)
                        (check_smi v0 (deopt 4) (env (frame f 1 4 v0 v2)))
                        (return v0))))
        "});
        assert!(AllocationSinking::optimize(&mut graph));
        check(&graph);
        let mats = live(&graph, "materialize_object");
        assert_eq!(mats.len(), 2);
        let check_smi = live(&graph, "check_smi")[0];
        let outer = graph.env_value(check_smi, 0, 1);
        let inner = graph.input_at(outer, 0);
        assert!(matches!(graph.instrs[inner].kind, InstrKind::MaterializeObject(_)));
        assert!(graph.instr_dominates(inner, outer));
    }

    #[test]
    fn objects_stored_into_escaping_objects_escape() {
        tracing_subscriber::fmt::try_init().ok();
        let mut graph = parse(indoc! {"
            (program
                (class P Object (fields x))
                (graph f
                    (block B1 function_entry
                        (v0 parameter 0)
                        (v1 allocate_object P)
                        (v2 allocate_object P)
                        (v3 allocate_object P)
                        (store_field (slot x 1) v2 v1)
                        (store_field (slot x 1) v3 v2)
                        (check_smi v0 (deopt 4) (env (frame f 1 4 v0 v1)))
                        (return v3))))
        "});
        assert!(!AllocationSinking::optimize(&mut graph));
        assert_eq!(live(&graph, "allocate_object").len(), 3);
    }
}

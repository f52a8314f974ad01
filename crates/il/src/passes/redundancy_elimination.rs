//! Passes removing redundant computations and memory operations.

use crate::{BlockId, FlowGraph, InstrId, InstrKind, UseId};
use cranelift_entity::EntitySet;
use ember_core::{HashMap, HashSet};
use smallvec::SmallVec;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CseKey {
    name: &'static str,
    inputs: SmallVec<[InstrId; 3]>,
}

/// Replaces a pure instruction by an equal one that dominates it.
pub struct DominatorBasedCse;

impl DominatorBasedCse {
    /// Returns whether the graph changed.
    pub fn optimize(graph: &mut FlowGraph) -> bool {
        let _span = tracing::debug_span!("cse", function = graph.name()).entered();

        enum Step {
            Enter(BlockId),
            Leave(Vec<CseKey>),
        }

        // Scoped to the dominator tree: an entry is visible exactly in
        // the blocks its instruction dominates.
        let mut table: HashMap<CseKey, SmallVec<[InstrId; 2]>> = HashMap::default();
        let mut changed = false;
        let mut stack = vec![Step::Enter(graph.graph_entry())];
        while let Some(step) = stack.pop() {
            let block = match step {
                Step::Enter(block) => block,
                Step::Leave(keys) => {
                    for key in keys {
                        if let Some(candidates) = table.get_mut(&key) {
                            candidates.pop();
                        }
                    }
                    continue;
                }
            };

            let mut added = Vec::new();
            for instr in graph.block_instrs_snapshot(block) {
                if !graph.instrs[instr].kind.allows_cse() {
                    continue;
                }
                let key = CseKey {
                    name: graph.instrs[instr].kind.name(),
                    inputs: graph.inputs(instr).collect(),
                };
                let existing = table.get(&key).and_then(|candidates| {
                    candidates
                        .iter()
                        .copied()
                        .find(|&c| graph.instrs[c].kind.attributes_equal(&graph.instrs[instr].kind))
                });
                match existing {
                    Some(dominating) => {
                        tracing::trace!(
                            "{} is redundant with {}",
                            graph.display_instr(instr),
                            graph.display_instr(dominating)
                        );
                        graph.replace_all_uses_with(instr, dominating);
                        graph.remove_from_graph(instr);
                        changed = true;
                    }
                    None => {
                        table.entry(key.clone()).or_default().push(instr);
                        added.push(key);
                    }
                }
            }

            stack.push(Step::Leave(added));
            for &child in graph.blocks[block].dominated.iter().rev() {
                stack.push(Step::Enter(child));
            }
        }
        changed
    }
}

/// A field of an object: the object's original definition and the
/// field's offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Place {
    instance: InstrId,
    offset: u32,
}

impl Place {
    fn of(graph: &FlowGraph, access: InstrId) -> Option<Place> {
        let slot = match &graph.instrs[access].kind {
            InstrKind::LoadField(load) => &load.slot,
            InstrKind::StoreInstanceField(store) => &store.slot,
            _ => return None,
        };
        Some(Place {
            instance: graph.original_definition(graph.input_at(access, 0)),
            offset: slot.offset_in_words,
        })
    }

    /// Distinct allocations are distinct objects; any other pair of
    /// definitions may refer to the same object.
    fn may_alias(self, other: Place, graph: &FlowGraph) -> bool {
        if self.offset != other.offset {
            return false;
        }
        let is_allocation = |def: InstrId| matches!(graph.instrs[def].kind, InstrKind::AllocateObject(_));
        self.instance == other.instance || !(is_allocation(self.instance) && is_allocation(other.instance))
    }
}

type Available = HashMap<Place, InstrId>;

/// Forwards stored (or previously loaded) field values to later loads of
/// the same field. Values reaching a join along different paths are
/// merged with a new phi.
pub struct LoadOptimizer<'g> {
    graph: &'g mut FlowGraph,
    immutable: HashSet<Place>,
    created_phis: Vec<InstrId>,
    forwarded: usize,
}

impl<'g> LoadOptimizer<'g> {
    /// Returns whether any load was removed.
    pub fn optimize(graph: &'g mut FlowGraph) -> bool {
        let _span = tracing::debug_span!("load_forwarding", function = graph.name()).entered();
        let mut this = LoadOptimizer {
            graph,
            immutable: HashSet::default(),
            created_phis: Vec::new(),
            forwarded: 0,
        };

        let mut out: HashMap<BlockId, Available> = HashMap::default();
        for block in this.graph.reverse_postorder().to_vec() {
            let state = this.entry_state(block, &out);
            let state = this.forward_block(block, state);
            out.insert(block, state);
        }
        this.remove_unused_phis();

        tracing::debug!(forwarded = this.forwarded, phis = this.created_phis.len());
        this.forwarded > 0
    }

    fn entry_state(&mut self, block: BlockId, out: &HashMap<BlockId, Available>) -> Available {
        let preds = self.graph.blocks[block].predecessors.clone();
        // Loop headers are entered before their back edges are known.
        let Some(states) = preds.iter().map(|p| out.get(p)).collect::<Option<SmallVec<[&Available; 2]>>>() else {
            return Available::default();
        };
        match states.as_slice() {
            [] => Available::default(),
            [single] => (*single).clone(),
            [first, rest @ ..] => {
                let mut merged = Available::default();
                // Sorted so that created phis are numbered deterministically.
                let mut candidates: Vec<(Place, InstrId)> = first.iter().map(|(&p, &v)| (p, v)).collect();
                candidates.sort_unstable();
                for (place, value) in candidates {
                    let mut values: SmallVec<[InstrId; 2]> = SmallVec::from_elem(value, 1);
                    for state in rest {
                        match state.get(&place) {
                            Some(&v) => values.push(v),
                            None => break,
                        }
                    }
                    if values.len() != states.len() {
                        continue;
                    }
                    let merged_value = if values.iter().all(|&v| v == value) {
                        value
                    } else {
                        let phi = self.graph.add_phi(block, &values);
                        self.created_phis.push(phi);
                        phi
                    };
                    merged.insert(place, merged_value);
                }
                merged
            }
        }
    }

    fn forward_block(&mut self, block: BlockId, mut state: Available) -> Available {
        for instr in self.graph.block_instrs_snapshot(block) {
            match &self.graph.instrs[instr].kind {
                InstrKind::LoadField(load) => {
                    let immutable = load.slot.is_immutable;
                    let Some(place) = Place::of(self.graph, instr) else {
                        continue;
                    };
                    if immutable {
                        self.immutable.insert(place);
                    }
                    match state.get(&place) {
                        Some(&value) => {
                            tracing::trace!("forwarding {} to {}", self.graph.display_instr(value), self.graph.display_instr(instr));
                            self.graph.replace_all_uses_with(instr, value);
                            self.graph.remove_from_graph(instr);
                            self.forwarded += 1;
                        }
                        None => {
                            state.insert(place, instr);
                        }
                    }
                }
                InstrKind::StoreInstanceField(_) => {
                    let Some(place) = Place::of(self.graph, instr) else {
                        continue;
                    };
                    let graph = &*self.graph;
                    state.retain(|&other, _| !other.may_alias(place, graph));
                    state.insert(place, graph.input_at(instr, 1));
                }
                InstrKind::AllocateObject(alloc) => {
                    // Fields of a fresh object are null until stored.
                    let slots = self.graph.classes.instance_slots(alloc.cls);
                    let null = self.graph.constant_null();
                    for slot in slots {
                        state.insert(
                            Place {
                                instance: instr,
                                offset: slot.offset_in_words,
                            },
                            null,
                        );
                    }
                }
                kind if kind.has_unknown_side_effects() => {
                    state.retain(|place, _| self.immutable.contains(place));
                }
                _ => {}
            }
        }
        state
    }

    fn remove_unused_phis(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            for &phi in &self.created_phis {
                if self.graph.is_attached(phi) && !self.graph.has_uses(phi) {
                    self.graph.remove_phi(phi);
                    changed = true;
                }
            }
        }
        let graph = &*self.graph;
        self.created_phis.retain(|&phi| graph.is_attached(phi));
    }
}

/// Removes stores overwritten later in the same block before anything
/// could observe the stored value.
pub struct DeadStoreElimination;

impl DeadStoreElimination {
    pub fn optimize(graph: &mut FlowGraph) -> bool {
        let _span = tracing::debug_span!("dead_store_elimination", function = graph.name()).entered();
        let mut changed = false;
        for block in graph.reverse_postorder().to_vec() {
            let mut overwritten: HashSet<Place> = HashSet::default();
            for instr in graph.block_instrs_snapshot(block).into_iter().rev() {
                let kind = &graph.instrs[instr].kind;
                match kind {
                    InstrKind::StoreInstanceField(_) => {
                        let Some(place) = Place::of(graph, instr) else {
                            continue;
                        };
                        if overwritten.contains(&place) {
                            tracing::trace!("removing dead store {}", graph.display_instr(instr));
                            graph.remove_from_graph(instr);
                            changed = true;
                        } else {
                            overwritten.insert(place);
                        }
                    }
                    InstrKind::LoadField(_) => {
                        let Some(place) = Place::of(graph, instr) else {
                            continue;
                        };
                        overwritten.retain(|other| !other.may_alias(place, graph));
                    }
                    // Deoptimization and exceptions expose the heap as it
                    // is at this point.
                    kind if kind.can_deoptimize()
                        || kind.may_throw()
                        || kind.has_unknown_side_effects()
                        || kind.is_control_flow() =>
                    {
                        overwritten.clear();
                    }
                    _ => {}
                }
            }
        }
        changed
    }
}

/// Removes definitions whose values are never used and that have no
/// effect besides producing them.
pub struct DeadCodeElimination;

impl DeadCodeElimination {
    pub fn is_removable(kind: &InstrKind) -> bool {
        kind.is_definition()
            && !kind.has_unknown_side_effects()
            && !kind.can_deoptimize()
            && !kind.may_throw()
            && !matches!(
                kind,
                InstrKind::Constant(_) | InstrKind::Parameter(_) | InstrKind::MoveArgument(_)
            )
    }

    pub fn optimize(graph: &mut FlowGraph) -> bool {
        let _span = tracing::debug_span!("dead_code_elimination", function = graph.name()).entered();

        let mut live = EntitySet::<InstrId>::new();
        let mut worklist = Vec::new();
        for &block in graph.reverse_postorder() {
            for instr in graph.block_instrs(block) {
                if !Self::is_removable(&graph.instrs[instr].kind) && live.insert(instr) {
                    worklist.push(instr);
                }
            }
        }
        while let Some(instr) = worklist.pop() {
            let data = &graph.instrs[instr];
            let uses: SmallVec<[UseId; 8]> = data
                .inputs
                .iter()
                .copied()
                .chain(data.env.iter().flat_map(|env| env.uses()))
                .collect();
            for u in uses {
                let def = graph.uses[u].definition;
                if live.insert(def) {
                    worklist.push(def);
                }
            }
        }

        let mut removed = 0;
        for block in graph.reverse_postorder().to_vec() {
            for phi in graph.blocks[block].phis.clone() {
                if !live.contains(phi) {
                    graph.remove_phi(phi);
                    removed += 1;
                }
            }
            for instr in graph.block_instrs_snapshot(block) {
                if !live.contains(instr) && Self::is_removable(&graph.instrs[instr].kind) {
                    graph.remove_from_graph(instr);
                    removed += 1;
                }
            }
        }
        tracing::debug!(removed);
        removed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{formatter::format_graph, parser::parse_program, validation::check_flow_graph};
    use ember_core::CompilerConfig;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn parse(src: &str) -> FlowGraph {
        parse_program(src).unwrap().into_first().unwrap().graph
    }

    fn count(graph: &FlowGraph, name: &str) -> usize {
        graph
            .reverse_postorder()
            .iter()
            .flat_map(|&b| graph.blocks[b].phis.iter().copied().chain(graph.block_instrs(b)))
            .filter(|&i| graph.instrs[i].kind.name() == name)
            .count()
    }

    fn check(graph: &FlowGraph) {
        check_flow_graph(graph, &CompilerConfig::default()).unwrap();
    }

    #[test]
    fn dominated_duplicates_are_removed() {
        let mut graph = parse(indoc! {"
            (graph f
                (block B1 function_entry
                    (v0 parameter 0)
                    (check_smi v0)
                    (v1 binary_smi_op + v0 1)
                    (check_smi v0)
                    (v2 binary_smi_op + v0 1)
                    (v3 binary_smi_op + v1 v2)
                    (return v3)))
        "});
        assert!(DominatorBasedCse::optimize(&mut graph));
        check(&graph);
        assert_eq!(count(&graph, "check_smi"), 1);
        assert_eq!(count(&graph, "binary_smi_op"), 2);
    }

    #[test]
    fn sibling_branches_do_not_share_values() {
        let mut graph = parse(indoc! {"
            (graph f
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 parameter 1)
                    (branch B2 B3 v1))
                (block B2 target
                    (v2 binary_smi_op + v0 1)
                    (return v2))
                (block B3 target
                    (v3 binary_smi_op + v0 1)
                    (return v3)))
        "});
        assert!(!DominatorBasedCse::optimize(&mut graph));
        assert_eq!(count(&graph, "binary_smi_op"), 2);
    }

    const DIAMOND_STORES: &str = indoc! {"
        (program
            (class A Object (fields x))
            (graph f
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 parameter 1)
                    (branch B2 B3 v1))
                (block B2 target
                    (store_field (slot x 1) v0 1)
                    (goto B4))
                (block B3 target
                    (store_field (slot x 1) v0 2)
                    (goto B4))
                (block B4 join
                    (v2 load_field (slot x 1) v0)
                    (return v2))))
    "};

    #[test]
    fn stores_on_both_paths_forward_through_a_phi() {
        let mut graph = parse(DIAMOND_STORES);
        assert!(LoadOptimizer::optimize(&mut graph));
        check(&graph);
        assert_eq!(count(&graph, "load_field"), 0);
        assert_eq!(count(&graph, "phi"), 1);
        let printed = format_graph(&graph).to_string();
        assert!(printed.contains("(return v"), "{printed}");
    }

    #[test]
    fn calls_kill_forwarded_values() {
        let mut graph = parse(indoc! {"
            (program
                (class A Object (fields x))
                (function g (fixed 0) static)
                (graph f
                    (block B1 function_entry
                        (v0 parameter 0)
                        (store_field (slot x 1) v0 1)
                        (v1 static_call g (args 0))
                        (v2 load_field (slot x 1) v0)
                        (return v2))))
        "});
        assert!(!LoadOptimizer::optimize(&mut graph));
        assert_eq!(count(&graph, "load_field"), 1);
    }

    #[test]
    fn fresh_objects_have_null_fields() {
        let mut graph = parse(indoc! {"
            (program
                (class A Object (fields x y))
                (graph f
                    (block B1 function_entry
                        (v0 allocate_object A)
                        (store_field (slot x 1) v0 7)
                        (v1 load_field (slot y 2) v0)
                        (v2 load_field (slot x 1) v0)
                        (return v1))))
        "});
        assert!(LoadOptimizer::optimize(&mut graph));
        check(&graph);
        assert_eq!(count(&graph, "load_field"), 0);
        let ret = graph.last_instruction(graph.reverse_postorder()[1]).unwrap();
        assert!(graph.constant_value(graph.input_at(ret, 0)).unwrap().is_null());
    }

    #[test]
    fn overwritten_stores_are_dead() {
        let mut graph = parse(indoc! {"
            (program
                (class A Object (fields x))
                (graph f
                    (block B1 function_entry
                        (v0 parameter 0)
                        (store_field (slot x 1) v0 1)
                        (store_field (slot x 1) v0 2)
                        (v1 load_field (slot x 1) v0)
                        (store_field (slot x 1) v0 3)
                        (return v1))))
        "});
        assert!(DeadStoreElimination::optimize(&mut graph));
        check(&graph);
        assert_eq!(count(&graph, "store_field"), 2);
    }

    #[test]
    fn unused_pure_definitions_and_phi_cycles_are_removed() {
        let mut graph = parse(indoc! {"
            (graph f
                (block B1 function_entry
                    (v0 parameter 0)
                    (v5 unbox int64 v0)
                    (v1 binary_int64_op + v5 v5)
                    (goto B2))
                (block B2 join (preds B1 B3)
                    (v2 phi 0 v3)
                    (v4 relational_op < _Smi v0 10)
                    (branch B3 B4 v4))
                (block B3 target
                    (v3 box int64 v1)
                    (goto B2))
                (block B4 target
                    (check_smi v0)
                    (return v0)))
        "});
        assert!(DeadCodeElimination::optimize(&mut graph));
        check(&graph);
        assert_eq!(count(&graph, "phi"), 0);
        assert_eq!(count(&graph, "box"), 0);
        assert_eq!(count(&graph, "binary_int64_op"), 0);
        assert_eq!(count(&graph, "unbox"), 0);
        assert_eq!(count(&graph, "check_smi"), 1);
        assert_eq!(count(&graph, "relational_op"), 1);
    }
}

//! Computes the static type of every definition.
//!
//! Phi types are found by a fixpoint over the definitions, growing each
//! phi's type monotonically from `none`. Uses dominated by a check on
//! their definition see the narrower type the check guarantees: such
//! uses get a reaching type, so the definition's own type stays valid
//! everywhere.

use crate::{
    FlowGraph, InstrId, UseId,
    compile_type::CompileType,
    ir::{self, InstrKind},
    visitor::FlowGraphVisitor,
};
use cranelift_entity::SecondaryMap;
use smallvec::SmallVec;
use std::collections::VecDeque;

pub fn propagate_types(graph: &mut FlowGraph) {
    let _span = tracing::debug_span!("type_propagation", function = graph.name()).entered();

    let definitions = graph.definitions();
    for &def in &definitions {
        graph.instrs[def].compile_type = None;
    }
    let use_ids: Vec<UseId> = graph.uses.keys().collect();
    for u in use_ids {
        graph.uses[u].reaching_type = None;
    }

    let mut collector = CheckCollector {
        graph: &*graph,
        checks: Vec::new(),
    };
    for &block in graph.reverse_postorder() {
        collector.visit_block(graph, block);
    }
    let checks = collector.checks;
    for check in checks {
        refine_dominated_uses(graph, check);
    }

    let mut queued = SecondaryMap::<InstrId, bool>::new();
    let mut worklist: VecDeque<InstrId> = VecDeque::with_capacity(definitions.len());
    for def in definitions {
        queued[def] = true;
        worklist.push_back(def);
    }
    while let Some(def) = worklist.pop_front() {
        queued[def] = false;
        let mut ty = graph.compute_type(def);
        if graph.instrs[def].is_phi() {
            if let Some(old) = &graph.instrs[def].compile_type {
                ty = old.union(&ty, &graph.classes);
            }
        }
        if graph.instrs[def].compile_type.as_ref() == Some(&ty) {
            continue;
        }
        tracing::trace!("type of {} is {ty}", graph.display_instr(def));
        graph.instrs[def].compile_type = Some(ty);

        let users: SmallVec<[InstrId; 8]> = graph
            .input_uses(def)
            .map(|u| graph.uses[u].instruction)
            .collect();
        for user in users {
            if graph.instrs[user].is_definition() && graph.is_attached(user) && !queued[user] {
                queued[user] = true;
                worklist.push_back(user);
            }
        }
    }
}

/// A check that guarantees `ty` for `value` after `check` executes.
struct Refinement {
    check: InstrId,
    value: InstrId,
    ty: CompileType,
}

struct CheckCollector<'g> {
    graph: &'g FlowGraph,
    checks: Vec<Refinement>,
}

impl CheckCollector<'_> {
    fn refine(&mut self, check: InstrId, ty: CompileType) {
        let value = self.graph.input_at(check, 0);
        self.checks.push(Refinement { check, value, ty });
    }
}

impl FlowGraphVisitor for CheckCollector<'_> {
    fn visit_check_smi(&mut self, instr: InstrId, _data: &ir::CheckSmi) {
        self.refine(instr, CompileType::smi());
    }

    fn visit_check_class(&mut self, instr: InstrId, data: &ir::CheckClass) {
        if let Some(cid) = data.cids.monomorphic_receiver_cid() {
            self.refine(instr, CompileType::from_cid(cid));
        }
    }

    fn visit_check_null(&mut self, instr: InstrId) {
        // Uses that still read the unchecked value are not nullable
        // either once the check passed.
        let value = self.graph.input_at(instr, 0);
        let ty = self.graph.type_of(value).copy_non_nullable();
        self.refine(instr, ty);
    }
}

fn refine_dominated_uses(graph: &mut FlowGraph, refinement: Refinement) {
    let Refinement { check, value, ty } = refinement;
    let uses: SmallVec<[UseId; 8]> = graph.input_uses(value).collect();
    for u in uses {
        let user = graph.uses[u].instruction;
        if user == check || !graph.is_attached(user) {
            continue;
        }
        let dominated = if graph.instrs[user].is_phi() {
            let Some(block) = graph.block_of(user) else {
                continue;
            };
            let pred = graph.blocks[block].predecessors[graph.uses[u].use_index as usize];
            graph
                .last_instruction(pred)
                .is_some_and(|last| graph.instr_dominates(check, last))
        } else {
            graph.instr_dominates(check, user)
        };
        if !dominated {
            continue;
        }
        let current = graph.reaching_type(u);
        let refined = CompileType::compute_refined_type(&current, &ty, &graph.classes);
        graph.uses[u].reaching_type = Some(refined);
    }
}

/// Whether `def` is known to produce a boolean.
pub fn is_boolean_value(graph: &FlowGraph, def: InstrId) -> bool {
    matches!(
        graph.instrs[def].kind,
        InstrKind::StrictCompare(_)
            | InstrKind::RelationalOp(_)
            | InstrKind::EqualityCompare(_)
            | InstrKind::TestCids(_)
            | InstrKind::BooleanNegate
            | InstrKind::InstanceOf(_)
    ) || graph.type_of(def).is_bool(&graph.classes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{object_model::cid, parser::parse_program};
    use indoc::indoc;

    fn find(graph: &FlowGraph, name: &str) -> InstrId {
        graph
            .definitions()
            .into_iter()
            .find(|&d| graph.instrs[d].kind.name() == name)
            .unwrap()
    }

    #[test]
    fn loop_phi_reaches_a_fixpoint() {
        let mut graph = parse_program(indoc! {"
            (graph count
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (goto B2))
                (block B2 join (preds B1 B3)
                    (v1 phi 0 v2)
                    (v3 relational_op < _Smi v1 10)
                    (branch B3 B4 v3))
                (block B3 target
                    (v2 binary_smi_op + v1 1)
                    (goto B2))
                (block B4 target
                    (return v1)))
        "})
        .unwrap()
        .into_first()
        .unwrap()
        .graph;

        propagate_types(&mut graph);
        let phi = find(&graph, "phi");
        assert_eq!(graph.type_of(phi).to_cid(&graph.classes), cid::SMI);
        assert!(!graph.type_of(phi).can_be_null());
    }

    #[test]
    fn uses_after_a_check_see_the_checked_class() {
        let mut graph = parse_program(indoc! {"
            (graph f
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 load_class_id v0)
                    (check_smi v0)
                    (v2 binary_smi_op + v0 1)
                    (return v2)))
        "})
        .unwrap()
        .into_first()
        .unwrap()
        .graph;

        propagate_types(&mut graph);
        let before = find(&graph, "load_class_id");
        let after = find(&graph, "binary_smi_op");
        assert!(!graph.is_smi_value(graph.input_use(before, 0)));
        assert!(graph.is_smi_value(graph.input_use(after, 0)));
        // The parameter itself stays dynamic.
        let param = graph.input_at(before, 0);
        assert_eq!(graph.type_of(param).to_cid(&graph.classes), cid::DYNAMIC);
    }
}

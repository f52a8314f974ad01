//! Sparse conditional constant propagation.
//!
//! Every definition starts `Unknown` and only moves down the lattice
//! `Unknown -> Constant -> NonConstant`, so the analysis terminates. A
//! block is analyzed once it becomes reachable; a phi only joins the
//! values flowing in from reachable predecessors and is revisited when
//! another predecessor becomes reachable.

use crate::{
    BlockId, FlowGraph, InstrId, InstrKind,
    ir::{self, ConstValue, Token, is_smi},
    object_model::cid,
    visitor::{FlowGraphVisitor, dispatch},
};
use cranelift_entity::{EntitySet, SecondaryMap};
use smallvec::SmallVec;
use std::cmp::Ordering;

#[derive(Clone, Debug, Default, PartialEq)]
enum Lattice {
    #[default]
    Unknown,
    Constant(ConstValue),
    NonConstant,
}

impl Lattice {
    fn join(&self, other: &Lattice) -> Lattice {
        match (self, other) {
            (Lattice::Unknown, x) | (x, Lattice::Unknown) => x.clone(),
            (Lattice::Constant(a), Lattice::Constant(b)) if a == b => self.clone(),
            _ => Lattice::NonConstant,
        }
    }
}

pub struct ConstantPropagator<'g> {
    graph: &'g FlowGraph,
    values: SecondaryMap<InstrId, Lattice>,
    reachable: EntitySet<BlockId>,
    block_worklist: Vec<BlockId>,
    definition_worklist: Vec<InstrId>,
}

/// What the analysis proved, detached from the graph borrow so the
/// transformation can mutate it.
struct Facts {
    constants: Vec<(InstrId, ConstValue)>,
    taken_edges: Vec<(BlockId, BlockId)>,
}

impl ConstantPropagator<'_> {
    /// Folds constant definitions and removes code that cannot execute.
    pub fn optimize(graph: &mut FlowGraph) {
        let _span = tracing::debug_span!("constant_propagation", function = graph.name()).entered();
        let facts = ConstantPropagator::analyze(graph);
        transform(graph, facts);
    }

    /// Like [`ConstantPropagator::optimize`], then collapses branches
    /// whose successors are equivalent.
    pub fn optimize_branches(graph: &mut FlowGraph) {
        Self::optimize(graph);
        eliminate_redundant_branches(graph);
    }

    fn analyze(graph: &FlowGraph) -> Facts {
        let mut this = ConstantPropagator {
            graph,
            values: SecondaryMap::new(),
            reachable: EntitySet::new(),
            block_worklist: Vec::new(),
            definition_worklist: Vec::new(),
        };
        this.mark_reachable(graph.graph_entry());

        loop {
            if let Some(block) = this.block_worklist.pop() {
                this.visit_reachable_block(block);
            } else if let Some(def) = this.definition_worklist.pop() {
                let users: SmallVec<[InstrId; 8]> = graph
                    .input_uses(def)
                    .map(|u| graph.uses[u].instruction)
                    .collect();
                for user in users {
                    let reachable = graph
                        .block_of(user)
                        .is_some_and(|b| this.reachable.contains(b));
                    if reachable {
                        this.visit(user);
                    }
                }
            } else {
                break;
            }
        }

        this.into_facts()
    }

    fn into_facts(self) -> Facts {
        let graph = self.graph;
        let mut constants = Vec::new();
        let mut taken_edges = Vec::new();
        for &block in graph.reverse_postorder() {
            if !self.reachable.contains(block) {
                continue;
            }
            let data = &graph.blocks[block];
            let defs = data
                .phis
                .iter()
                .copied()
                .chain(graph.block_instrs(block).filter(|&i| graph.instrs[i].is_definition()));
            for def in defs {
                let instr = &graph.instrs[def];
                if matches!(instr.kind, InstrKind::Constant(_)) || instr.representation.is_unboxed() {
                    continue;
                }
                if let Lattice::Constant(value) = &self.values[def] {
                    constants.push((def, value.clone()));
                }
            }

            if let Some(last) = graph.last_instruction(block) {
                if let InstrKind::Branch(branch) = &graph.instrs[last].kind {
                    let t = self.reachable.contains(branch.true_target);
                    let f = self.reachable.contains(branch.false_target);
                    match (t, f) {
                        (true, false) => taken_edges.push((block, branch.true_target)),
                        (false, true) => taken_edges.push((block, branch.false_target)),
                        _ => {}
                    }
                }
            }
        }
        Facts {
            constants,
            taken_edges,
        }
    }

    fn mark_reachable(&mut self, block: BlockId) {
        if self.reachable.insert(block) {
            self.block_worklist.push(block);
        } else {
            // A new predecessor edge became executable.
            let graph = self.graph;
            for &phi in &graph.blocks[block].phis {
                self.visit_phi(phi);
            }
        }
    }

    fn visit_reachable_block(&mut self, block: BlockId) {
        let graph = self.graph;
        let data = &graph.blocks[block];
        for &def in &data.initial_definitions {
            self.visit(def);
        }
        if data.is_graph_entry() {
            for succ in graph.successors(block) {
                self.mark_reachable(succ);
            }
        }
        self.visit_block(graph, block);
    }

    fn visit(&mut self, instr: InstrId) {
        let graph = self.graph;
        dispatch(self, instr, &graph.instrs[instr].kind);
    }

    fn value(&self, def: InstrId) -> Lattice {
        match &self.graph.instrs[def].kind {
            InstrKind::Constant(value) => Lattice::Constant(value.clone()),
            _ => self.values[def].clone(),
        }
    }

    fn input_value(&self, instr: InstrId, index: usize) -> Lattice {
        self.value(self.graph.input_at(instr, index))
    }

    fn set_value(&mut self, def: InstrId, value: Lattice) {
        let joined = self.values[def].join(&value);
        if joined != self.values[def] {
            self.values[def] = joined;
            self.definition_worklist.push(def);
        }
    }

    fn set_constant(&mut self, def: InstrId, value: ConstValue) {
        self.set_value(def, Lattice::Constant(value));
    }

    fn set_non_constant(&mut self, def: InstrId) {
        self.set_value(def, Lattice::NonConstant);
    }

    /// Applies `fold` to the two inputs once both are known. `None` from
    /// `fold` means the operation does not produce a constant (it would
    /// overflow, throw or deoptimize).
    fn visit_binary(
        &mut self,
        instr: InstrId,
        fold: impl FnOnce(&ConstValue, &ConstValue) -> Option<ConstValue>,
    ) {
        let left = self.input_value(instr, 0);
        let right = self.input_value(instr, 1);
        match (&left, &right) {
            (Lattice::NonConstant, _) | (_, Lattice::NonConstant) => self.set_non_constant(instr),
            (Lattice::Constant(a), Lattice::Constant(b)) => match fold(a, b) {
                Some(value) => self.set_constant(instr, value),
                None => self.set_non_constant(instr),
            },
            _ => {}
        }
    }

    fn visit_unary(&mut self, instr: InstrId, fold: impl FnOnce(&ConstValue) -> Option<ConstValue>) {
        match self.input_value(instr, 0) {
            Lattice::Unknown => {}
            Lattice::NonConstant => self.set_non_constant(instr),
            Lattice::Constant(value) => match fold(&value) {
                Some(value) => self.set_constant(instr, value),
                None => self.set_non_constant(instr),
            },
        }
    }

    /// The class id every value of input `index` has, from its type.
    fn input_cid(&self, instr: InstrId, index: usize) -> Option<u32> {
        let graph = self.graph;
        let cid = graph.value_cid(graph.input_use(instr, index));
        (cid != cid::DYNAMIC && cid != cid::ILLEGAL).then_some(cid)
    }
}

impl FlowGraphVisitor for ConstantPropagator<'_> {
    fn visit_default(&mut self, instr: InstrId) {
        if self.graph.instrs[instr].is_definition() {
            self.set_non_constant(instr);
        }
    }

    fn visit_goto(&mut self, _instr: InstrId, data: &ir::Goto) {
        self.mark_reachable(data.target);
    }

    fn visit_branch(&mut self, instr: InstrId, data: &ir::Branch) {
        match self.input_value(instr, 0) {
            Lattice::Unknown => {}
            Lattice::Constant(ConstValue::Bool(true)) => self.mark_reachable(data.true_target),
            Lattice::Constant(ConstValue::Bool(false)) => self.mark_reachable(data.false_target),
            _ => {
                self.mark_reachable(data.true_target);
                self.mark_reachable(data.false_target);
            }
        }
    }

    fn visit_constant(&mut self, instr: InstrId, data: &ConstValue) {
        self.set_constant(instr, data.clone());
    }

    fn visit_phi(&mut self, instr: InstrId) {
        let graph = self.graph;
        let Some(block) = graph.block_of(instr) else {
            return;
        };
        let mut value = Lattice::Unknown;
        for (i, &pred) in graph.blocks[block].predecessors.iter().enumerate() {
            if self.reachable.contains(pred) {
                value = value.join(&self.input_value(instr, i));
            }
        }
        self.set_value(instr, value);
    }

    fn visit_redefinition(&mut self, instr: InstrId, _data: &ir::Redefinition) {
        self.visit_unary(instr, |v| Some(v.clone()));
    }

    fn visit_check_null(&mut self, instr: InstrId) {
        self.visit_unary(instr, |v| (!v.is_null()).then(|| v.clone()));
    }

    fn visit_assert_assignable(&mut self, instr: InstrId, data: &ir::AssertAssignable) {
        let graph = self.graph;
        let classes = &graph.classes;
        let ty = &data.ty;
        self.visit_unary(instr, |v| {
            (ty.is_instantiated() && classes.is_subtype_of(v.cid(), ty)).then(|| v.clone())
        });
    }

    fn visit_assert_boolean(&mut self, instr: InstrId) {
        self.visit_unary(instr, |v| v.as_bool().map(ConstValue::Bool));
    }

    fn visit_check_array_bound(&mut self, instr: InstrId) {
        self.visit_binary(instr, |length, index| {
            let (length, index) = (length.as_int()?, index.as_int()?);
            (0 <= index && index < length).then_some(ConstValue::Int(index))
        });
    }

    fn visit_binary_smi_op(&mut self, instr: InstrId, data: &ir::BinaryOp) {
        let op = data.op;
        self.visit_binary(instr, |a, b| {
            fold_smi_op(op, a.as_smi()?, b.as_smi()?).map(ConstValue::Int)
        });
    }

    fn visit_checked_smi_op(&mut self, instr: InstrId, data: &ir::BinaryOp) {
        self.visit_binary_smi_op(instr, data);
    }

    fn visit_binary_int64_op(&mut self, instr: InstrId, data: &ir::BinaryOp) {
        let op = data.op;
        self.visit_binary(instr, |a, b| {
            fold_int64_op(op, a.as_int()?, b.as_int()?).map(ConstValue::Int)
        });
    }

    fn visit_unary_smi_op(&mut self, instr: InstrId, data: &ir::UnaryOp) {
        let op = data.op;
        self.visit_unary(instr, |v| {
            let v = v.as_smi()?;
            let result = match op {
                Token::Negate => v.checked_neg()?,
                Token::BitNot => !v,
                _ => return None,
            };
            is_smi(result).then_some(ConstValue::Int(result))
        });
    }

    fn visit_binary_double_op(&mut self, instr: InstrId, data: &ir::BinaryOp) {
        let op = data.op;
        self.visit_binary(instr, |a, b| {
            let (a, b) = (a.as_double()?, b.as_double()?);
            Some(ConstValue::Double(match op {
                Token::Add => a + b,
                Token::Sub => a - b,
                Token::Mul => a * b,
                Token::Div => a / b,
                _ => return None,
            }))
        });
    }

    fn visit_relational_op(&mut self, instr: InstrId, data: &ir::Comparison) {
        let op = data.op;
        self.visit_binary(instr, |a, b| {
            compare_numbers(a, b).map(|ord| ConstValue::Bool(comparison_holds(op, ord)))
        });
    }

    fn visit_equality_compare(&mut self, instr: InstrId, data: &ir::Comparison) {
        self.visit_relational_op(instr, data);
    }

    fn visit_checked_smi_comparison(&mut self, instr: InstrId, data: &ir::BinaryOp) {
        let op = data.op;
        self.visit_binary(instr, |a, b| {
            let ord = a.as_smi()?.cmp(&b.as_smi()?);
            Some(ConstValue::Bool(comparison_holds(op, ord)))
        });
    }

    fn visit_strict_compare(&mut self, instr: InstrId, data: &ir::StrictCompare) {
        let graph = self.graph;
        let negated = data.op == Token::StrictNe;
        let left = graph.input_at(instr, 0);
        let right = graph.input_at(instr, 1);

        let same = graph.original_definition(left) == graph.original_definition(right);
        if same {
            self.set_constant(instr, ConstValue::Bool(!negated));
            return;
        }
        // Comparing with null a value whose type excludes null.
        for (value, other) in [(0, 1), (1, 0)] {
            let is_null_constant = graph
                .constant_value(graph.input_at(instr, other))
                .is_some_and(ConstValue::is_null);
            if is_null_constant && !graph.input_type(instr, value).can_be_null() {
                self.set_constant(instr, ConstValue::Bool(negated));
                return;
            }
        }
        self.visit_binary(instr, |a, b| Some(ConstValue::Bool((a == b) != negated)));
    }

    fn visit_test_cids(&mut self, instr: InstrId, data: &ir::TestCids) {
        if let Some(cid) = self.input_cid(instr, 0) {
            self.set_constant(instr, ConstValue::Bool(data.cids.contains(cid)));
            return;
        }
        self.visit_unary(instr, |v| Some(ConstValue::Bool(data.cids.contains(v.cid()))));
    }

    fn visit_boolean_negate(&mut self, instr: InstrId) {
        self.visit_unary(instr, |v| v.as_bool().map(|b| ConstValue::Bool(!b)));
    }

    fn visit_box(&mut self, instr: InstrId, _data: &ir::BoxValue) {
        self.visit_unary(instr, |v| Some(v.clone()));
    }

    fn visit_unbox(&mut self, instr: InstrId, _data: &ir::Unbox) {
        self.visit_unary(instr, |v| Some(v.clone()));
    }

    fn visit_load_class_id(&mut self, instr: InstrId) {
        if let Some(cid) = self.input_cid(instr, 0) {
            self.set_constant(instr, ConstValue::Int(cid.into()));
            return;
        }
        self.visit_unary(instr, |v| Some(ConstValue::Int(v.cid().into())));
    }

    fn visit_instance_of(&mut self, instr: InstrId, data: &ir::TypeTest) {
        let graph = self.graph;
        let classes = &graph.classes;
        if let Some(result) = graph.input_type(instr, 0).is_instance_of(&data.ty, classes) {
            self.set_constant(instr, ConstValue::Bool(result));
            return;
        }
        let ty = &data.ty;
        self.visit_unary(instr, |v| {
            ty.is_instantiated()
                .then(|| ConstValue::Bool(classes.is_subtype_of(v.cid(), ty)))
        });
    }
}

fn fold_smi_op(op: Token, a: i64, b: i64) -> Option<i64> {
    let result = match op {
        Token::Add => a.checked_add(b)?,
        Token::Sub => a.checked_sub(b)?,
        Token::Mul => a.checked_mul(b)?,
        Token::TruncDiv => a.checked_div(b)?,
        Token::Mod => a.checked_rem_euclid(b)?,
        Token::BitAnd => a & b,
        Token::BitOr => a | b,
        Token::BitXor => a ^ b,
        Token::Shl => {
            if !(0..63).contains(&b) {
                return (a == 0 && b >= 0).then_some(0);
            }
            let shifted = a << b;
            if shifted >> b != a {
                return None;
            }
            shifted
        }
        Token::Shr => {
            if b < 0 {
                return None;
            }
            a >> b.min(63)
        }
        _ => return None,
    };
    is_smi(result).then_some(result)
}

fn fold_int64_op(op: Token, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        Token::Add => a.wrapping_add(b),
        Token::Sub => a.wrapping_sub(b),
        Token::Mul => a.wrapping_mul(b),
        Token::TruncDiv if b != 0 => a.wrapping_div(b),
        Token::Mod if b != 0 => a.wrapping_rem_euclid(b),
        Token::BitAnd => a & b,
        Token::BitOr => a | b,
        Token::BitXor => a ^ b,
        Token::Shl if b >= 0 => {
            if b >= 64 {
                0
            } else {
                a.wrapping_shl(b as u32)
            }
        }
        Token::Shr if b >= 0 => a >> b.min(63),
        _ => return None,
    })
}

fn compare_numbers(a: &ConstValue, b: &ConstValue) -> Option<Ordering> {
    match (a, b) {
        (ConstValue::Int(a), ConstValue::Int(b)) => Some(a.cmp(b)),
        (ConstValue::Double(a), ConstValue::Double(b)) => a.partial_cmp(b),
        (ConstValue::Int(a), ConstValue::Double(b)) => (*a as f64).partial_cmp(b),
        (ConstValue::Double(a), ConstValue::Int(b)) => a.partial_cmp(&(*b as f64)),
        _ => None,
    }
}

fn comparison_holds(op: Token, ord: Ordering) -> bool {
    match op {
        Token::Lt => ord.is_lt(),
        Token::Gt => ord.is_gt(),
        Token::Lte => ord.is_le(),
        Token::Gte => ord.is_ge(),
        Token::Eq | Token::StrictEq => ord.is_eq(),
        Token::Ne | Token::StrictNe => ord.is_ne(),
        other => panic!("{other:?} is not a comparison"),
    }
}

fn transform(graph: &mut FlowGraph, facts: Facts) {
    for (def, value) in facts.constants {
        let constant = graph.constant(value);
        tracing::debug!("{} is constant", graph.display_instr(def));
        graph.replace_all_uses_with(def, constant);
        if graph.instrs[def].is_phi() {
            graph.remove_phi(def);
        } else {
            // A folded instruction provably neither deoptimizes nor
            // calls out: its inputs are constants that pass its checks.
            graph.remove_from_graph(def);
        }
    }

    for (block, target) in facts.taken_edges {
        let Some(branch) = graph.last_instruction(block) else {
            continue;
        };
        let condition = graph.input_at(branch, 0);
        tracing::debug!("branch in {block:?} always goes to {target:?}");
        let goto = graph.new_instr(InstrKind::Goto(ir::Goto { target }), &[]);
        graph.replace_terminator(block, goto);
        remove_if_unused(graph, condition);
    }

    // Blocks the analysis never reached have lost their last incoming
    // edge and are pruned here.
    graph.compute_block_info();
    remove_redundant_phis(graph);
}

/// Removes a side-effect-free definition nobody uses.
fn remove_if_unused(graph: &mut FlowGraph, def: InstrId) {
    let data = &graph.instrs[def];
    if graph.has_uses(def) || !graph.is_attached(def) || data.is_phi() {
        return;
    }
    if matches!(data.kind, InstrKind::Constant(_) | InstrKind::Parameter(_)) {
        return;
    }
    if data.kind.can_deoptimize() || data.kind.has_unknown_side_effects() || data.kind.may_throw() {
        return;
    }
    graph.remove_from_graph(def);
}

/// Replaces phis whose inputs are all the same definition (or the phi
/// itself) by that definition.
pub fn remove_redundant_phis(graph: &mut FlowGraph) {
    let mut changed = true;
    while changed {
        changed = false;
        for block in graph.reverse_postorder().to_vec() {
            for phi in graph.blocks[block].phis.clone() {
                let mut unique = None;
                let mut redundant = true;
                for input in graph.inputs(phi) {
                    if input == phi || Some(input) == unique {
                        continue;
                    }
                    if unique.is_some() {
                        redundant = false;
                        break;
                    }
                    unique = Some(input);
                }
                if let (true, Some(replacement)) = (redundant, unique) {
                    graph.replace_all_uses_with(phi, replacement);
                    graph.remove_phi(phi);
                    changed = true;
                }
            }
        }
    }
}

/// Turns a branch into a goto when both successors are empty blocks
/// jumping to the same join with identical phi inputs.
pub fn eliminate_redundant_branches(graph: &mut FlowGraph) {
    let _span = tracing::debug_span!("eliminate_redundant_branches").entered();
    let mut changed = true;
    while changed {
        changed = false;
        for block in graph.reverse_postorder().to_vec() {
            let Some(last) = graph.last_instruction(block) else {
                continue;
            };
            let InstrKind::Branch(branch) = &graph.instrs[last].kind else {
                continue;
            };
            let (t, f) = (branch.true_target, branch.false_target);
            let (Some(join_t), Some(join_f)) = (empty_jump(graph, t), empty_jump(graph, f)) else {
                continue;
            };
            if join_t != join_f {
                continue;
            }
            let preds = &graph.blocks[join_t].predecessors;
            let (Some(it), Some(if_)) = (
                preds.iter().position(|&p| p == t),
                preds.iter().position(|&p| p == f),
            ) else {
                continue;
            };
            let same_inputs = graph.blocks[join_t]
                .phis
                .iter()
                .all(|&phi| graph.input_at(phi, it) == graph.input_at(phi, if_));
            if !same_inputs {
                continue;
            }

            tracing::debug!("branch in {block:?} has equivalent successors");
            let condition = graph.input_at(last, 0);
            let goto = graph.new_instr(InstrKind::Goto(ir::Goto { target: t }), &[]);
            graph.replace_terminator(block, goto);
            remove_if_unused(graph, condition);
            graph.compute_block_info();
            changed = true;
            break;
        }
    }
    remove_redundant_phis(graph);
}

/// If `block` holds nothing but a goto to a join, returns the join.
fn empty_jump(graph: &FlowGraph, block: BlockId) -> Option<BlockId> {
    let data = &graph.blocks[block];
    let first = data.first.expand()?;
    if data.last.expand() != Some(first) {
        return None;
    }
    match &graph.instrs[first].kind {
        InstrKind::Goto(goto) if graph.blocks[goto.target].is_join() => Some(goto.target),
        _ => None,
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

    fn returned(graph: &FlowGraph) -> InstrId {
        let ret = graph
            .instrs
            .keys()
            .find(|&i| graph.is_attached(i) && matches!(graph.instrs[i].kind, InstrKind::Return))
            .unwrap();
        graph.input_at(ret, 0)
    }

    const PHI_OF_FIVE: &str = indoc! {"
        (graph phi_of_five
            (block B0 graph_entry)
            (block B1 function_entry
                (v0 parameter 0)
                (branch B2 B3 v0))
            (block B2 target (goto B4))
            (block B3 target (goto B4))
            (block B4 join
                (v1 phi 5 5)
                (v2 binary_smi_op + v1 1)
                (return v2)))
    "};

    #[test]
    fn phi_of_equal_constants_folds() {
        let mut graph = parse(PHI_OF_FIVE);
        ConstantPropagator::optimize(&mut graph);

        assert_eq!(graph.constant_value(returned(&graph)), Some(&ConstValue::Int(6)));
        assert!(graph.blocks.values().all(|b| b.phis.is_empty()));
        check_flow_graph(&graph, &CompilerConfig::default()).unwrap();
    }

    #[test]
    fn optimization_is_idempotent() {
        let mut graph = parse(PHI_OF_FIVE);
        ConstantPropagator::optimize_branches(&mut graph);
        let once = format_graph(&graph);
        ConstantPropagator::optimize_branches(&mut graph);
        assert_eq!(format_graph(&graph), once);
    }

    #[test]
    fn constant_branch_prunes_the_dead_successor() {
        let mut graph = parse(indoc! {"
            (graph prune
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 strict_compare === 1 1)
                    (branch B2 B3 v1))
                (block B2 target (goto B4))
                (block B3 target
                    (v2 instance_call foo 1 (args 1) v0)
                    (goto B4))
                (block B4 join
                    (v3 phi 10 v2)
                    (return v3)))
        "});
        ConstantPropagator::optimize(&mut graph);

        assert_eq!(graph.constant_value(returned(&graph)), Some(&ConstValue::Int(10)));
        assert!(
            graph
                .instrs
                .values()
                .filter(|i| i.block.is_some())
                .all(|i| !matches!(i.kind, InstrKind::InstanceCall(_) | InstrKind::Branch(_)))
        );
        check_flow_graph(&graph, &CompilerConfig::default()).unwrap();
    }

    #[test]
    fn loop_carried_values_are_not_constant() {
        let mut graph = parse(indoc! {"
            (graph count
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (goto B2))
                (block B2 join (preds B1 B3)
                    (v1 phi 0 v2)
                    (v3 relational_op < _Smi v1 v0)
                    (branch B3 B4 v3))
                (block B3 target
                    (v2 binary_smi_op + v1 1)
                    (goto B2))
                (block B4 target
                    (return v1)))
        "});
        ConstantPropagator::optimize(&mut graph);
        let result = returned(&graph);
        assert!(graph.instrs[result].is_phi());
        assert_eq!(graph.instrs[result].inputs.len(), 2);
    }

    #[test]
    fn overflowing_smi_arithmetic_is_left_alone() {
        let max = ir::SMI_MAX;
        let mut graph = parse(&format!(
            "(graph f (block B1 function_entry (v0 binary_smi_op + {max} 1) (return v0)))"
        ));
        ConstantPropagator::optimize(&mut graph);
        let result = returned(&graph);
        assert!(matches!(graph.instrs[result].kind, InstrKind::BinarySmiOp(_)));
    }

    #[test]
    fn equivalent_successors_collapse_to_a_goto() {
        let mut graph = parse(indoc! {"
            (graph same
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 parameter 1)
                    (v2 strict_compare === v0 null)
                    (branch B2 B3 v2))
                (block B2 target (goto B4))
                (block B3 target (goto B4))
                (block B4 join
                    (v3 phi v1 v1)
                    (return v3)))
        "});
        eliminate_redundant_branches(&mut graph);

        let branches = graph
            .instrs
            .values()
            .filter(|i| i.block.is_some() && matches!(i.kind, InstrKind::Branch(_)))
            .count();
        assert_eq!(branches, 0);
        assert!(matches!(graph.instrs[returned(&graph)].kind, InstrKind::Parameter(_)));
        check_flow_graph(&graph, &CompilerConfig::default()).unwrap();
    }
}

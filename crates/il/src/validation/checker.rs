use crate::{
    flow_graph::FlowGraph,
    ir::{BlockId, BlockKind, InstrId, InstrKind, UseId, UseSite},
    validation::ValidationError,
};
use ember_core::CompilerConfig;

macro_rules! ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(ValidationError::new(format!($($arg)*)));
        }
    };
}

/// Verifies block bookkeeping, instruction placement, dominance of every
/// input and environment value, use-list consistency, and the alignment
/// of call arguments with the call's environment.
///
/// Dominance checks are skipped on graphs with more definitions than
/// `config.verify_definitions_threshold`.
pub fn check_flow_graph(graph: &FlowGraph, config: &CompilerConfig) -> Result<(), ValidationError> {
    let check_dominance = graph.definitions().len() <= config.verify_definitions_threshold;
    let checker = FlowGraphChecker {
        graph,
        check_dominance,
    };
    checker.check_orders()?;
    for &block in graph.reverse_postorder() {
        checker.check_block(block)?;
    }
    for def in graph.definitions() {
        checker.check_use_lists(def)?;
    }
    Ok(())
}

struct FlowGraphChecker<'a> {
    graph: &'a FlowGraph,
    check_dominance: bool,
}

impl FlowGraphChecker<'_> {
    fn check_orders(&self) -> Result<(), ValidationError> {
        let graph = self.graph;
        let rpo = graph.reverse_postorder();
        let postorder = graph.postorder();
        ensure!(
            rpo.len() == postorder.len() && rpo.iter().rev().eq(postorder.iter()),
            "postorder is not the reverse of reverse postorder"
        );
        ensure!(
            rpo.first() == Some(&graph.graph_entry()),
            "reverse postorder must start at the graph entry"
        );
        for (i, &block) in postorder.iter().enumerate() {
            ensure!(
                graph.blocks[block].postorder_number == Some(i as u32),
                "block {block:?} has a stale postorder number"
            );
        }
        for (i, &block) in graph.preorder().iter().enumerate() {
            ensure!(
                graph.blocks[block].preorder_number == Some(i as u32),
                "block {block:?} has a stale preorder number"
            );
        }
        Ok(())
    }

    fn check_block(&self, block: BlockId) -> Result<(), ValidationError> {
        let graph = self.graph;
        let data = &graph.blocks[block];
        ensure!(!data.removed, "removed block {block:?} is still reachable");

        if let Some(dom) = data.dominator.expand() {
            ensure!(
                graph.blocks[dom].dominated.contains(&block),
                "block {block:?} is missing from its dominator's dominated list"
            );
        } else {
            ensure!(
                data.is_graph_entry(),
                "block {block:?} has no dominator"
            );
        }

        // Edges are symmetric.
        for succ in graph.successors(block) {
            let forward = graph.successors(block).iter().filter(|&&s| s == succ).count();
            let backward = graph.predecessors(succ).iter().filter(|&&p| p == block).count();
            ensure!(
                forward == backward,
                "edge {block:?} -> {succ:?} is not mirrored in the predecessor list"
            );
        }
        for &pred in graph.predecessors(block) {
            ensure!(
                graph.successors(pred).contains(&block),
                "predecessor {pred:?} of {block:?} does not branch to it"
            );
        }

        match &data.kind {
            BlockKind::Graph(_) => {
                ensure!(data.first.is_none(), "the graph entry holds no instructions");
                for &def in &data.initial_definitions {
                    ensure!(
                        graph.instrs[def].as_constant().is_some(),
                        "graph entry initial definitions must be constants"
                    );
                }
                return Ok(());
            }
            BlockKind::Target => ensure!(
                data.predecessors.len() == 1,
                "target block {block:?} has {} predecessors",
                data.predecessors.len()
            ),
            BlockKind::Join => {
                for &pred in &data.predecessors {
                    let ends_in_goto = graph
                        .last_instruction(pred)
                        .is_some_and(|last| matches!(graph.instrs[last].kind, InstrKind::Goto(_)));
                    ensure!(ends_in_goto, "join {block:?} is entered by a branch from {pred:?}");
                }
            }
            _ => ensure!(
                data.predecessors.as_slice() == [graph.graph_entry()],
                "entry block {block:?} must have the graph entry as sole predecessor"
            ),
        }

        for &def in &data.initial_definitions {
            ensure!(
                graph.block_of(def) == Some(block),
                "initial definition {def:?} does not belong to {block:?}"
            );
        }
        ensure!(
            data.phis.is_empty() || data.is_join(),
            "phis in non-join block {block:?}"
        );
        for &phi in &data.phis {
            self.check_phi(block, phi)?;
        }

        self.check_instruction_list(block)
    }

    fn check_phi(&self, block: BlockId, phi: InstrId) -> Result<(), ValidationError> {
        let graph = self.graph;
        let preds = graph.predecessors(block);
        ensure!(
            graph.instrs[phi].inputs.len() == preds.len(),
            "phi {} has {} inputs but its block has {} predecessors",
            graph.display_instr(phi),
            graph.instrs[phi].inputs.len(),
            preds.len()
        );
        ensure!(graph.block_of(phi) == Some(block), "phi {phi:?} in the wrong block");
        for (i, &u) in graph.instrs[phi].inputs.iter().enumerate() {
            self.check_use(phi, u, i, UseSite::Input)?;
            if self.check_dominance {
                let def = graph.uses[u].definition;
                let pred = preds[i];
                let available = match graph.block_of(def) {
                    Some(def_block) => graph.dominates(def_block, pred),
                    None => false,
                };
                ensure!(
                    available,
                    "phi input {i} of {} is not available at the end of {pred:?}",
                    graph.display_instr(phi)
                );
            }
        }
        Ok(())
    }

    fn check_instruction_list(&self, block: BlockId) -> Result<(), ValidationError> {
        let graph = self.graph;
        let data = &graph.blocks[block];
        let Some(last) = data.last.expand() else {
            return Err(ValidationError::new(format!("block {block:?} is not terminated")));
        };
        ensure!(
            graph.instrs[last].kind.is_control_flow(),
            "block {block:?} ends in non-control-flow {}",
            graph.display_instr(last)
        );

        let mut prev = None;
        for instr in graph.block_instrs(block) {
            let instr_data = &graph.instrs[instr];
            ensure!(
                instr_data.prev.expand() == prev,
                "broken instruction links at {}",
                graph.display_instr(instr)
            );
            ensure!(
                instr_data.block.expand() == Some(block),
                "{} claims to be in another block",
                graph.display_instr(instr)
            );
            ensure!(
                instr == last || !instr_data.kind.is_control_flow(),
                "control flow {} in the middle of {block:?}",
                graph.display_instr(instr)
            );
            ensure!(
                !instr_data.is_phi() && !matches!(instr_data.kind, InstrKind::Parameter(_)),
                "{} cannot appear in an instruction list",
                graph.display_instr(instr)
            );
            self.check_instruction(instr)?;
            prev = Some(instr);
        }
        ensure!(prev == Some(last), "last instruction of {block:?} is unlinked");
        Ok(())
    }

    fn check_instruction(&self, instr: InstrId) -> Result<(), ValidationError> {
        let graph = self.graph;
        let data = &graph.instrs[instr];

        if let Some(count) = data.kind.fixed_input_count() {
            ensure!(
                data.inputs.len() == count,
                "{} has {} inputs, expected {count}",
                graph.display_instr(instr),
                data.inputs.len()
            );
        }
        for (i, &u) in data.inputs.iter().enumerate() {
            self.check_use(instr, u, i, UseSite::Input)?;
            self.check_dominated_by_def(instr, u)?;
            self.check_representation(instr, i, u)?;
        }

        if data.kind.can_deoptimize() && !graph.function_info().is_force_optimized {
            ensure!(
                data.deopt_id.is_some(),
                "{} can deoptimize but has no deopt id",
                graph.display_instr(instr)
            );
            ensure!(
                data.env.is_some(),
                "{} can deoptimize but has no environment",
                graph.display_instr(instr)
            );
        }
        if let Some(env) = &data.env {
            ensure!(!env.frames.is_empty(), "empty environment on {instr:?}");
            for (frame_index, frame) in env.frames.iter().enumerate() {
                ensure!(
                    frame.values.len() >= frame.fixed_parameter_count as usize,
                    "environment frame shorter than its fixed parameters at {}",
                    graph.display_instr(instr)
                );
                for (i, &u) in frame.values.iter().enumerate() {
                    self.check_use(
                        instr,
                        u,
                        i,
                        UseSite::Env {
                            frame: frame_index as u16,
                        },
                    )?;
                    self.check_dominated_by_def(instr, u)?;
                }
            }
        }

        if data.kind.is_call() {
            self.check_call_arguments(instr)?;
        }
        if let Some(moves) = &data.move_arguments {
            for (i, &mv) in moves.iter().enumerate() {
                let expected = (moves.len() - 1 - i) as u32;
                ensure!(
                    matches!(&graph.instrs[mv].kind, InstrKind::MoveArgument(m) if m.sp_relative_index == expected),
                    "argument {i} of {} is not a move_argument at stack index {expected}",
                    graph.display_instr(instr)
                );
                ensure!(
                    graph.block_of(mv) == graph.block_of(instr),
                    "move_argument of {} is in another block",
                    graph.display_instr(instr)
                );
            }
        }
        Ok(())
    }

    fn check_use(
        &self,
        instr: InstrId,
        u: UseId,
        index: usize,
        site: UseSite,
    ) -> Result<(), ValidationError> {
        let graph = self.graph;
        let value = &graph.uses[u];
        ensure!(
            value.instruction == instr && value.use_index as usize == index && value.site == site,
            "use {index} of {} has inconsistent back links",
            graph.display_instr(instr)
        );
        let def = value.definition;
        ensure!(
            graph.instrs[def].is_definition(),
            "{} uses a non-definition",
            graph.display_instr(instr)
        );
        ensure!(
            graph.is_attached(def),
            "{} uses {def:?}, which is not in the graph",
            graph.display_instr(instr)
        );
        let linked = match site {
            UseSite::Input => graph.input_uses(def).any(|other| other == u),
            UseSite::Env { .. } => graph.env_uses(def).any(|other| other == u),
        };
        ensure!(
            linked,
            "use {index} of {} is not linked into its definition's use list",
            graph.display_instr(instr)
        );
        Ok(())
    }

    fn check_dominated_by_def(&self, instr: InstrId, u: UseId) -> Result<(), ValidationError> {
        if !self.check_dominance {
            return Ok(());
        }
        let graph = self.graph;
        let def = graph.uses[u].definition;
        ensure!(
            graph.instr_dominates(def, instr),
            "{} does not dominate its use in {}",
            graph.display_instr(def),
            graph.display_instr(instr)
        );
        Ok(())
    }

    fn check_representation(&self, instr: InstrId, index: usize, u: UseId) -> Result<(), ValidationError> {
        let graph = self.graph;
        let kind = &graph.instrs[instr].kind;
        if matches!(kind, InstrKind::MoveArgument(_) | InstrKind::Phi | InstrKind::Redefinition(_)) {
            return Ok(());
        }
        let required = kind.required_input_representation(index);
        let actual = graph.instrs[graph.uses[u].definition].representation;
        ensure!(
            required == actual,
            "input {index} of {} is {} but {} is required",
            graph.display_instr(instr),
            actual.name(),
            required.name()
        );
        Ok(())
    }

    /// The argument slots at the end of a call's innermost environment
    /// frame must hold the call's arguments, or the moves that push them.
    fn check_call_arguments(&self, call: InstrId) -> Result<(), ValidationError> {
        let graph = self.graph;
        let data = &graph.instrs[call];
        let Some(env) = &data.env else {
            return Ok(());
        };
        if env.lazy_deopt_to_before {
            return Ok(());
        }
        let count = data.argument_count();
        let frame = env.innermost();
        ensure!(
            frame.values.len() >= count,
            "environment of {} is too short for its {count} arguments",
            graph.display_instr(call)
        );
        let base = frame.values.len() - count;
        for i in 0..count {
            let env_value = graph.uses[frame.values[base + i]].definition;
            let aligned = match graph.move_argument_at(call, i) {
                Some(mv) => env_value == mv,
                None => {
                    let arg = graph.input_at(call, i);
                    graph.original_definition_ignore_boxing(env_value)
                        == graph.original_definition_ignore_boxing(arg)
                        || matches!(
                            (graph.constant_value(env_value), graph.constant_value(arg)),
                            (Some(a), Some(b)) if a == b
                        )
                }
            };
            ensure!(
                aligned,
                "argument {i} of {} does not match its environment slot",
                graph.display_instr(call)
            );
        }
        Ok(())
    }

    /// Every use on a definition's lists points back at it, and the
    /// consuming instruction holds the use at the recorded slot.
    fn check_use_lists(&self, def: InstrId) -> Result<(), ValidationError> {
        let graph = self.graph;
        for u in graph.input_uses(def) {
            let value = &graph.uses[u];
            ensure!(value.definition == def, "foreign use in the input list of {def:?}");
            ensure!(
                matches!(value.site, UseSite::Input),
                "environment use in the input list of {def:?}"
            );
            let user = &graph.instrs[value.instruction];
            ensure!(
                user.inputs.get(value.use_index as usize) == Some(&u),
                "use list of {} is out of sync with {}",
                graph.display_instr(def),
                graph.display_instr(value.instruction)
            );
        }
        for u in graph.env_uses(def) {
            let value = &graph.uses[u];
            ensure!(value.definition == def, "foreign use in the env list of {def:?}");
            let UseSite::Env { frame } = value.site else {
                return Err(ValidationError::new(format!(
                    "input use in the env list of {def:?}"
                )));
            };
            let user = &graph.instrs[value.instruction];
            let slot = user
                .env
                .as_ref()
                .and_then(|env| env.frames.get(frame as usize))
                .and_then(|f| f.values.get(value.use_index as usize));
            ensure!(
                slot == Some(&u),
                "environment use list of {} is out of sync with {}",
                graph.display_instr(def),
                graph.display_instr(value.instruction)
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;
    use indoc::indoc;

    fn config() -> CompilerConfig {
        CompilerConfig::default()
    }

    const DIAMOND: &str = indoc! {"
        (graph f
            (block B0 graph_entry (v0 constant 1))
            (block B1 function_entry
                (v1 parameter 0)
                (v2 strict_compare === v1 null)
                (branch B2 B3 v2))
            (block B2 target (goto B4))
            (block B3 target (goto B4))
            (block B4 join (preds B2 B3)
                (v3 phi v0 v1)
                (return v3)))
    "};

    #[test]
    fn accepts_a_well_formed_graph() {
        let graph = parse_program(DIAMOND).unwrap().into_first().unwrap().graph;
        check_flow_graph(&graph, &config()).unwrap();
    }

    #[test]
    fn rejects_phi_input_count_mismatch() {
        let mut graph = parse_program(DIAMOND).unwrap().into_first().unwrap().graph;
        let join = graph
            .reverse_postorder()
            .iter()
            .copied()
            .find(|&b| graph.blocks[b].is_join())
            .unwrap();
        let phi = graph.blocks[join].phis[0];
        let extra = graph.constant_null();
        graph.add_input(phi, extra);
        let err = check_flow_graph(&graph, &config()).unwrap_err();
        assert!(err.0.contains("predecessors"), "{err}");
    }

    #[test]
    fn rejects_use_before_definition() {
        let mut graph = parse_program(indoc! {"
            (graph g
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 boolean_negate v0)
                    (v2 boolean_negate v1)
                    (return v2)))
        "})
        .unwrap()
        .into_first()
        .unwrap()
        .graph;
        let entry = graph.normal_entry().unwrap();
        let instrs = graph.block_instrs_snapshot(entry);
        let (first, second) = (instrs[0], instrs[1]);
        // Make the first negation consume the second.
        graph.set_input(first, 0, second);
        let err = check_flow_graph(&graph, &config()).unwrap_err();
        assert!(err.0.contains("does not dominate"), "{err}");
    }

    #[test]
    fn rejects_use_missing_from_its_definition_list() {
        let mut graph = parse_program(indoc! {"
            (graph g
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 boolean_negate v0)
                    (v2 boolean_negate v1)
                    (return v2)))
        "})
        .unwrap()
        .into_first()
        .unwrap()
        .graph;
        let entry = graph.normal_entry().unwrap();
        let first = graph.block_instrs_snapshot(entry)[0];
        let u = graph.input_uses(first).next().unwrap();
        assert!(graph.uses[u].attached);

        // Drop the use from the list but leave its own bookkeeping alone.
        graph.instrs[first].input_use_list = graph.uses[u].next_use;
        let err = check_flow_graph(&graph, &config()).unwrap_err();
        assert!(err.0.contains("not linked"), "{err}");
    }

    #[test]
    fn call_arguments_must_match_the_environment() {
        let src = indoc! {"
            (program
                (function callee (fixed 2) static)
                (graph caller
                    (block B0 graph_entry (v0 constant 7))
                    (block B1 function_entry
                        (v1 parameter 0)
                        (v2 static_call callee (args 2) v1 v0)
                        (return v2))))
        "};
        let mut graph = parse_program(src).unwrap().into_first().unwrap().graph;
        check_flow_graph(&graph, &config()).unwrap();

        let entry = graph.normal_entry().unwrap();
        let call = graph.block_instrs_snapshot(entry)[0];
        let mut frames = graph.environment_spec(call).unwrap();
        let param = frames[0].values[0];
        let last = frames[0].values.len() - 1;
        frames[0].values[last] = param;
        graph.set_environment(call, frames);
        let err = check_flow_graph(&graph, &config()).unwrap_err();
        assert!(err.0.contains("environment slot"), "{err}");

        graph.instrs[call].env.as_mut().unwrap().lazy_deopt_to_before = true;
        check_flow_graph(&graph, &config()).unwrap();
    }

    #[test]
    fn move_argument_form_is_checked() {
        let src = indoc! {"
            (program
                (function callee (fixed 1) static)
                (graph caller
                    (block B1 function_entry
                        (v0 parameter 0)
                        (v1 static_call callee (args 1) v0)
                        (return v1))))
        "};
        let mut graph = parse_program(src).unwrap().into_first().unwrap().graph;
        graph.insert_move_arguments();
        check_flow_graph(&graph, &config()).unwrap();
    }
}

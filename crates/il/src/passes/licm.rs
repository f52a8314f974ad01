//! Loop-invariant code motion.
//!
//! Pure instructions whose inputs are defined outside a loop move to the
//! loop's preheader. Guards move too, but only when nothing observable
//! happens before them in the loop. A hoisted guard deoptimizes with the
//! state of the loop entry, taken from the first deoptimization point in
//! the header, with the header's phis replaced by their incoming values.

use crate::{
    BlockId, DeoptId, FlowGraph, InstrId, InstrKind,
    flow_graph::EnvFrameSpec,
    passes::loop_analysis::{Loop, LoopInfo},
};

pub struct LoopInvariantCodeMotion<'g> {
    graph: &'g mut FlowGraph,
    hoisted: usize,
}

/// Where hoisted guards deoptimize to.
struct EntryState {
    frames: Vec<EnvFrameSpec>,
    deopt_id: DeoptId,
}

impl<'g> LoopInvariantCodeMotion<'g> {
    /// Returns whether anything moved. Requires dominators.
    pub fn optimize(graph: &'g mut FlowGraph) -> bool {
        let _span = tracing::debug_span!("licm", function = graph.name()).entered();
        let loops = graph.compute_loops();
        let mut this = Self { graph, hoisted: 0 };
        this.hoist_loops(&loops);
        this.hoisted > 0
    }

    fn hoist_loops(&mut self, loops: &LoopInfo) {
        // Inner loops first, so that invariants can move out level by level.
        for loop_ in loops.loops.iter().rev() {
            let Some(preheader) = loops.preheader(self.graph, loop_) else {
                tracing::trace!("loop at {:?} has no preheader", loop_.header);
                continue;
            };
            self.hoist_loop(loop_, preheader);
        }
    }

    fn hoist_loop(&mut self, loop_: &Loop, preheader: BlockId) {
        let entry_state = self.entry_state(loop_, preheader);
        let mut blocked = false;
        for &block in &loop_.parts {
            // Blocks skipped on some iteration may not run at all.
            let always_executed = loop_.back_edges.iter().all(|&b| self.graph.dominates(block, b));
            if !always_executed {
                continue;
            }
            for instr in self.graph.block_instrs_snapshot(block) {
                let kind = &self.graph.instrs[instr].kind;
                let can_deoptimize = kind.can_deoptimize();
                let hoistable = kind.allows_cse()
                    && !kind.may_throw()
                    && self.is_loop_invariant(loop_, instr)
                    && match kind {
                        // A load may depend on a guard that stays behind.
                        InstrKind::LoadField(_) => !blocked,
                        _ if can_deoptimize => !blocked && entry_state.is_some(),
                        _ => true,
                    };
                if hoistable {
                    self.hoist(instr, preheader, entry_state.as_ref());
                } else if matches!(kind, InstrKind::CheckStackOverflow(_)) {
                    // Hoisted guards deoptimize to the state before it.
                } else if can_deoptimize
                    || kind.has_unknown_side_effects()
                    || kind.is_store()
                    || kind.may_throw()
                {
                    blocked = true;
                }
            }
        }
    }

    fn is_loop_invariant(&self, loop_: &Loop, instr: InstrId) -> bool {
        self.graph.inputs(instr).all(|def| match self.graph.block_of(def) {
            Some(block) => !loop_.contains(block),
            None => false,
        })
    }

    fn entry_state(&self, loop_: &Loop, preheader: BlockId) -> Option<EntryState> {
        let graph = &*self.graph;
        let anchor = graph
            .block_instrs(loop_.header)
            .find(|&i| graph.instrs[i].env.is_some())?;
        let entry_index = graph.blocks[loop_.header]
            .predecessors
            .iter()
            .position(|&p| p == preheader)?;

        let mut frames = graph.environment_spec(anchor)?;
        for frame in &mut frames {
            for value in &mut frame.values {
                if graph.blocks[loop_.header].phis.contains(value) {
                    *value = graph.input_at(*value, entry_index);
                } else if graph.block_of(*value).is_some_and(|b| loop_.contains(b)) {
                    return None;
                }
            }
        }
        Some(EntryState {
            frames,
            deopt_id: graph.instrs[anchor].deopt_id?,
        })
    }

    fn hoist(&mut self, instr: InstrId, preheader: BlockId, entry_state: Option<&EntryState>) {
        let graph = &mut *self.graph;
        tracing::debug!("hoisting {}", graph.display_instr(instr));
        graph.remove_from_graph(instr);
        graph.remove_environment(instr);
        let goto = graph
            .last_instruction(preheader)
            .unwrap_or_else(|| panic!("preheader {preheader:?} has no terminator"));
        graph.insert_before(goto, instr);

        let data = &mut graph.instrs[instr];
        match &mut data.kind {
            InstrKind::CheckClass(check) => check.licm_hoisted = true,
            InstrKind::CheckSmi(check) => check.licm_hoisted = true,
            _ => {}
        }
        if data.kind.can_deoptimize() {
            if let Some(state) = entry_state {
                data.deopt_id = Some(state.deopt_id);
                graph.set_environment(instr, state.frames.clone());
            }
        }
        self.hoisted += 1;
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

    fn find(graph: &FlowGraph, name: &str) -> InstrId {
        graph
            .instrs
            .keys()
            .find(|&i| graph.is_attached(i) && graph.instrs[i].kind.name() == name)
            .unwrap()
    }

    const LOOP: &str = indoc! {"
        (graph f
            (block B1 function_entry
                (v0 parameter 0)
                (v1 parameter 1)
                (goto B2))
            (block B2 join (preds B1 B3)
                (v2 phi 0 v4)
                (check_stack_overflow 1 (deopt 10) (env (frame f 2 10 v0 v1 v2)))
                (check_smi v1 (deopt 12))
                (v3 binary_smi_op & v1 255)
                (v5 relational_op < _Smi v2 v3)
                (branch B3 B4 v5))
            (block B3 target
                (v4 binary_smi_op + v2 1)
                (goto B2))
            (block B4 target
                (return v2)))
    "};

    #[test]
    fn invariant_guard_and_arithmetic_move_to_the_preheader() {
        let mut graph = parse(LOOP);
        assert!(LoopInvariantCodeMotion::optimize(&mut graph));
        check_flow_graph(&graph, &CompilerConfig::default()).unwrap();

        let entry = graph.reverse_postorder()[1];
        let check = find(&graph, "check_smi");
        let and = graph
            .instrs
            .keys()
            .find(|&i| graph.is_attached(i) && matches!(&graph.instrs[i].kind, InstrKind::BinarySmiOp(b) if b.op == crate::ir::Token::BitAnd))
            .unwrap();
        assert_eq!(graph.block_of(check), Some(entry));
        assert_eq!(graph.block_of(and), Some(entry));
        assert!(matches!(graph.instrs[check].kind, InstrKind::CheckSmi(ref c) if c.licm_hoisted));

        // Deoptimizing re-enters the loop with the phi's initial value.
        assert_eq!(graph.instrs[check].deopt_id, Some(DeoptId(10)));
        let env = graph.environment_spec(check).unwrap();
        let zero = graph.env_value(check, 0, 2);
        assert!(graph.constant_value(zero).is_some_and(|c| c.as_int() == Some(0)));
        assert_eq!(env[0].values.len(), 3);

        // The loop-carried comparison stays.
        let cmp = find(&graph, "relational_op");
        assert_ne!(graph.block_of(cmp), Some(entry));
    }

    #[test]
    fn guards_after_calls_stay_in_the_loop() {
        let mut graph = parse(&LOOP.replace(
            "(check_smi v1 (deopt 12))",
            "(v9 static_call f (args 2) v1 v1 (deopt 14))\n(check_smi v1 (deopt 12))",
        ));
        LoopInvariantCodeMotion::optimize(&mut graph);
        let check = find(&graph, "check_smi");
        let call = find(&graph, "static_call");
        assert_eq!(graph.block_of(check), graph.block_of(call));
    }
}

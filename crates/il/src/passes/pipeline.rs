//! The optimization pipeline run on a flow graph before code generation.

use crate::{
    Bailout, FlowGraph,
    feedback::TypeFeedback,
    formatter::print_flow_graph,
    passes::{
        allocation_sinking::AllocationSinking,
        aot_optimizer::AotOptimizer,
        constant_propagator::ConstantPropagator,
        licm::LoopInvariantCodeMotion,
        redundancy_elimination::{DeadCodeElimination, DeadStoreElimination, DominatorBasedCse, LoadOptimizer},
        type_propagator::propagate_types,
    },
    validation::check_or_panic,
};
use ember_core::CompilerConfig;

struct Pipeline<'a> {
    graph: &'a mut FlowGraph,
    config: &'a CompilerConfig,
}

impl Pipeline<'_> {
    fn run(&mut self, name: &str, pass: impl FnOnce(&mut FlowGraph)) {
        pass(self.graph);
        if self.config.verify_graph {
            check_or_panic(self.graph, self.config, name);
        }
        print_flow_graph(self.graph, self.config, name);
    }
}

/// Optimizes `graph` in place. Afterwards every call is in move-argument
/// form and the graph is ready for code generation.
pub fn optimize(graph: &mut FlowGraph, feedback: &TypeFeedback, config: &CompilerConfig) -> Result<(), Bailout> {
    let _span = tracing::info_span!("optimize", function = graph.name()).entered();
    print_flow_graph(graph, config, "before optimization");

    let mut pipeline = Pipeline { graph, config };
    pipeline.run("type propagation", propagate_types);

    AotOptimizer::optimize(pipeline.graph, feedback, config)?;
    if config.verify_graph {
        check_or_panic(pipeline.graph, config, "specialization");
    }
    pipeline.run("type propagation", propagate_types);

    if config.constant_propagation {
        pipeline.run("constant propagation", ConstantPropagator::optimize_branches);
    }
    pipeline.run("common subexpression elimination", |graph| {
        DominatorBasedCse::optimize(graph);
    });
    pipeline.run("load forwarding", |graph| {
        LoadOptimizer::optimize(graph);
    });
    if config.licm {
        pipeline.run("loop invariant code motion", |graph| {
            LoopInvariantCodeMotion::optimize(graph);
        });
    }
    if config.dead_store_elimination {
        pipeline.run("dead store elimination", |graph| {
            DeadStoreElimination::optimize(graph);
        });
    }
    if config.allocation_sinking {
        pipeline.run("allocation sinking", |graph| {
            AllocationSinking::optimize(graph);
        });
    }
    pipeline.run("dead code elimination", |graph| {
        DeadCodeElimination::optimize(graph);
    });
    pipeline.run("move arguments", FlowGraph::insert_move_arguments);

    tracing::debug!(
        instructions = pipeline.graph.definitions().len(),
        "optimized {}",
        pipeline.graph.name()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstrKind, parser::parse_program};
    use indoc::indoc;

    fn live_kinds(graph: &FlowGraph) -> Vec<&'static str> {
        graph
            .reverse_postorder()
            .iter()
            .flat_map(|&b| graph.block_instrs(b))
            .map(|i| graph.instrs[i].kind.name())
            .collect()
    }

    const POINT: &str = indoc! {"
        (program
            (class P Object (fields x y))
            (graph f
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 allocate_object P)
                    (store_field (slot x 1) init v1 v0)
                    (v2 load_field (slot x 1) v1)
                    (v3 instance_call + 2 (args 2) v2 v2 (deopt 4))
                    (return v3)))
            (feedback f (ic 4 + 2 (check (_Smi _Smi) f 10))))
    "};

    #[test]
    fn full_pipeline_specializes_forwards_and_sinks() {
        tracing_subscriber::fmt::try_init().ok();
        let mut program = parse_program(POINT).unwrap();
        let parsed = &mut program.functions[0];
        let config = CompilerConfig {
            verify_graph: true,
            ..CompilerConfig::default()
        };
        optimize(&mut parsed.graph, &parsed.feedback, &config).unwrap();

        let kinds = live_kinds(&parsed.graph);
        assert!(!kinds.contains(&"instance_call"), "{kinds:?}");
        assert!(!kinds.contains(&"load_field"), "{kinds:?}");
        assert!(!kinds.contains(&"allocate_object"), "{kinds:?}");
        assert!(!kinds.contains(&"store_field"), "{kinds:?}");
        assert!(kinds.contains(&"binary_smi_op"), "{kinds:?}");
        assert!(kinds.contains(&"check_smi"), "{kinds:?}");
    }

    #[test]
    fn disabled_passes_leave_their_work_undone() {
        tracing_subscriber::fmt::try_init().ok();
        let mut program = parse_program(POINT).unwrap();
        let parsed = &mut program.functions[0];
        let config = CompilerConfig {
            verify_graph: true,
            allocation_sinking: false,
            ..CompilerConfig::default()
        };
        optimize(&mut parsed.graph, &parsed.feedback, &config).unwrap();
        assert!(live_kinds(&parsed.graph).contains(&"allocate_object"));
    }

    #[test]
    fn calls_end_up_in_move_argument_form() {
        tracing_subscriber::fmt::try_init().ok();
        let mut program = parse_program(indoc! {"
            (program
                (graph g
                    (block B1 function_entry
                        (v0 parameter 0)
                        (v1 static_call g (args 1) v0)
                        (return v1))))
        "})
        .unwrap();
        let parsed = &mut program.functions[0];
        optimize(&mut parsed.graph, &parsed.feedback, &CompilerConfig::default()).unwrap();

        let graph = &parsed.graph;
        let call = graph
            .instrs
            .keys()
            .find(|&i| graph.is_attached(i) && matches!(graph.instrs[i].kind, InstrKind::StaticCall(_)))
            .unwrap();
        assert_eq!(graph.instrs[call].inputs.len(), 0);
        assert_eq!(graph.instrs[call].move_arguments.as_ref().map(|m| m.len()), Some(1));
    }
}

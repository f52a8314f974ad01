mod harnesses {
    use ember_core::{CompilerConfig, sexpr::SExpr};
    use ember_il::{
        FlowGraph,
        formatter::format_graph,
        parser::{ParsedFunction, parse_program},
        passes::{
            allocation_sinking::AllocationSinking, constant_propagator::ConstantPropagator,
            licm::LoopInvariantCodeMotion, pipeline,
            redundancy_elimination::{DominatorBasedCse, LoadOptimizer},
        },
        validation::check_flow_graph,
    };
    use pretty_assertions::assert_eq;

    fn config() -> CompilerConfig {
        CompilerConfig {
            verify_graph: true,
            ..CompilerConfig::default()
        }
    }

    fn parse(input: &str) -> Vec<ParsedFunction> {
        tracing_subscriber::fmt::try_init().ok();
        parse_program(input)
            .unwrap_or_else(|e| panic!("failed to parse: {e}"))
            .functions
    }

    fn check(graph: &FlowGraph) {
        check_flow_graph(graph, &config())
            .unwrap_or_else(|e| panic!("invalid flow graph for '{}': {e}", graph.name()));
    }

    /// Runs `pass` on the first graph of `input` and compares the
    /// formatted result against `expected`.
    fn transform_matches_expected(input: &str, expected: &str, pass: impl FnOnce(&mut FlowGraph)) {
        let mut functions = parse(input);
        let graph = &mut functions[0].graph;
        pass(graph);
        check(graph);
        let expected =
            SExpr::parse(expected).unwrap_or_else(|e| panic!("malformed expected output: {e}"));
        assert_eq!(format_graph(graph).to_string(), expected.to_string());
    }

    /// Verifies that the checker accepts every graph.
    pub fn checker_accepts(input: &'static str) {
        for function in parse(input) {
            check(&function.graph);
        }
    }

    /// Verifies that the checker rejects some graph.
    pub fn checker_rejects(input: &'static str) {
        let functions = parse(input);
        if functions
            .iter()
            .all(|f| check_flow_graph(&f.graph, &config()).is_ok())
        {
            panic!("every graph passed the checker, but one was expected to fail");
        }
    }

    /// Verifies that a graph written in formatter output form formats
    /// back to itself.
    pub fn parser_roundtrip(input: &'static str) {
        let source: String = input
            .lines()
            .filter(|line| !line.trim_start().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");
        transform_matches_expected(input, &source, |_| {});
    }

    pub fn constant_propagation(input: &'static str, expected: &'static str) {
        transform_matches_expected(input, expected, ConstantPropagator::optimize_branches);
    }

    pub fn cse(input: &'static str, expected: &'static str) {
        transform_matches_expected(input, expected, |graph| {
            DominatorBasedCse::optimize(graph);
            LoadOptimizer::optimize(graph);
        });
    }

    pub fn licm(input: &'static str, expected: &'static str) {
        transform_matches_expected(input, expected, |graph| {
            LoopInvariantCodeMotion::optimize(graph);
        });
    }

    pub fn allocation_sinking(input: &'static str, expected: &'static str) {
        transform_matches_expected(input, expected, |graph| {
            AllocationSinking::optimize(graph);
        });
    }

    /// Compares the loops found in the first graph against `expected`.
    pub fn loops(input: &'static str, expected: &'static str) {
        let mut functions = parse(input);
        let graph = &mut functions[0].graph;
        let info = graph.compute_loops();
        let expected =
            SExpr::parse(expected).unwrap_or_else(|e| panic!("malformed expected output: {e}"));
        assert_eq!(info.to_sexpr(graph).to_string(), expected.to_string());
    }

    /// Runs the whole pipeline on every graph with checking enabled.
    pub fn pipeline_succeeds(input: &'static str) {
        for mut function in parse(input) {
            pipeline::optimize(&mut function.graph, &function.feedback, &config())
                .unwrap_or_else(|e| panic!("optimizing '{}' bailed out: {e}", function.graph.name()));
            check(&function.graph);
        }
    }

    /// Verifies that the pipeline gives up on some graph.
    pub fn pipeline_bails_out(input: &'static str) {
        let bailed = parse(input).into_iter().any(|mut function| {
            pipeline::optimize(&mut function.graph, &function.feedback, &config()).is_err()
        });
        assert!(bailed, "every graph optimized, but one was expected to bail out");
    }
}

include!(concat!(env!("OUT_DIR"), "/generated.rs"));

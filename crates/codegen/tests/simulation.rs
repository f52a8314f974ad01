//! Compiles small programs for every architecture and runs the code in
//! the simulator.

use ember_codegen::{
    Arch, compile,
    deopt::DeoptReason,
    simulator::{Outcome, STACK_TOP, Simulator},
    stubs::{RuntimeEntry, StubId},
};
use ember_core::CompilerConfig;
use ember_il::{
    DeoptId,
    object_model::{ClassId, FunctionId},
    parser::parse_program,
    passes::{pipeline, type_propagator::propagate_types},
};
use indoc::indoc;
use pretty_assertions::assert_eq;

struct Harness {
    sim: Simulator,
    functions: Vec<(String, FunctionId)>,
    classes: std::sync::Arc<ember_il::object_model::ClassTable>,
}

impl Harness {
    fn new(src: &str, arch: Arch) -> Self {
        Self::with_config(src, arch, &CompilerConfig::default())
    }

    fn with_config(src: &str, arch: Arch, config: &CompilerConfig) -> Self {
        Self::build(src, arch, config, false)
    }

    /// Runs the optimization pipeline before compiling.
    fn optimized(src: &str, arch: Arch, config: &CompilerConfig) -> Self {
        Self::build(src, arch, config, true)
    }

    fn build(src: &str, arch: Arch, config: &CompilerConfig, optimize: bool) -> Self {
        tracing_subscriber::fmt::try_init().ok();
        let program = parse_program(src).unwrap_or_else(|e| panic!("failed to parse: {e}"));
        let classes = program.classes.clone();
        let mut sim = Simulator::new(arch, classes.clone());
        let mut functions = Vec::new();
        for mut function in program.functions {
            let graph = &mut function.graph;
            if optimize {
                pipeline::optimize(graph, &function.feedback, config)
                    .unwrap_or_else(|e| panic!("failed to optimize {}: {e}", graph.name()));
            } else {
                propagate_types(graph);
                graph.insert_move_arguments();
            }
            let code = compile(graph, &function.feedback, config, arch)
                .unwrap_or_else(|e| panic!("failed to compile {} for {arch}: {e}", graph.name()));
            functions.push((graph.name().to_string(), graph.function));
            sim.install(code).unwrap();
        }
        Self {
            sim,
            functions,
            classes,
        }
    }

    fn function(&self, name: &str) -> FunctionId {
        self.functions
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, f)| f)
            .unwrap_or_else(|| panic!("no function {name}"))
    }

    fn class(&self, name: &str) -> ClassId {
        self.classes.class_by_name(name).unwrap()
    }

    fn call(&mut self, name: &str, args: &[i64]) -> Outcome {
        let function = self.function(name);
        self.sim
            .call(function, args)
            .unwrap_or_else(|e| panic!("{name} failed: {e}"))
    }

    fn returned(&mut self, name: &str, args: &[i64]) -> i64 {
        match self.call(name, args) {
            Outcome::Returned(value) => value,
            other => panic!("{name} did not return: {other:?}"),
        }
    }

    fn threw(&mut self, name: &str, args: &[i64]) -> String {
        match self.call(name, args) {
            Outcome::Threw(exception) => self
                .sim
                .string_value(exception)
                .unwrap_or("<not a string>")
                .to_string(),
            other => panic!("{name} did not throw: {other:?}"),
        }
    }
}

#[test]
fn static_calls_pass_arguments_and_return_results() {
    let src = indoc! {"
        (program
            (function add (fixed 2) static)
            (function main (fixed 2) static)
            (graph add
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 parameter 1)
                    (check_smi v0)
                    (check_smi v1)
                    (v2 binary_smi_op + v0 v1)
                    (return v2)))
            (graph main
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 parameter 1)
                    (v2 static_call add (args 2) v0 v1)
                    (return v2))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let (a, b) = (h.sim.smi(10), h.sim.smi(3));
        assert_eq!(h.returned("main", &[a, b]), h.sim.smi(13), "{arch}");
        assert!(h.sim.stats().safepoints_verified == 0, "{arch}");
    }
}

#[test]
fn class_check_failure_deoptimizes_to_the_guarded_frame() {
    let src = indoc! {"
        (program
            (class A Object)
            (function id (fixed 1) static)
            (function f (fixed 1) static)
            (graph id
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (return v0)))
            (graph f
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (check_class (cids 16) v0)
                    (v1 static_call id (args 1) v0)
                    (return v1))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let a = h.class("A");
        assert_eq!(a, 16);
        let instance = h.sim.new_instance(a, &[]).unwrap();
        assert_eq!(h.returned("f", &[instance]), instance, "{arch}");

        let five = h.sim.smi(5);
        let Outcome::Deoptimized(deopt) = h.call("f", &[five]) else {
            panic!("smi passed the class check on {arch}");
        };
        let f = h.function("f");
        assert_eq!(deopt.function, f);
        assert_eq!(deopt.reason, DeoptReason::CheckClass);
        assert_eq!(deopt.result, None);
        assert_eq!(deopt.frames.len(), 1, "{arch}");
        assert_eq!(deopt.frames[0].function, f);
        assert_eq!(deopt.frames[0].deopt_id, deopt.deopt_id);
        assert_eq!(deopt.frames[0].stack, vec![five], "{arch}");
        assert_eq!(deopt.arguments, vec![five], "{arch}");
        assert_eq!(h.sim.stats().stub_calls.last(), Some(&StubId::Deoptimize));
    }
}

#[test]
fn trap_on_deoptimization_stops_before_the_stub() {
    let src = indoc! {"
        (program
            (function f (fixed 1) static)
            (graph f
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (check_smi v0)
                    (return v0))))
    "};
    let config = CompilerConfig {
        trap_on_deoptimization: true,
        ..CompilerConfig::default()
    };
    for arch in Arch::ALL {
        let mut h = Harness::with_config(src, arch, &config);
        let f = h.function("f");
        let object = h.sim.new_array(&[]).unwrap();
        let err = h.sim.call(f, &[object]).unwrap_err();
        assert!(
            matches!(err, ember_codegen::simulator::SimError::Breakpoint { .. }),
            "{arch}: {err}"
        );
    }
}

#[test]
fn closure_calls_fill_in_named_defaults() {
    let src = indoc! {"
        (program
            (function c (fixed 2) (named (b 10)) closure)
            (function main (fixed 1) static)
            (function main3 (fixed 1) static)
            (graph c
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 parameter 1)
                    (v2 parameter 2)
                    (return v2)))
            (graph main
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 closure_call (args 2) v0 1)
                    (return v1)))
            (graph main3
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 closure_call (args 3) v0 1 2)
                    (return v1))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let closure = h.sim.new_closure(h.function("c")).unwrap();
        assert_eq!(h.returned("main", &[closure]), h.sim.smi(10), "{arch}");
        assert!(h.sim.stats().no_such_method.is_empty(), "{arch}");

        let message = h.threw("main3", &[closure]);
        assert!(message.starts_with("NoSuchMethodError"), "{arch}: {message}");
        assert_eq!(h.sim.stats().no_such_method, vec![h.function("c")]);
    }
}

#[test]
fn named_arguments_are_matched_by_name() {
    let src = indoc! {"
        (program
            (function g (fixed 1) (named (x 1) (y 2)) static)
            (graph g
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 parameter 1)
                    (v2 parameter 2)
                    (return v2))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let g = h.function("g");
        let args = [h.sim.smi(0), h.sim.smi(7)];
        let desc = ember_il::feedback::ArgumentsDescriptor::new(2, &["y"]);
        let outcome = h.sim.call_with(g, &args, &desc).unwrap();
        assert_eq!(outcome, Outcome::Returned(h.sim.smi(7)), "{arch}");

        let desc = ember_il::feedback::ArgumentsDescriptor::new(2, &["x"]);
        let outcome = h.sim.call_with(g, &args, &desc).unwrap();
        assert_eq!(outcome, Outcome::Returned(h.sim.smi(2)), "{arch}");
    }
}

#[test]
fn inline_caches_dispatch_and_record_receivers() {
    let src = indoc! {"
        (program
            (class A Object)
            (class B A)
            (function a_foo (owner A) (fixed 1) (method foo))
            (function b_foo (owner B) (fixed 1) (method foo))
            (function main (fixed 1) static)
            (graph a_foo
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (return 1)))
            (graph b_foo
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (return 2)))
            (graph main
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 instance_call foo 1 (args 1) v0 (deopt 2))
                    (return v1))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let (a, b) = (h.class("A"), h.class("B"));
        let x = h.sim.new_instance(a, &[]).unwrap();
        let y = h.sim.new_instance(b, &[]).unwrap();
        assert_eq!(h.returned("main", &[x]), h.sim.smi(1), "{arch}");
        assert_eq!(h.returned("main", &[y]), h.sim.smi(2), "{arch}");
        assert_eq!(h.returned("main", &[y]), h.sim.smi(2), "{arch}");

        let ic = h.sim.inline_cache(h.function("main"), DeoptId(2)).unwrap();
        let seen: Vec<_> = ic
            .checks
            .iter()
            .map(|c| (c.cids.to_vec(), c.count))
            .collect();
        assert_eq!(seen, vec![(vec![a], 1), (vec![b], 2)], "{arch}");

        let smi = h.sim.smi(3);
        let message = h.threw("main", &[smi]);
        assert!(message.contains("has no method foo"), "{arch}: {message}");
    }
}

#[test]
fn polymorphic_calls_test_class_ids_inline() {
    let src = indoc! {"
        (program
            (class A Object)
            (class B Object)
            (function a_foo (owner A) (fixed 1) (method foo))
            (function b_foo (owner B) (fixed 1) (method foo))
            (function main (fixed 1) static)
            (graph a_foo
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (return 1)))
            (graph b_foo
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (return 2)))
            (graph main
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 polymorphic_instance_call foo (args 1) (targets (A a_foo 5) (B b_foo 5)) complete v0)
                    (return v1))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let x = h.sim.new_instance(h.class("A"), &[]).unwrap();
        let y = h.sim.new_instance(h.class("B"), &[]).unwrap();
        assert_eq!(h.returned("main", &[x]), h.sim.smi(1), "{arch}");
        assert_eq!(h.returned("main", &[y]), h.sim.smi(2), "{arch}");
        assert!(
            !h.sim
                .stats()
                .stub_calls
                .iter()
                .any(|s| matches!(s, StubId::InlineCache { .. })),
            "{arch}"
        );
    }
}

#[test]
fn checked_smi_ops_fall_back_to_an_instance_call() {
    let src = indoc! {"
        (program
            (class V Object)
            (function v_plus (owner V) (fixed 2) (method +))
            (function add (fixed 2) static)
            (graph v_plus
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 parameter 1)
                    (return 99)))
            (graph add
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 parameter 1)
                    (v2 checked_smi_op + v0 v1)
                    (return v2))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let (two, three) = (h.sim.smi(2), h.sim.smi(3));
        assert_eq!(h.returned("add", &[two, three]), h.sim.smi(5), "{arch}");
        assert!(h.sim.stats().stub_calls.is_empty(), "{arch}");

        let v = h.sim.new_instance(h.class("V"), &[]).unwrap();
        assert_eq!(h.returned("add", &[v, three]), h.sim.smi(99), "{arch}");
        assert_eq!(
            h.sim.stats().stub_calls,
            vec![StubId::InlineCache { num_args_tested: 2 }],
            "{arch}"
        );
    }
}

#[test]
fn instance_of_uses_class_ranges_then_the_cache_then_the_runtime() {
    let src = indoc! {"
        (program
            (class A Object)
            (class B A)
            (class C Object)
            (function is_a (fixed 1) static)
            (function is_t (fixed 1) static)
            (graph is_a
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 instance_of (type A) v0 null null)
                    (return v1)))
            (graph is_t
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 instance_of (type T0) v0 null null)
                    (return v1))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let yes = h.sim.bool_value(true);
        let no = h.sim.bool_value(false);
        let b = h.sim.new_instance(h.class("B"), &[]).unwrap();
        let c = h.sim.new_instance(h.class("C"), &[]).unwrap();
        let smi = h.sim.smi(1);
        let null = h.sim.null();
        assert_eq!(h.returned("is_a", &[b]), yes, "{arch}");
        assert_eq!(h.returned("is_a", &[c]), no, "{arch}");
        assert_eq!(h.returned("is_a", &[smi]), no, "{arch}");
        assert_eq!(h.returned("is_a", &[null]), no, "{arch}");
        assert!(h.sim.stats().runtime_calls.is_empty(), "{arch}");

        assert_eq!(h.returned("is_t", &[c]), yes, "{arch}");
        assert_eq!(h.sim.stats().runtime_calls, vec![RuntimeEntry::Instanceof]);
        assert_eq!(h.sim.subtype_test_cache_entries(), 1);
        assert_eq!(h.returned("is_t", &[c]), yes, "{arch}");
        assert_eq!(
            h.sim.stats().runtime_calls.len(),
            1,
            "second test should hit the cache on {arch}"
        );
    }
}

#[test]
fn failed_assignability_checks_throw_type_errors() {
    let src = indoc! {"
        (program
            (class A Object)
            (function f (fixed 1) static)
            (graph f
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 assert_assignable (type A) x v0 null null)
                    (return v1))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let a = h.sim.new_instance(h.class("A"), &[]).unwrap();
        assert_eq!(h.returned("f", &[a]), a, "{arch}");
        let smi = h.sim.smi(4);
        let message = h.threw("f", &[smi]);
        assert!(message.starts_with("TypeError"), "{arch}: {message}");
        assert!(message.ends_with("in x"), "{arch}: {message}");
    }
}

#[test]
fn exceptions_unwind_to_the_enclosing_handler() {
    let src = indoc! {"
        (program
            (function thrower (fixed 1) static)
            (function main (fixed 1) static)
            (graph thrower
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (throw v0)))
            (graph main
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (goto B2))
                (block B2 target (try 0)
                    (v1 static_call thrower (args 1) v0)
                    (return v1))
                (block B3 (catch_entry 0)
                    (v2 parameter 0)
                    (v3 parameter 1)
                    (return v2))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let exception = h.sim.string("boom");
        assert_eq!(h.returned("main", &[exception]), exception, "{arch}");
        match h.call("thrower", &[exception]) {
            Outcome::Threw(value) => assert_eq!(value, exception, "{arch}"),
            other => panic!("{arch}: {other:?}"),
        }
    }
}

#[test]
fn allocation_points_have_valid_stack_maps() {
    let src = indoc! {"
        (program
            (class P Object (fields x y))
            (function make (fixed 1) static)
            (graph make
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 allocate_object P)
                    (store_field (slot x 1) init v1 v0)
                    (v2 allocate_object P)
                    (store_field (slot y 2) v2 v1)
                    (return v2))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let seven = h.sim.smi(7);
        let outer = h.returned("make", &[seven]);
        let p = h.class("P");
        assert_eq!(h.sim.class_id_of(outer).unwrap(), p);
        let inner = h.sim.field(outer, 2).unwrap();
        assert_eq!(h.sim.class_id_of(inner).unwrap(), p);
        assert_eq!(h.sim.field(inner, 1).unwrap(), seven, "{arch}");
        assert!(h.sim.is_null(h.sim.field(outer, 1).unwrap()));
        assert_eq!(h.sim.stats().safepoints_verified, 2, "{arch}");
    }
}

#[test]
fn materialized_objects_match_unsunk_execution() {
    let orders = [
        ["(store_field (slot x 1) init v2 v1)", "(store_field (slot y 2) init v2 7)"].join("\n"),
        ["(store_field (slot y 2) init v2 7)", "(store_field (slot x 1) init v2 v1)"].join("\n"),
        [
            "(store_field (slot x 1) init v2 v1)",
            "(store_field (slot y 2) init v2 7)",
            "(store_field (slot x 1) v2 3)",
        ]
        .join("\n"),
        [
            "(store_field (slot y 2) init v2 v1)",
            "(store_field (slot y 2) v2 5)",
            "(store_field (slot x 1) init v2 v1)",
        ]
        .join("\n"),
        "(store_field (slot x 1) init v2 v1)".to_string(),
    ];
    for stores in &orders {
        let src = format!(
            "(program
                (class P Object (fields x y))
                (function f (fixed 2) static)
                (graph f
                    (block B0 graph_entry)
                    (block B1 function_entry
                        (v0 parameter 0)
                        (v1 parameter 1)
                        (v2 allocate_object P)
                        {stores}
                        (check_smi v0 (deopt 4) (env (frame f 2 4 v0 v1 v2)))
                        (return v0))))"
        );
        for arch in Arch::ALL {
            let fields = |allocation_sinking: bool| {
                let config = CompilerConfig {
                    allocation_sinking,
                    verify_graph: true,
                    ..CompilerConfig::default()
                };
                let mut h = Harness::optimized(&src, arch, &config);
                let receiver = h.sim.new_array(&[]).unwrap();
                let eleven = h.sim.smi(11);
                let Outcome::Deoptimized(deopt) = h.call("f", &[receiver, eleven]) else {
                    panic!("array passed the smi check on {arch}");
                };
                assert_eq!(deopt.reason, DeoptReason::CheckSmi, "{arch}");
                let [object] = deopt.frames[0].stack[..] else {
                    panic!("{arch}: unexpected frame {:?}", deopt.frames[0].stack);
                };
                assert_eq!(h.sim.class_id_of(object).unwrap(), h.class("P"), "{arch}");
                let sunk = !h
                    .sim
                    .stats()
                    .stub_calls
                    .iter()
                    .any(|stub| matches!(stub, StubId::AllocateObject(_)));
                let describe = |word: u32| {
                    let value = h.sim.field(object, word).unwrap();
                    if h.sim.is_null(value) {
                        "null".to_string()
                    } else {
                        h.sim
                            .int_value(value)
                            .map_or_else(|| format!("{value:#x}"), |i| i.to_string())
                    }
                };
                (sunk, [describe(1), describe(2)])
            };
            let (sunk, materialized) = fields(true);
            let (allocated, expected) = fields(false);
            assert!(sunk, "{arch}: allocation was not sunk for\n{stores}");
            assert!(!allocated, "{arch}: allocation vanished without sinking");
            assert_eq!(materialized, expected, "{arch}:\n{stores}");
        }
    }
}

#[test]
fn stack_overflow_checks_call_the_runtime_when_the_limit_is_hit() {
    let src = indoc! {"
        (program
            (function f (fixed 1) static)
            (graph f
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (check_stack_overflow 0)
                    (return v0))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let one = h.sim.smi(1);
        assert_eq!(h.returned("f", &[one]), one);
        assert_eq!(h.sim.stats().stack_overflow_checks, 0, "{arch}");

        h.sim.machine_mut().set_stack_limit(STACK_TOP);
        assert_eq!(h.returned("f", &[one]), one);
        assert_eq!(h.sim.stats().stack_overflow_checks, 1, "{arch}");
    }
}

#[test]
fn usage_counter_requests_optimization_at_the_threshold() {
    let src = indoc! {"
        (program
            (function f (fixed 1) static)
            (graph f
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (return v0))))
    "};
    let config = CompilerConfig {
        optimization_counter_threshold: Some(2),
        ..CompilerConfig::default()
    };
    for arch in Arch::ALL {
        let mut h = Harness::with_config(src, arch, &config);
        let f = h.function("f");
        let one = h.sim.smi(1);
        for _ in 0..3 {
            assert_eq!(h.returned("f", &[one]), one);
        }
        assert_eq!(h.sim.usage_counter(f), Some(3), "{arch}");
        assert_eq!(h.sim.stats().optimization_requests, vec![f, f], "{arch}");
    }
}

#[test]
fn osr_entry_picks_up_the_interrupted_frame() {
    let src = indoc! {"
        (program
            (function f (fixed 1) static)
            (graph f
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (goto B3))
                (block B2 osr_entry
                    (v1 parameter 0)
                    (v2 parameter 1)
                    (goto B3))
                (block B3 join (preds B1 B2)
                    (v3 phi 0 v2)
                    (return v3))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let f = h.function("f");
        let (one, local) = (h.sim.smi(1), h.sim.smi(42));
        assert_eq!(h.returned("f", &[one]), h.sim.smi(0), "{arch}");
        let outcome = h.sim.enter_osr(f, &[one], &[local]).unwrap();
        assert_eq!(outcome, Outcome::Returned(local), "{arch}");
    }
}

#[test]
fn invalidated_callers_deoptimize_when_the_callee_returns() {
    let src = indoc! {"
        (program
            (function callee (fixed 1) static)
            (function caller (fixed 1) static)
            (graph callee
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (return 5)))
            (graph caller
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 static_call callee (args 1) v0)
                    (return v1))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let (caller, callee) = (h.function("caller"), h.function("callee"));
        let arg = h.sim.smi(8);
        assert_eq!(h.returned("caller", &[arg]), h.sim.smi(5));

        h.sim.invalidate_on_entry(callee, caller);
        let Outcome::Deoptimized(deopt) = h.call("caller", &[arg]) else {
            panic!("caller kept running after invalidation on {arch}");
        };
        assert_eq!(deopt.function, caller);
        assert_eq!(deopt.reason, DeoptReason::AtCall, "{arch}");
        assert_eq!(deopt.result, Some(h.sim.smi(5)), "{arch}");
        assert_eq!(deopt.frames[0].function, caller);
        assert_eq!(deopt.arguments, vec![arg], "{arch}");
    }
}

#[test]
fn identity_of_boxed_numbers_compares_payloads() {
    let src = indoc! {"
        (program
            (function same (fixed 2) static)
            (graph same
                (block B0 graph_entry)
                (block B1 function_entry
                    (v0 parameter 0)
                    (v1 parameter 1)
                    (v2 strict_compare === number_check v0 v1)
                    (return v2))))
    "};
    for arch in Arch::ALL {
        let mut h = Harness::new(src, arch);
        let x = h.sim.double(1.5).unwrap();
        let y = h.sim.double(1.5).unwrap();
        let z = h.sim.double(2.5).unwrap();
        assert_ne!(x, y);
        let yes = h.sim.bool_value(true);
        let no = h.sim.bool_value(false);
        assert_eq!(h.returned("same", &[x, y]), yes, "{arch}");
        assert_eq!(h.returned("same", &[x, z]), no, "{arch}");
    }
}

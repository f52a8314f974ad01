//! Per-compilation configuration.
//!
//! Every knob that influences a pass or the code generator lives here
//! and is passed explicitly; there is no global flag state.

use compact_str::CompactString;
use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    /// Run the flow graph checker after every pass.
    pub verify_graph: bool,
    /// The checker skips dominance checks on graphs with more
    /// definitions than this, since they are quadratic in the worst case.
    pub verify_definitions_threshold: usize,
    /// Emit a breakpoint in front of every deoptimization stub call.
    pub trap_on_deoptimization: bool,
    pub unbox_doubles: bool,
    pub unbox_mints: bool,
    /// Allow specializations guarded by deoptimizing checks.
    pub use_speculative_inlining: bool,
    /// Maximum number of receiver classes for which a polymorphic
    /// call is lowered to an inline cid cascade.
    pub max_polymorphic_checks: usize,
    /// Whether the compiled code is optimized. Unoptimized code records
    /// an extra "deopt after" descriptor at every call instead of
    /// a lazy deoptimization entry.
    pub optimizing: bool,
    /// Ahead-of-time mode: instance calls go through switchable call
    /// sites instead of inline caches.
    pub precompiled: bool,
    pub use_osr: bool,
    /// Invocation count at which the prologue requests reoptimization.
    /// `None` disables the check.
    pub optimization_counter_threshold: Option<u32>,
    /// Test class ids inline when the tested type allows it.
    pub inline_type_tests: bool,
    /// Consult a subtype test cache before calling into the runtime.
    pub use_subtype_test_cache: bool,
    pub constant_propagation: bool,
    pub dead_store_elimination: bool,
    pub licm: bool,
    pub allocation_sinking: bool,
    pub print_flow_graph: bool,
    /// Only functions whose name contains this string are printed.
    pub print_flow_graph_filter: Option<CompactString>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            verify_graph: cfg!(debug_assertions),
            verify_definitions_threshold: 250,
            trap_on_deoptimization: false,
            unbox_doubles: true,
            unbox_mints: true,
            use_speculative_inlining: true,
            max_polymorphic_checks: 4,
            optimizing: true,
            precompiled: false,
            use_osr: false,
            optimization_counter_threshold: None,
            inline_type_tests: true,
            use_subtype_test_cache: true,
            constant_propagation: true,
            dead_store_elimination: true,
            licm: true,
            allocation_sinking: true,
            print_flow_graph: false,
            print_flow_graph_filter: None,
        }
    }
}

impl CompilerConfig {
    /// Configuration for ahead-of-time compilation, where speculative
    /// guards are not allowed to deoptimize.
    pub fn aot() -> Self {
        Self {
            use_speculative_inlining: false,
            precompiled: true,
            ..Self::default()
        }
    }

    /// Applies overrides from `EMBER_*` environment variables.
    pub fn with_env_overrides(mut self) -> Self {
        fn flag(name: &str) -> Option<bool> {
            let value = env::var(name).ok()?;
            match value.as_str() {
                "1" | "true" | "yes" => Some(true),
                "0" | "false" | "no" => Some(false),
                other => {
                    tracing::warn!("ignoring malformed value {other:?} for {name}");
                    None
                }
            }
        }

        if let Some(v) = flag("EMBER_VERIFY_GRAPH") {
            self.verify_graph = v;
        }
        if let Some(v) = flag("EMBER_TRAP_ON_DEOPTIMIZATION") {
            self.trap_on_deoptimization = v;
        }
        if let Some(v) = flag("EMBER_USE_SPECULATIVE_INLINING") {
            self.use_speculative_inlining = v;
        }
        if let Some(v) = flag("EMBER_INLINE_TYPE_TESTS") {
            self.inline_type_tests = v;
        }
        if let Some(v) = flag("EMBER_USE_SUBTYPE_TEST_CACHE") {
            self.use_subtype_test_cache = v;
        }
        if let Some(v) = flag("EMBER_PRINT_FLOW_GRAPH") {
            self.print_flow_graph = v;
        }
        if let Ok(filter) = env::var("EMBER_PRINT_FLOW_GRAPH_FILTER") {
            self.print_flow_graph_filter = Some(filter.into());
        }
        if let Some(threshold) = env::var("EMBER_VERIFY_DEFINITIONS_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.verify_definitions_threshold = threshold;
        }
        self
    }

    /// Whether the flow graph of the named function should be printed.
    pub fn should_print(&self, function_name: &str) -> bool {
        self.print_flow_graph
            && self
                .print_flow_graph_filter
                .as_deref()
                .is_none_or(|filter| function_name.contains(filter))
    }
}

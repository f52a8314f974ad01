//! Flow graph validation.
//!
//! These checks are not diagnostics for users. They assert the
//! invariants the passes and the code generator rely on, and run between
//! passes when [`CompilerConfig::verify_graph`] is set.

use crate::flow_graph::FlowGraph;
use ember_core::CompilerConfig;
use std::{fmt::Display, panic::Location};

pub mod checker;

pub use checker::check_flow_graph;

#[derive(Debug, Clone)]
pub struct ValidationError(pub String, pub &'static Location<'static>);

impl ValidationError {
    #[track_caller]
    pub fn new(msg: impl Display) -> Self {
        Self(msg.to_string(), Location::caller())
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (checked at {})", self.0, self.1)
    }
}

/// Runs the checker and treats any violation as fatal.
pub fn check_or_panic(graph: &FlowGraph, config: &CompilerConfig, after_pass: &str) {
    if let Err(error) = check_flow_graph(graph, config) {
        panic!(
            "flow graph of {} is invalid after {after_pass}: {error}",
            graph.name()
        );
    }
}

pub mod allocation_sinking;
pub mod aot_optimizer;
pub mod constant_propagator;
pub mod licm;
pub mod loop_analysis;
pub mod pipeline;
pub mod redundancy_elimination;
pub mod type_propagator;

//! Sandbox fakes with injectable delays, used to exercise the pipeline
//! without spawning processes.
pub mod sandbox;

pub mod evaluator;
pub mod sandbox;
pub mod store;
pub mod submitter;

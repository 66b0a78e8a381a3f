pub mod complexity;
pub mod evaluation;
pub mod running;
pub mod scoring;
pub mod submission;

//! Sandbox backends: a container runtime driven through its CLI and direct
//! child processes under rlimits, plus the startup selector and the shared
//! worker pool in front of whichever backend was chosen.
pub mod container;
pub mod local;
pub mod pool;
pub mod process;
pub mod scratch;
pub mod selector;
pub mod tree;

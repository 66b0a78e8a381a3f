//! Proctored attempt lifecycle: a pure transition function plus the service
//! that runs forced submissions and mirrors sessions to the store.
pub mod machine;
pub mod service;

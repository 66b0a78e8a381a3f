pub mod config;
pub mod constants;
pub mod core;
pub mod sandbox;
pub mod server;
pub mod store;
pub mod stubs;

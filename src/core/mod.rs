pub mod domain;
pub mod errors;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod traits;

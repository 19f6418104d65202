//! Command handlers and runtime fixtures shared by heron's tests, benches
//! and examples.

mod fixtures;
mod handlers;
mod store;

pub use fixtures::*;
pub use handlers::*;
pub use store::*;

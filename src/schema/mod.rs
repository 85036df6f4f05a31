//! Schema module - Configuration and animation descriptor types.

mod animation;
mod config;

pub use animation::*;
pub use config::*;

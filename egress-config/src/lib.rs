//! Configuration management for egress services.
//!
//! Provides environment detection, hierarchical configuration loading from
//! YAML files with environment-variable overrides, secret handling, and the
//! shared settings types consumed by the batch router and the warehouse
//! uploader.

mod environment;
mod load;
mod secret;
pub mod shared;

pub use environment::*;
pub use load::*;
pub use secret::*;

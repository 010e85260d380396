//! Telemetry setup for egress services.
//!
//! Provides `tracing` initialization for long-running services and a
//! one-shot initializer for tests.

mod tracing;

pub use crate::tracing::*;

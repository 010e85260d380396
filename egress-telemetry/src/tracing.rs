use std::sync::Once;

use thiserror::Error;
use tracing::subscriber::{SetGlobalDefaultError, set_global_default};
use tracing_subscriber::{EnvFilter, fmt};

/// Errors that can occur during tracing initialization.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to set global default subscriber: {0}")]
    SetGlobalDefault(#[from] SetGlobalDefaultError),
}

static INIT_TEST_TRACING: Once = Once::new();

/// Initializes tracing for a service.
///
/// Log level is taken from `RUST_LOG` and defaults to `info`. The `service`
/// name is attached to every event as a field of the root subscriber.
pub fn init_tracing(service: &str) -> Result<(), TracingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    set_global_default(subscriber)?;

    tracing::info!(service, "tracing initialized");

    Ok(())
}

/// Initializes tracing for test environments.
///
/// Call once at the beginning of tests. Set `ENABLE_TRACING=1` to view
/// tracing output:
/// ```bash
/// ENABLE_TRACING=1 cargo test test_name
/// ```
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var("ENABLE_TRACING").is_ok() {
            init_tracing("test").expect("Failed to initialize tracing for tests");
        }
    });
}

//! Logging setup for applications embedding the engine
//!
//! The engine only emits `tracing` events. With the `logging` feature,
//! [`init_logging`] installs a formatting subscriber filtered by `RUST_LOG`.

/// Install a global `tracing` subscriber honoring `RUST_LOG` (default `info`)
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    tracing::debug!("tidewire logging initialized");
    Ok(())
}

/// Without the `logging` feature the application owns subscriber setup
#[cfg(not(feature = "logging"))]
pub fn init_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing::trace!("tidewire built without the logging feature; no subscriber installed");
    Ok(())
}

//! Tracing subscriber setup for the node binary.

use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSettings;

/// Installs the global subscriber. `RUST_LOG` wins over `settings.level`;
/// `force_json` overrides `settings.json`.
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init(
    settings: &LoggingSettings,
    force_json: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))?;
    let registry = tracing_subscriber::registry().with(filter);

    if force_json || settings.json {
        registry
            .with(fmt::layer().json().with_thread_ids(true).with_target(true))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_thread_ids(true).with_target(false))
            .try_init()?;
    }

    info!(level = %settings.level, "logging initialized");
    Ok(())
}

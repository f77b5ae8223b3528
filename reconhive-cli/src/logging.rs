//! Tracing subscriber setup.
//!
//! Logs go to stderr so `--output json` keeps stdout machine-readable.
//! `RUST_LOG` wins over the configured level.

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log formats accepted by [`init_tracing`].
pub const LOG_FORMATS: &[&str] = &["json", "pretty"];

/// Installs the global subscriber. Call once, before any tracing macro.
///
/// * `"json"` - one JSON object per line
/// * `"pretty"` - human-readable, colored
pub fn init_tracing(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter = build_filter(log_level);

    match log_format {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize JSON tracing subscriber: {}", e))?,
        "pretty" => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize pretty tracing subscriber: {}", e))?,
        other => {
            return Err(anyhow::anyhow!(
                "unknown log format '{}', expected one of {:?}",
                other,
                LOG_FORMATS
            ));
        }
    }

    Ok(())
}

fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

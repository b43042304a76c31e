//! Initializes the process-wide `tracing` subscriber.
//!
//! Plain-text, span-id-tagged output via [`crate::log_format::TextWithSpanIds`],
//! level controlled by `RUST_LOG` (falling back to `info`, or `debug` under
//! `--verbose`).

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::log_format::TextWithSpanIds;

pub fn init(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().event_format(TextWithSpanIds::new()))
        .with(filter)
        .try_init()?;
    Ok(())
}

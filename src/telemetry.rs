//! Logging bootstrap.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialise tracing. `RUST_LOG` wins when set; otherwise `VERBOSE=true`
/// selects debug and everything else runs at info. When `LOG_FILE` names a
/// file it is created under `./logs/` and output goes there instead of
/// stderr.
pub fn init() -> Result<()> {
    let default_level = if std::env::var("VERBOSE").as_deref() == Ok("true") {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match std::env::var("LOG_FILE").ok().filter(|name| !name.is_empty()) {
        Some(name) => {
            let dir = Path::new("./logs");
            std::fs::create_dir_all(dir).context("failed to create ./logs")?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))
                .context("failed to open log file")?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .try_init()
                .context("failed to initialise tracing subscriber")?;
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
        }
    }
    Ok(())
}

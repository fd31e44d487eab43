//! tracing subscriber setup.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// With `log_file` set (the dashboard owns the terminal) events are appended
/// there without ANSI colours; otherwise they go to stderr.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default = match (verbose, log_file.is_some()) {
        (true, _) => "chunkscan=debug",
        (false, true) => "chunkscan=info",
        (false, false) => "chunkscan=warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()
                .context("install tracing subscriber")?;
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .try_init()
                .context("install tracing subscriber")?;
        }
    }
    Ok(())
}

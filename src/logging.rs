//! Subscriber setup for the binary.
//!
//! `RUST_LOG` wins over the configured filter. Output goes to stderr so
//! `run --json` keeps stdout clean.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSettings;

/// Install the global subscriber. Later calls are ignored.
pub fn init(settings: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.filter));

    let json = settings
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text = (!settings.json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init();
}

use tracing_subscriber::{EnvFilter, Registry, prelude::*};

use crate::config::LogFormat;

/// Initialize tracing
///
/// Filtering follows `RUST_LOG` and falls back to `info`.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_default();

    let collector = Registry::default().with(filter);
    let result = match format {
        LogFormat::Json => collector
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
        LogFormat::Text => collector
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("tracing already initialized: {e}");
    }
}

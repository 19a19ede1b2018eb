use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the process-wide subscriber. Human-readable output by default,
/// JSON when `RUST_LOG_FORMAT=json`. Filtering follows `RUST_LOG`, with
/// `info` as the floor.
pub fn init_tracing() {
    let use_json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    let filter = EnvFilter::from_default_env().add_directive(Level::INFO.into());

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().flatten_event(true).with_current_span(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

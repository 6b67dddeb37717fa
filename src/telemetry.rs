//! Telemetry initialization.
//!
//! Controlled by `CONVOY_LOG_FORMAT`:
//! - unset or `"text"` → human-readable output to stderr
//! - `"json"` → JSON events to stderr
//! - `"off"` → no subscriber installed
//!
//! Filtering uses the standard `RUST_LOG` env filter (default `info`).

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Safe to call once from
/// `main()`; library consumers install their own subscriber instead.
pub fn init() {
    let format = std::env::var("CONVOY_LOG_FORMAT").unwrap_or_default();
    if format == "off" {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    // try_init: a second call (tests, embedding) is a no-op, not a panic.
    if format == "json" {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

//! Development-time tracing.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted.
//!
//! - **Lifecycle events (`sink`)**: Typed events pushed to observers (the
//!   dashboard, the CLI summary). Always emitted, unaffected by `RUST_LOG`.
//!   `TracingSink` mirrors them into this subscriber.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, falling back to `default_directive` when it is unset
/// or unparsable. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=gatepass=debug gatepass run --username operator
/// ```
pub fn init_with(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

/// CLI default: warnings only.
pub fn init() {
    init_with("warn");
}

//! Process-wide log initialization.
//!
//! Emits single-line JSON records on stderr with thread ids, suitable for
//! Loki-style collectors. The `spec` log field `source` is carried as the
//! tracing target (`target: "epoll"`, `"server"`, `"security"`, ...);
//! `x_request_id` travels as a structured field on the events that have one.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global JSON subscriber. Honors `RUST_LOG`; defaults to
/// `info`. Safe to call more than once (later calls are no-ops), which
/// keeps integration tests that each boot a server from panicking.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_ids(true)
        .with_target(true)
        .try_init();
}

//! Tracing subscriber initialization.

use tracing_subscriber::EnvFilter;

/// JSON logs with timestamps, filtered by `RUST_LOG` or `default_filter`.
///
/// Logs go to stderr so stdout stays free for command output.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

//! Process-wide logging setup shared by the binaries.

/// Initialize tracing with the default `info` filter.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init("info");
}

/// Like [`init`], with a fallback filter used when `RUST_LOG` is unset.
pub fn init_with_default(default_filter: &str) {
    tracing::init(default_filter);
}

/// Subscriber configuration (filters, layers).
pub mod tracing;

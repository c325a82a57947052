//! Tracing and logging setup shared by every process that embeds the pipeline.

/// Initialize process-wide logging at `info` unless `RUST_LOG` says otherwise.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init("info");
}

/// Initialize process-wide logging with a configured default level.
pub fn init_with_level(default_level: &str) {
    tracing::init(default_level);
}

/// Tracing configuration (filters, layers).
pub mod tracing;

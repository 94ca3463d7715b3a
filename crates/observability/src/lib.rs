//! Tracing/logging setup shared by the pipeline binaries.

pub mod tracing;

pub use crate::tracing::{LogFormat, LogOptions, ParseLogFormatError};

/// Initialize process-wide logging with defaults (JSON, `info`, overridable via `RUST_LOG`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&LogOptions::default());
}

/// Initialize process-wide logging with explicit options.
pub fn init_with(options: &LogOptions) {
    tracing::init(options);
}

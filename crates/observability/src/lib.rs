//! Process-wide tracing setup shared by the engine's binaries.

/// Initialize tracing with the format named by `LARDER_LOG_FORMAT`
/// (JSON when unset or unrecognized).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use tracing::{LOG_FORMAT_VAR, LogFormat, UnknownLogFormat, init_with};

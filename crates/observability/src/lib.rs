//! Process-wide tracing setup shared by the order engine binaries.

/// Subscriber configuration (filters, output format).
pub mod subscriber;

pub use subscriber::LogFormat;

/// Initialize tracing for the process.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init();
}

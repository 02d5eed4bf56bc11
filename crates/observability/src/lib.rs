//! Process-wide tracing setup shared by every binary and test harness.

pub mod subscriber;

pub use subscriber::{LogFormat, SubscriberConfig};

/// Initialize tracing with JSON output and `RUST_LOG` filtering (default `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    subscriber::init(SubscriberConfig::from_env());
}

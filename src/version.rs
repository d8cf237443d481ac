//! Relay version.

/// The version reported by `GET /version` and the CLI.
pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

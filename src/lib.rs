/// pgbridge - a PostgreSQL wire-protocol gateway for an embedded query engine
///
/// This is the root crate that provides workspace-level documentation.
/// Actual implementation is in the subcrates:
/// - `pgbridge-core`: The embedded-engine boundary and backend error model
/// - `pgbridge-gateway`: The wire-protocol gateway server

/// This module is intentionally empty as the actual implementation
/// is in the subcrates.
/// Returns the version of the package.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

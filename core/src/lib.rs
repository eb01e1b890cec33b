//! # pgbridge Core
//!
//! Shared types for the pgbridge gateway: the embedded-engine boundary and
//! the backend error model. The gateway crate builds the wire protocol on
//! top of these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod error;

/// Re-export common types for ease of use
pub use engine::{EngineResponse, ProtocolEngine};
pub use error::{BackendError, Severity};

/// Version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

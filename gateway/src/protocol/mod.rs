//! PostgreSQL wire protocol implementation
//!
//! This module provides decoding and encoding of PostgreSQL wire protocol
//! messages, the per-connection state machine, and the authentication
//! flows.

/// Wire primitive reader/writer over message buffers
pub mod buffer;

/// Framing codec between raw bytes and typed messages
pub mod codec;

/// Message types for the PostgreSQL wire protocol
pub mod message;

/// Authentication flows
pub mod auth;

/// SCRAM-SHA-256 primitives
pub mod scram;

/// Connection state machine for client connections
pub mod connection;

// Re-export common types
pub use self::auth::{AuthFlow, AuthOptions, AuthOutcome};
pub use self::codec::MessageCodec;
pub use self::connection::{ConnectionOptions, HookOutcome, MessageHook, Phase, SessionInfo};
pub use self::message::{
    AuthenticationRequest, BackendMessage, Frame, FrontendMessage, TransactionStatus,
};

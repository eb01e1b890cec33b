//! PostgreSQL Wire Protocol Gateway
//!
//! This crate provides a TCP-facing server that speaks the PostgreSQL
//! frontend/backend protocol (v3.0) and bridges it to an embedded,
//! in-process query engine. The engine is injected behind the
//! [`pgbridge_core::ProtocolEngine`] trait; the gateway handles framing,
//! SSL negotiation, authentication, and the steady-state message relay.

// Error types and result
pub mod error;
pub use error::{GatewayError, Result};

// Configuration
pub mod config;
pub use config::GatewayConfig;

// Protocol-related modules
pub mod protocol;
pub use protocol::{AuthOptions, BackendMessage, FrontendMessage, MessageHook, SessionInfo};

// In-memory transport for tests and embedding
pub mod duplex;
pub use duplex::{DuplexStream, VirtualConnector, VirtualServer};

// TLS upgrade material
pub mod tls;
pub use tls::{TlsPaths, TlsSettings};

// Server implementation
pub mod server;
pub use server::BridgeServer;

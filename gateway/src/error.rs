//! Error types for the gateway
//!
//! This module provides error types for the PostgreSQL wire protocol
//! gateway.

use pgbridge_core::error::{sqlstate, BackendError};
use std::io;
use std::net::AddrParseError;
use thiserror::Error;

/// Result type for the gateway
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error type for the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Address parsing error
    #[error("Address parsing error: {0}")]
    AddrParse(#[from] AddrParseError),

    /// PostgreSQL protocol error
    #[error("PostgreSQL protocol error: {0}")]
    Protocol(String),

    /// Not enough bytes buffered to complete the operation.
    ///
    /// Recoverable: the caller should await more input rather than
    /// aborting the connection.
    #[error("Incomplete message")]
    Incomplete,

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Structured backend error
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Connection closed by the peer
    #[error("Connection closed")]
    ConnectionClosed,
}

impl GatewayError {
    /// Convert a gateway error to the backend error reported on the wire
    pub fn to_backend_error(&self) -> BackendError {
        match self {
            GatewayError::Auth(msg) => {
                BackendError::fatal(sqlstate::INVALID_AUTHORIZATION, msg.clone())
            }
            GatewayError::Protocol(msg) => {
                BackendError::fatal(sqlstate::PROTOCOL_VIOLATION, msg.clone())
            }
            GatewayError::Backend(err) => err.clone(),
            other => BackendError::error(
                sqlstate::INTERNAL_ERROR,
                format!("Internal error: {}", other),
            ),
        }
    }
}

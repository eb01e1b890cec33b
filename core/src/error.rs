//! Backend error model
//!
//! This module provides the structured error raised by the embedded engine
//! and by protocol handling, carrying the fields of a PostgreSQL
//! ErrorResponse message.

use std::fmt;
use thiserror::Error;

/// Severity of a backend error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Recoverable error; the connection stays open
    Error,

    /// Fatal error; the connection is closed after reporting
    Fatal,

    /// Unrecoverable server error
    Panic,
}

impl Severity {
    /// Wire representation of the severity
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
            Severity::Panic => "PANIC",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured backend error
///
/// Raised by the embedded engine or by protocol handling, and translated
/// 1:1 into an ErrorResponse wire message by the gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{severity}: {code}: {message}")]
pub struct BackendError {
    /// Error severity
    pub severity: Severity,

    /// Five-character SQLSTATE code
    pub code: String,

    /// Primary human-readable message
    pub message: String,

    /// Optional detail message
    pub detail: Option<String>,

    /// Optional hint message
    pub hint: Option<String>,

    /// Optional error position (1-based character index into the query)
    pub position: Option<u32>,
}

impl BackendError {
    /// Create a recoverable error with the given SQLSTATE code
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, message)
    }

    /// Create a fatal error with the given SQLSTATE code
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Fatal, code, message)
    }

    /// Create an error with an explicit severity
    pub fn new(severity: Severity, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
        }
    }

    /// Attach a detail message
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach a hint message
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Whether the error is in the invalid-authorization SQLSTATE class (28)
    pub fn is_auth_failure(&self) -> bool {
        self.code.starts_with("28")
    }
}

/// Common SQLSTATE codes used by the gateway
pub mod sqlstate {
    /// connection_exception
    pub const CONNECTION_EXCEPTION: &str = "08000";
    /// protocol_violation
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    /// invalid_authorization_specification
    pub const INVALID_AUTHORIZATION: &str = "28000";
    /// invalid_password
    pub const INVALID_PASSWORD: &str = "28P01";
    /// feature_not_supported
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
    /// internal_error
    pub const INTERNAL_ERROR: &str = "XX000";
}

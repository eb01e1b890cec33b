//! Configuration for the gateway server
//!
//! This module provides configuration options for the PostgreSQL wire
//! protocol gateway.

use crate::error::{GatewayError, Result};
use crate::protocol::auth::AuthOptions;
use crate::tls::TlsPaths;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listening address for the gateway
    pub listen_addr: SocketAddr,

    /// `server_version` parameter reported to clients after authentication
    pub server_version: String,

    /// Additional ParameterStatus values reported after authentication
    pub parameters: Vec<(String, String)>,

    /// Authentication configuration
    pub auth: AuthOptions,

    /// TLS certificate material; `None` declines SSLRequest probes
    pub tls: Option<TlsPaths>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5432".parse().unwrap(),
            server_version: "17.4 (pgbridge 0.1)".to_string(),
            parameters: vec![
                ("client_encoding".to_string(), "UTF8".to_string()),
                ("DateStyle".to_string(), "ISO, MDY".to_string()),
                ("integer_datetimes".to_string(), "on".to_string()),
            ],
            auth: AuthOptions::Trust,
            tls: None,
        }
    }
}

impl GatewayConfig {
    /// Create a new gateway configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            GatewayError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Create a configuration for testing
    pub fn for_testing() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".parse().unwrap(), // Random port
            ..Default::default()
        }
    }
}

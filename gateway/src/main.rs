use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use log::info;
use pgbridge_core::error::sqlstate;
use pgbridge_core::{BackendError, EngineResponse, ProtocolEngine};
use pgbridge_gateway::config::GatewayConfig;
use pgbridge_gateway::protocol::scram::DEFAULT_ITERATIONS;
use pgbridge_gateway::server::BridgeServer;
use pgbridge_gateway::tls::TlsPaths;
use pgbridge_gateway::AuthOptions;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "PostgreSQL wire protocol gateway for an embedded engine")]
struct Args {
    /// Config file path
    #[clap(short, long, env = "PGBRIDGE_CONFIG")]
    config: Option<String>,

    /// Address to listen on
    #[clap(short, long, env = "PGBRIDGE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Authentication method (trust, password, md5, scram-sha-256, cert)
    #[clap(long, env = "PGBRIDGE_AUTH_METHOD")]
    auth_method: Option<String>,

    /// Username accepted by the password-based auth methods
    #[clap(long, env = "PGBRIDGE_USER")]
    user: Option<String>,

    /// Password for --user
    #[clap(long, env = "PGBRIDGE_PASSWORD")]
    password: Option<String>,

    /// Server version reported to clients
    #[clap(long, env = "PGBRIDGE_SERVER_VERSION")]
    server_version: Option<String>,

    /// TLS certificate file (PEM)
    #[clap(long, env = "PGBRIDGE_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM)
    #[clap(long, env = "PGBRIDGE_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// CA bundle trusted for client certificates (PEM)
    #[clap(long, env = "PGBRIDGE_TLS_CA")]
    tls_ca: Option<PathBuf>,
}

/// Engine stub for running the gateway standalone.
///
/// Real deployments embed the gateway as a library and inject their
/// engine; this one accepts connections and reports that no engine is
/// attached.
struct UnconfiguredEngine;

#[async_trait]
impl ProtocolEngine for UnconfiguredEngine {
    async fn ready(&self) -> std::result::Result<(), BackendError> {
        Ok(())
    }

    async fn execute(
        &self,
        message: Bytes,
    ) -> std::result::Result<Vec<EngineResponse>, BackendError> {
        if message.first() == Some(&b'X') {
            return Ok(Vec::new());
        }
        Err(BackendError::error(
            sqlstate::FEATURE_NOT_SUPPORTED,
            "no query engine is attached to this gateway",
        ))
    }
}

fn auth_from_args(
    method: &str,
    user: Option<String>,
    password: Option<String>,
) -> Result<AuthOptions> {
    let users: HashMap<String, String> = match (user, password) {
        (Some(user), Some(password)) => HashMap::from([(user, password)]),
        _ => HashMap::new(),
    };

    match method {
        "trust" => Ok(AuthOptions::Trust),
        "password" => Ok(AuthOptions::Password { users }),
        "md5" => Ok(AuthOptions::Md5 { users }),
        "scram-sha-256" => Ok(AuthOptions::ScramSha256 {
            users,
            iterations: DEFAULT_ITERATIONS,
        }),
        "cert" => Ok(AuthOptions::Cert),
        other => bail!("Unknown authentication method: {}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration
    let mut config = GatewayConfig::new();

    if let Some(config_path) = args.config {
        config = GatewayConfig::from_file(&config_path)?;
    }

    // Override config with command-line arguments
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(server_version) = args.server_version {
        config.server_version = server_version;
    }
    if let Some(method) = args.auth_method {
        config.auth = auth_from_args(&method, args.user, args.password)?;
    }
    if let (Some(cert_file), Some(key_file)) = (args.tls_cert, args.tls_key) {
        config.tls = Some(TlsPaths {
            cert_file,
            key_file,
            ca_file: args.tls_ca,
        });
    }

    let listen_addr = config.listen_addr;

    // Create the bridge server
    let server = BridgeServer::new(config, Arc::new(UnconfiguredEngine))?;
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    info!("Starting PostgreSQL wire protocol gateway on {}", listen_addr);

    // Serve until Ctrl+C
    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}

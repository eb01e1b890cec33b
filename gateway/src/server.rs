//! Bridge server implementation
//!
//! The concrete server that listens for connections, wires each accepted
//! connection to the embedded engine through the message hook, and
//! translates engine responses and errors back to wire format. The engine
//! is constructor-injected and shared; one tokio task serves each
//! connection.

use crate::config::GatewayConfig;
use crate::duplex::VirtualServer;
use crate::error::{GatewayError, Result};
use crate::protocol::connection::{
    self, ConnectionOptions, HookOutcome, MessageHook, SessionInfo,
};
use crate::protocol::message::{backend_code, frontend_code};
use crate::tls::TlsSettings;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use pgbridge_core::{BackendError, EngineResponse, ProtocolEngine};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

/// Gateway server bridging wire-protocol clients to the embedded engine
pub struct BridgeServer<E> {
    engine: Arc<E>,
    options: Arc<ConnectionOptions>,
}

impl<E> BridgeServer<E>
where
    E: ProtocolEngine + 'static,
{
    /// Create a bridge server for the given engine
    pub fn new(config: GatewayConfig, engine: Arc<E>) -> Result<Self> {
        let tls = match &config.tls {
            Some(paths) => Some(TlsSettings::load(
                paths,
                config.auth.requires_client_cert(),
            )?),
            None if config.auth.requires_tls() => {
                return Err(GatewayError::Config(format!(
                    "auth method '{}' requires TLS certificate material",
                    config.auth
                )));
            }
            None => None,
        };

        let options = Arc::new(ConnectionOptions {
            auth: config.auth,
            tls,
            server_version: config.server_version,
            parameters: config.parameters,
        });

        Ok(Self { engine, options })
    }

    /// Serve connections from a TCP listener until an accept error
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.await_engine().await?;
        info!("gateway listening on {}", listener.local_addr()?);

        loop {
            let (socket, addr) = listener.accept().await?;
            socket.set_nodelay(true)?;
            debug!("new connection from {}", addr);
            self.spawn_connection(socket);
        }
    }

    /// Serve connections from an in-memory virtual listener
    ///
    /// Returns once every connector handle has been dropped.
    pub async fn serve_virtual(&self, mut listener: VirtualServer) -> Result<()> {
        self.await_engine().await?;

        while let Some(stream) = listener.accept().await {
            debug!("new virtual connection");
            self.spawn_connection(stream);
        }
        Ok(())
    }

    async fn await_engine(&self) -> Result<()> {
        self.engine.ready().await?;
        Ok(())
    }

    fn spawn_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let options = self.options.clone();
        let hook: Arc<dyn MessageHook> = Arc::new(EngineHook {
            engine: self.engine.clone(),
            filter: Mutex::new(ResponseFilter::new()),
        });

        tokio::spawn(async move {
            match connection::run(stream, options, hook).await {
                Ok(()) => debug!("connection closed"),
                // Transport teardown is routine, not a server fault
                Err(GatewayError::Io(err)) => debug!("connection transport error: {}", err),
                Err(err) => warn!("connection error: {}", err),
            }
        });
    }
}

/// Message hook forwarding raw frames to the engine
struct EngineHook<E> {
    engine: Arc<E>,
    filter: Mutex<ResponseFilter>,
}

#[async_trait]
impl<E> MessageHook for EngineHook<E>
where
    E: ProtocolEngine,
{
    async fn on_message(
        &self,
        raw: &Bytes,
        session: &SessionInfo,
    ) -> std::result::Result<HookOutcome, BackendError> {
        if !session.is_authenticated {
            // Unreachable in the documented state machine: authentication
            // strictly precedes the ready phase. See DESIGN.md.
            warn!("steady-state message from unauthenticated session");
            return Ok(HookOutcome::NotHandled);
        }

        let tag = raw.first().copied().unwrap_or(0);
        let responses = self.engine.execute(raw.clone()).await?;

        let mut filter = self.filter.lock().unwrap();
        filter.note_frontend(tag);
        Ok(HookOutcome::Handled(filter.apply(responses)))
    }
}

/// Extended-query response hygiene
///
/// Parse/Bind/Close frames enter an extended-query pipeline and Sync
/// leaves it. While inside one, ReadyForQuery frames the engine emits
/// after each individual message are dropped (the client expects exactly
/// one, after Sync), and once the engine has reported an error every
/// further frame is dropped until the next Sync.
#[derive(Debug)]
struct ResponseFilter {
    in_extended_query: bool,
    errored: bool,
}

impl ResponseFilter {
    fn new() -> Self {
        Self {
            in_extended_query: false,
            errored: false,
        }
    }

    fn note_frontend(&mut self, tag: u8) {
        match tag {
            frontend_code::PARSE | frontend_code::BIND | frontend_code::CLOSE => {
                self.in_extended_query = true;
            }
            frontend_code::SYNC => {
                self.in_extended_query = false;
                self.errored = false;
            }
            _ => {}
        }
    }

    fn apply(&mut self, responses: Vec<EngineResponse>) -> Vec<Bytes> {
        let mut out = Vec::with_capacity(responses.len());
        for response in responses {
            if self.errored {
                continue;
            }
            if self.in_extended_query {
                if response.tag == backend_code::ERROR_RESPONSE {
                    self.errored = true;
                } else if response.tag == backend_code::READY_FOR_QUERY {
                    continue;
                }
            }
            out.push(response.data);
        }
        out
    }
}

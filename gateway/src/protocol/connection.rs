//! Connection state machine for client connections
//!
//! Owns one client connection end-to-end: startup, optional TLS upgrade,
//! authentication, and the steady-state message relay. Messages from a
//! single connection are processed strictly in arrival order and the
//! message hook is never invoked concurrently for the same connection.

use crate::error::{GatewayError, Result};
use crate::protocol::auth::{create_auth_flow, AuthOptions, AuthOutcome};
use crate::protocol::codec::MessageCodec;
use crate::protocol::message::{
    AuthenticationRequest, BackendMessage, Frame, FrontendMessage, TransactionStatus,
};
use crate::tls::{peer_identity, PeerIdentity, TlsSettings};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use pgbridge_core::error::{sqlstate, BackendError};
use rand::{thread_rng, Rng};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, FramedParts};

/// Connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Awaiting the first (untagged) message
    AwaitingStartup,

    /// Driving the configured auth flow
    Authenticating,

    /// Steady-state message relay
    Ready,

    /// Connection finished
    Closed,
}

/// Connection state exposed to the message hook
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Startup `user` parameter
    pub username: String,

    /// Startup `database` parameter
    pub database: Option<String>,

    /// Negotiated authentication method name
    pub auth_method: String,

    /// Whether authentication has completed
    pub is_authenticated: bool,

    /// Whether the transport was upgraded to TLS
    pub is_secure: bool,
}

/// Result of handing one steady-state message to the hook
#[derive(Debug)]
pub enum HookOutcome {
    /// The hook produced the reply; each buffer is written verbatim.
    /// An empty list is still handled: the message needed no reply.
    Handled(Vec<Bytes>),

    /// The hook declined; the connection takes its default action
    NotHandled,
}

/// Steady-state message handler, supplied by the bridge server
#[async_trait]
pub trait MessageHook: Send + Sync {
    /// Handle one raw frontend message.
    ///
    /// A returned [`BackendError`] is reported to the client as an
    /// ErrorResponse followed by ReadyForQuery; the connection stays open.
    async fn on_message(
        &self,
        raw: &Bytes,
        session: &SessionInfo,
    ) -> std::result::Result<HookOutcome, BackendError>;
}

/// Server-wide options shared by every connection
pub struct ConnectionOptions {
    /// Authentication method and its secrets
    pub auth: AuthOptions,

    /// TLS material; `None` declines SSLRequest probes
    pub tls: Option<TlsSettings>,

    /// Value of the `server_version` parameter sent after authentication
    pub server_version: String,

    /// Additional ParameterStatus values sent after authentication
    pub parameters: Vec<(String, String)>,
}

/// Drive one client connection to completion.
///
/// Handles the SSLRequest probe on the raw transport and then runs the
/// session, either on the original stream or on the TLS-upgraded one.
pub async fn run<S>(
    stream: S,
    options: Arc<ConnectionOptions>,
    hook: Arc<dyn MessageHook>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(stream, MessageCodec::new());

    loop {
        let Some(frame) = framed.next().await.transpose()? else {
            // Closed before startup; nothing to tear down
            return Ok(());
        };

        match frame.message {
            FrontendMessage::SslRequest => match &options.tls {
                Some(tls) => {
                    framed.send(BackendMessage::SslResponse(true)).await?;

                    let parts = framed.into_parts();
                    let tls_stream = tls
                        .acceptor()
                        .accept(parts.io)
                        .await
                        .map_err(|e| GatewayError::Tls(format!("Handshake failed: {}", e)))?;
                    let peer = peer_identity(&tls_stream);

                    // Carry over bytes the client may have pipelined
                    // behind the SSLRequest
                    let mut secured =
                        FramedParts::new::<BackendMessage>(tls_stream, MessageCodec::new());
                    secured.read_buf = parts.read_buf;

                    let connection =
                        Connection::new(Framed::from_parts(secured), options, hook, true, peer);
                    return connection.run().await;
                }
                None => {
                    // Decline the upgrade and re-enter startup on the
                    // same stream
                    framed.send(BackendMessage::SslResponse(false)).await?;
                }
            },
            _ => {
                let connection = Connection::new(framed, options, hook, false, None);
                return connection.run_from(frame).await;
            }
        }
    }
}

struct Connection<S> {
    framed: Framed<S, MessageCodec>,
    options: Arc<ConnectionOptions>,
    hook: Arc<dyn MessageHook>,
    session: SessionInfo,
    peer: Option<PeerIdentity>,
    phase: Phase,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(
        framed: Framed<S, MessageCodec>,
        options: Arc<ConnectionOptions>,
        hook: Arc<dyn MessageHook>,
        is_secure: bool,
        peer: Option<PeerIdentity>,
    ) -> Self {
        let session = SessionInfo {
            username: String::new(),
            database: None,
            auth_method: options.auth.to_string(),
            is_authenticated: false,
            is_secure,
        };

        Self {
            framed,
            options,
            hook,
            session,
            peer,
            phase: Phase::AwaitingStartup,
        }
    }

    async fn run(mut self) -> Result<()> {
        let Some(frame) = self.framed.next().await.transpose()? else {
            return Ok(());
        };
        self.run_from(frame).await
    }

    async fn run_from(mut self, first: Frame) -> Result<()> {
        if !self.handle_startup(first).await? {
            self.phase = Phase::Closed;
            return Ok(());
        }

        if !self.authenticate().await? {
            self.phase = Phase::Closed;
            return Ok(());
        }

        self.complete_authentication().await?;
        self.serve_ready().await
    }

    /// Validate the startup message and record client parameters.
    ///
    /// Returns `Ok(false)` when the connection was refused with a reply;
    /// framing violations are errors and close without one.
    async fn handle_startup(&mut self, frame: Frame) -> Result<bool> {
        match frame.message {
            FrontendMessage::Startup {
                version_major,
                version_minor,
                parameters,
            } => {
                if version_major != 3 || version_minor != 0 {
                    self.send(BackendMessage::ErrorResponse(BackendError::fatal(
                        sqlstate::CONNECTION_EXCEPTION,
                        format!(
                            "Unsupported protocol version {}.{}",
                            version_major, version_minor
                        ),
                    )))
                    .await?;
                    return Ok(false);
                }

                let Some(user) = parameters.get("user") else {
                    self.send(BackendMessage::ErrorResponse(BackendError::fatal(
                        sqlstate::CONNECTION_EXCEPTION,
                        "user is required",
                    )))
                    .await?;
                    return Ok(false);
                };

                if self.options.auth.requires_tls() && !self.session.is_secure {
                    self.send(BackendMessage::ErrorResponse(BackendError::fatal(
                        sqlstate::CONNECTION_EXCEPTION,
                        "SSL connection is required",
                    )))
                    .await?;
                    return Ok(false);
                }

                debug!(
                    "startup: user={} database={:?}",
                    user,
                    parameters.get("database")
                );
                self.session.username = user.clone();
                self.session.database = parameters.get("database").cloned();
                self.phase = Phase::Authenticating;
                Ok(true)
            }
            FrontendMessage::CancelRequest { process_id, .. } => {
                // Out-of-band cancellation is not supported by the
                // single-engine model; the probe connection just closes
                debug!("ignoring cancel request for backend {}", process_id);
                Ok(false)
            }
            FrontendMessage::SslRequest => Err(GatewayError::Protocol(
                "Duplicate SSLRequest".to_string(),
            )),
            other => Err(GatewayError::Protocol(format!(
                "Expected startup message, got {:?}",
                other
            ))),
        }
    }

    /// Drive the configured auth flow to completion.
    ///
    /// Returns `Ok(false)` when authentication failed (reported) or the
    /// client went away.
    async fn authenticate(&mut self) -> Result<bool> {
        let mut flow = create_auth_flow(
            &self.options.auth,
            &self.session.username,
            self.peer.as_ref(),
        );

        match flow.begin() {
            AuthOutcome::Complete(messages) => {
                self.send_all(messages).await?;
                return Ok(true);
            }
            AuthOutcome::Continue(messages) => self.send_all(messages).await?,
            AuthOutcome::Fail(error) => {
                warn!(
                    "authentication failed for {:?}: {}",
                    self.session.username, error.message
                );
                self.send(BackendMessage::ErrorResponse(error)).await?;
                return Ok(false);
            }
        }

        loop {
            let Some(frame) = self.framed.next().await.transpose()? else {
                // Client abandoned the handshake
                return Ok(false);
            };

            match frame.message {
                FrontendMessage::Password { payload } => match flow.handle_message(&payload) {
                    AuthOutcome::Continue(messages) => self.send_all(messages).await?,
                    AuthOutcome::Complete(messages) => {
                        self.send_all(messages).await?;
                        return Ok(true);
                    }
                    AuthOutcome::Fail(error) => {
                        warn!(
                            "authentication failed for {:?}: {}",
                            self.session.username, error.message
                        );
                        self.send(BackendMessage::ErrorResponse(error)).await?;
                        return Ok(false);
                    }
                },
                FrontendMessage::Terminate => return Ok(false),
                other => {
                    return Err(GatewayError::Protocol(format!(
                        "Unexpected message during authentication: {:?}",
                        other
                    )))
                }
            }
        }
    }

    /// Report success and bring the session to the ready state
    async fn complete_authentication(&mut self) -> Result<()> {
        self.session.is_authenticated = true;

        self.framed
            .feed(BackendMessage::Authentication(AuthenticationRequest::Ok))
            .await?;
        self.framed
            .feed(BackendMessage::ParameterStatus {
                name: "server_version".to_string(),
                value: self.options.server_version.clone(),
            })
            .await?;
        for (name, value) in &self.options.parameters {
            self.framed
                .feed(BackendMessage::ParameterStatus {
                    name: name.clone(),
                    value: value.clone(),
                })
                .await?;
        }

        let (process_id, secret_key) = thread_rng().gen();
        self.framed
            .feed(BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            })
            .await?;

        self.phase = Phase::Ready;
        self.framed
            .feed(BackendMessage::ReadyForQuery(TransactionStatus::Idle))
            .await?;
        self.framed.flush().await?;
        Ok(())
    }

    /// Steady state: relay one message at a time through the hook
    async fn serve_ready(&mut self) -> Result<()> {
        while let Some(frame) = self.framed.next().await.transpose()? {
            let terminating = matches!(frame.message, FrontendMessage::Terminate);

            match self.hook.on_message(&frame.raw, &self.session).await {
                Ok(HookOutcome::Handled(responses)) => {
                    for data in responses {
                        self.framed.feed(BackendMessage::Raw(data)).await?;
                    }
                    self.framed.flush().await?;
                }
                Ok(HookOutcome::NotHandled) => {
                    if !terminating {
                        self.send_all(vec![
                            BackendMessage::ErrorResponse(BackendError::error(
                                sqlstate::FEATURE_NOT_SUPPORTED,
                                unsupported_message(&frame),
                            )),
                            BackendMessage::ReadyForQuery(TransactionStatus::Idle),
                        ])
                        .await?;
                    }
                }
                Err(error) => {
                    // Backend errors keep the connection open: report,
                    // then tell the client it may send the next query
                    self.send_all(vec![
                        BackendMessage::ErrorResponse(error),
                        BackendMessage::ReadyForQuery(TransactionStatus::Idle),
                    ])
                    .await?;
                }
            }

            if terminating {
                break;
            }
        }

        self.phase = Phase::Closed;
        debug!(
            "connection for {:?} closed (phase {:?})",
            self.session.username, self.phase
        );
        Ok(())
    }

    async fn send(&mut self, message: BackendMessage) -> Result<()> {
        self.framed.send(message).await
    }

    async fn send_all(&mut self, messages: Vec<BackendMessage>) -> Result<()> {
        for message in messages {
            self.framed.feed(message).await?;
        }
        self.framed.flush().await?;
        Ok(())
    }
}

fn unsupported_message(frame: &Frame) -> String {
    match frame.tag() {
        Some(tag) => format!("message type '{}' is not supported", tag as char),
        None => "message is not supported".to_string(),
    }
}

//! Embedded engine boundary
//!
//! The gateway consumes the query engine as a black box that accepts raw
//! protocol message buffers and returns raw response buffers. Engines are
//! constructed by the embedding application and injected into the bridge
//! server; the gateway never owns a global engine instance.

use crate::error::BackendError;
use async_trait::async_trait;
use bytes::Bytes;

/// One raw response frame produced by the engine
///
/// `data` is the complete wire frame, starting with the tag byte; `tag`
/// duplicates the leading byte for inspection without touching the buffer.
/// Frames are written back to the client unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResponse {
    /// Backend message type code (first byte of `data`)
    pub tag: u8,

    /// Complete response frame, forwarded verbatim
    pub data: Bytes,
}

impl EngineResponse {
    /// Wrap a complete response frame, reading the tag from its first byte
    pub fn from_frame(data: Bytes) -> Self {
        let tag = data.first().copied().unwrap_or(0);
        Self { tag, data }
    }
}

/// Protocol-message-level query executor
///
/// Implementations must be safe to share behind an `Arc` across connection
/// tasks. The gateway serializes calls per connection (at most one
/// in-flight message per connection) but places no ordering guarantee
/// across connections: an engine that cannot interleave protocol exchanges
/// from multiple connections must serialize `execute` internally or be
/// served by a single connection at a time.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Resolves once the engine is able to accept protocol messages.
    ///
    /// The bridge server awaits this before accepting any connection.
    async fn ready(&self) -> Result<(), BackendError>;

    /// Execute one raw frontend protocol message.
    ///
    /// Returns zero or more raw response frames, or a structured
    /// [`BackendError`] which the gateway reports to the client as an
    /// ErrorResponse. An empty response list means the message needs no
    /// reply (e.g. Terminate).
    async fn execute(&self, message: Bytes) -> Result<Vec<EngineResponse>, BackendError>;
}

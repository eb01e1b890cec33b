//! In-memory duplex streams and the virtual server
//!
//! A linked pair of bidirectional byte streams backed by bounded channels:
//! writes on one end become available, in order, on the paired end. The
//! bounded channel is the backpressure mechanism — a writer suspends at
//! the scheduler (no busy loop) while the paired reader has not consumed
//! prior chunks, and a reader suspends while the channel is empty. The
//! virtual server composes pairs into an accept/connect API so the
//! gateway can be driven entirely in-process, without OS sockets.

use crate::error::{GatewayError, Result};
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Default per-direction capacity, in write chunks
const DEFAULT_CAPACITY: usize = 16;

/// One end of an in-memory bidirectional byte stream
pub struct DuplexStream {
    tx: PollSender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    read_buf: Bytes,
}

/// Create a linked pair of duplex streams
///
/// `capacity` bounds how many write chunks may be in flight per direction
/// before the writer suspends.
pub fn pair(capacity: usize) -> (DuplexStream, DuplexStream) {
    assert!(capacity > 0, "duplex capacity must be at least 1");

    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);

    (
        DuplexStream {
            tx: PollSender::new(a_tx),
            rx: b_rx,
            read_buf: Bytes::new(),
        },
        DuplexStream {
            tx: PollSender::new(b_tx),
            rx: a_rx,
            read_buf: Bytes::new(),
        },
    )
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "peer closed")
}

impl AsyncRead for DuplexStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.read_buf = chunk,
                // Peer write side closed: EOF
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for DuplexStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                if this.tx.send_item(Bytes::copy_from_slice(data)).is_err() {
                    return Poll::Ready(Err(broken_pipe()));
                }
                Poll::Ready(Ok(data.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(broken_pipe())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes are delivered on send; nothing is buffered on this side
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.tx.close();
        Poll::Ready(Ok(()))
    }
}

/// In-memory multi-connection listener
///
/// Each `connect()` creates a fresh stream pair, queues the server-side
/// half for `accept()`, and hands the client-side half to the caller.
#[derive(Debug)]
pub struct VirtualServer {
    incoming_tx: mpsc::UnboundedSender<DuplexStream>,
    incoming_rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl VirtualServer {
    /// Create a virtual server with no pending connections
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            incoming_tx,
            incoming_rx,
        }
    }

    /// A handle clients use to open connections to this server
    pub fn connector(&self) -> VirtualConnector {
        VirtualConnector {
            tx: self.incoming_tx.clone(),
        }
    }

    /// Wait for the next incoming connection
    ///
    /// Returns `None` once every connector handle has been dropped.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.incoming_rx.recv().await
    }
}

impl Default for VirtualServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side handle to a [`VirtualServer`]
#[derive(Debug, Clone)]
pub struct VirtualConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
}

impl VirtualConnector {
    /// Open a new in-memory connection to the server
    pub fn connect(&self) -> Result<DuplexStream> {
        let (client, server) = pair(DEFAULT_CAPACITY);
        self.tx
            .send(server)
            .map_err(|_| GatewayError::ConnectionClosed)?;
        Ok(client)
    }
}

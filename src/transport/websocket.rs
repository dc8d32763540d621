//! WebSocket transport.
//!
//! Full-duplex: every packet travels as one WebSocket message. Binary
//! packets go out as binary messages when the peer supports them,
//! everything else as text.
//!
//! The transport spawns two tasks over the split stream:
//!
//! - **reader**: decodes incoming messages into the inbound queue
//! - **writer**: drains the outbound queue into the sink
//!
//! Either task ending closes the transport; the writer closes the sink
//! on its way out.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::protocol::payload::{self, Frame};
use crate::protocol::Packet;

use super::lifecycle::{DeadlineExpiry, Lifecycle, TransportCore};

// ============================================================================
// WebSocketTransport
// ============================================================================

/// WebSocket transport for one client.
pub struct WebSocketTransport {
    core: TransportCore,
}

impl WebSocketTransport {
    /// Wraps an accepted WebSocket stream and spawns its I/O tasks.
    #[must_use]
    pub fn new<S>(stream: WebSocketStream<S>, supports_binary: bool, capacity: usize) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let core = TransportCore::new(supports_binary, capacity, DeadlineExpiry::Close);
        let (sink, stream) = stream.split();

        tokio::spawn(read_loop(core.clone(), stream));
        tokio::spawn(write_loop(core.clone(), sink));

        Arc::new(Self { core })
    }

    /// Returns `true` if the peer accepts raw binary.
    #[inline]
    #[must_use]
    pub fn supports_binary(&self) -> bool {
        self.core.supports_binary()
    }

    /// Returns the lifecycle events.
    #[inline]
    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        self.core.lifecycle()
    }

    /// Enqueues a packet for the writer.
    pub async fn send(&self, packet: Packet, data: Bytes, force: bool) -> bool {
        self.core.send(packet, data, force).await
    }

    /// Waits for the next packet from the client.
    ///
    /// # Errors
    ///
    /// See [`crate::transport::Transport::receive`].
    pub async fn receive(&self) -> Result<Frame> {
        self.core.receive().await
    }

    /// Retires the transport.
    pub fn discard(&self) {
        self.core.lifecycle().discard();
    }

    /// Closes the transport; the writer flushes and closes the socket.
    pub fn close(&self) {
        let lifecycle = self.core.lifecycle();
        lifecycle.closing();
        if lifecycle.close() {
            debug!("WebSocket transport closed");
        }
    }

    /// Closes the transport.
    pub fn force_close(&self) {
        self.close();
    }

    /// Arms or rearms the inactivity deadline.
    pub fn set_read_deadline(&self, deadline: Instant) {
        self.core.set_read_deadline(deadline);
    }
}

// ============================================================================
// I/O Tasks
// ============================================================================

/// Decodes incoming messages until the socket or the transport closes.
async fn read_loop<S>(core: TransportCore, mut stream: SplitStream<WebSocketStream<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = core.lifecycle().closed() => break,
            message = stream.next() => message,
        };

        let accepted = match message {
            Some(Ok(Message::Text(text))) => ingest(&core, text.as_bytes()).await,

            Some(Ok(Message::Binary(data))) => ingest(&core, &data).await,

            Some(Ok(Message::Close(_))) => {
                debug!("WebSocket closed by remote");
                false
            }

            Some(Err(e)) => {
                warn!(error = %e, "WebSocket error");
                false
            }

            None => {
                debug!("WebSocket stream ended");
                false
            }

            // Ping, Pong and raw frames are handled by tungstenite
            Some(Ok(_)) => true,
        };

        if !accepted {
            break;
        }
    }

    core.lifecycle().close();
    trace!("WebSocket reader terminated");
}

/// Decodes one message and queues it. Returns `false` once closed.
async fn ingest(core: &TransportCore, message: &[u8]) -> bool {
    match payload::decode_packet(message) {
        Ok(frame) => core.push_incoming(frame).await,
        Err(e) => {
            warn!(error = %e, "Dropping malformed WebSocket message");
            true
        }
    }
}

/// Writes queued packets until the transport closes, then closes the sink.
async fn write_loop<S>(core: TransportCore, mut sink: SplitSink<WebSocketStream<S>, Message>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = write_frames(&core, &mut sink).await {
        warn!(error = %e, "Failed to write WebSocket message");
        core.lifecycle().close();
    }

    if let Err(e) = sink.close().await {
        trace!(error = %e, "WebSocket sink already closed");
    }
    trace!("WebSocket writer terminated");
}

/// Drains the outbound queue into the sink until the transport closes.
///
/// # Errors
///
/// Returns [`Error::WebSocket`](crate::Error::WebSocket) if a write fails.
async fn write_frames<S>(
    core: &TransportCore,
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut outgoing = core.outgoing().lock().await;
    let supports_binary = core.supports_binary();

    loop {
        let frame = tokio::select! {
            biased;
            frame = outgoing.recv() => frame,
            _ = core.lifecycle().closed() => None,
        };
        let Some((packet, data)) = frame else {
            return Ok(());
        };

        let encoded = payload::encode_packet(&packet, &data, supports_binary);
        let message = if packet.is_binary && supports_binary {
            Message::Binary(encoded.into())
        } else {
            match String::from_utf8(encoded) {
                Ok(text) => Message::Text(text.into()),
                Err(_) => {
                    warn!(%packet, "Dropping text packet with invalid UTF-8");
                    continue;
                }
            }
        };

        sink.send(message).await?;
    }
}

// ============================================================================
// Tests
// ============================================================================

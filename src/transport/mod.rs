//! Transport layer.
//!
//! A transport carries packets between the server and one client over one
//! channel. The [`Socket`](crate::Socket) above it only ever talks to the
//! [`Transport`] enum, which is what makes the polling → WebSocket swap
//! possible mid-session.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────┐
//!   Socket ────► │  Transport   │
//!                └──────┬───────┘
//!            ┌──────────┴──────────┐
//!   ┌────────▼────────┐   ┌────────▼─────────┐
//!   │ Polling         │   │ WebSocket        │
//!   │ GET/POST slots  │   │ reader + writer  │
//!   └────────┬────────┘   └────────┬─────────┘
//!            └──────────┬──────────┘
//!                ┌──────▼───────┐
//!                │TransportCore │  lifecycle, queues, deadline
//!                └──────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `lifecycle` | Lifecycle events, queues, read deadline |
//! | `polling` | Long-polling (XHR and JSONP) |
//! | `websocket` | WebSocket |

// ============================================================================
// Submodules
// ============================================================================

/// Lifecycle events and the shared transport core.
pub mod lifecycle;

/// Long-polling transport.
pub mod polling;

/// WebSocket transport.
pub mod websocket;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;

use crate::error::Result;
use crate::protocol::{Frame, Packet};

// ============================================================================
// Re-exports
// ============================================================================

pub use lifecycle::{Lifecycle, LifecycleState};
pub use polling::{Polling, PollingOptions};
pub use websocket::WebSocketTransport;

// ============================================================================
// Constants
// ============================================================================

/// Name of the long-polling transport.
pub const POLLING: &str = "polling";

/// Name of the WebSocket transport.
pub const WEBSOCKET: &str = "websocket";

// ============================================================================
// TransportKind
// ============================================================================

/// The transport kinds a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// HTTP long-polling.
    Polling,
    /// WebSocket.
    WebSocket,
}

impl TransportKind {
    /// Returns the transport name as used in the `transport` query parameter.
    #[inline]
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Polling => POLLING,
            Self::WebSocket => WEBSOCKET,
        }
    }

    /// Parses a `transport` query parameter.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            POLLING => Some(Self::Polling),
            WEBSOCKET => Some(Self::WebSocket),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Transport
// ============================================================================

/// A concrete transport, cheap to clone.
#[derive(Clone)]
pub enum Transport {
    /// Long-polling.
    Polling(Arc<Polling>),
    /// WebSocket.
    WebSocket(Arc<WebSocketTransport>),
}

impl Transport {
    /// Returns the transport kind.
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        match self {
            Self::Polling(_) => TransportKind::Polling,
            Self::WebSocket(_) => TransportKind::WebSocket,
        }
    }

    /// Returns the transport name as used in the `transport` query parameter.
    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Returns `true` if the peer accepts raw binary.
    #[must_use]
    pub fn supports_binary(&self) -> bool {
        match self {
            Self::Polling(polling) => polling.supports_binary(),
            Self::WebSocket(websocket) => websocket.supports_binary(),
        }
    }

    /// Returns the lifecycle events.
    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        match self {
            Self::Polling(polling) => polling.lifecycle(),
            Self::WebSocket(websocket) => websocket.lifecycle(),
        }
    }

    /// Returns the current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle().state()
    }

    /// Enqueues an outbound packet.
    ///
    /// Returns `false` if the packet was rejected: the transport is closed,
    /// or closing and `force` is not set.
    pub async fn send(&self, packet: Packet, data: Bytes, force: bool) -> bool {
        match self {
            Self::Polling(polling) => polling.send(packet, data, force).await,
            Self::WebSocket(websocket) => websocket.send(packet, data, force).await,
        }
    }

    /// Waits for the next inbound packet.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelClosed`](crate::Error::ChannelClosed) once the transport is closed
    /// - [`Error::GotClosePacket`](crate::Error::GotClosePacket) if the client sent `Close`
    pub async fn receive(&self) -> Result<Frame> {
        match self {
            Self::Polling(polling) => polling.receive().await,
            Self::WebSocket(websocket) => websocket.receive().await,
        }
    }

    /// Retires the transport after an upgrade.
    pub fn discard(&self) {
        match self {
            Self::Polling(polling) => polling.discard(),
            Self::WebSocket(websocket) => websocket.discard(),
        }
    }

    /// Starts a graceful close.
    pub fn close(&self) {
        match self {
            Self::Polling(polling) => polling.close(),
            Self::WebSocket(websocket) => websocket.close(),
        }
    }

    /// Closes the transport immediately.
    pub fn force_close(&self) {
        match self {
            Self::Polling(polling) => polling.force_close(),
            Self::WebSocket(websocket) => websocket.force_close(),
        }
    }

    /// Arms or rearms the inactivity deadline.
    pub fn set_read_deadline(&self, deadline: Instant) {
        match self {
            Self::Polling(polling) => polling.set_read_deadline(deadline),
            Self::WebSocket(websocket) => websocket.set_read_deadline(deadline),
        }
    }

    /// Returns `true` if both handles refer to the same transport.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Polling(a), Self::Polling(b)) => Arc::ptr_eq(a, b),
            (Self::WebSocket(a), Self::WebSocket(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(TransportKind::from_name("polling"), Some(TransportKind::Polling));
        assert_eq!(TransportKind::from_name("websocket"), Some(TransportKind::WebSocket));
        assert_eq!(TransportKind::from_name("carrier-pigeon"), None);
        assert_eq!(TransportKind::WebSocket.to_string(), "websocket");
    }

    #[tokio::test]
    async fn test_new_polling_transport_is_active() {
        let transport = Transport::Polling(Polling::new(PollingOptions::default()));
        assert_eq!(transport.name(), "polling");
        assert_eq!(transport.kind(), TransportKind::Polling);
        assert_eq!(transport.state(), LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_ptr_eq_distinguishes_instances() {
        let a = Transport::Polling(Polling::new(PollingOptions::default()));
        let b = Transport::Polling(Polling::new(PollingOptions::default()));
        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
    }
}

//! Engine.IO server - long-polling with transparent WebSocket upgrade.
//!
//! This library implements the server side of the Engine.IO protocol:
//! clients connect over HTTP long-polling and are moved to a WebSocket
//! mid-session without losing their session id or in-flight messages.
//!
//! # Architecture
//!
//! ```text
//! HTTP / WS ──► Router ──► SessionRegistry ──► Socket ──► Transport
//!                                                │           │
//!                              message callback ◄┘           └► payload codec
//! ```
//!
//! - **Router** validates the query, creates sessions and routes requests
//! - **Socket** owns the active transport, answers pings, drives upgrades
//! - **Transport** is either long-polling or WebSocket, both built on one
//!   shared lifecycle state machine
//!
//! # Quick Start
//!
//! ```no_run
//! use engineio_server::{Result, Server};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = Server::builder()
//!         .on_message(|socket, data, is_binary| {
//!             let socket = socket.clone();
//!             tokio::spawn(async move {
//!                 socket.send_message(data, is_binary).await;
//!             });
//!         })
//!         .build()?;
//!
//!     let listener = TcpListener::bind("127.0.0.1:3000").await?;
//!     server.serve(listener).await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Session id |
//! | [`protocol`] | Packets and payload framing |
//! | [`server`] | [`Server`], [`Socket`], registry and router |
//! | [`transport`] | Long-polling and WebSocket transports |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Packet model and payload codec.
pub mod protocol;

/// Server, sessions and request routing.
///
/// Use [`Server::builder()`] to create a configured server.
pub mod server;

/// Transport layer.
///
/// Long-polling and WebSocket transports sharing one lifecycle core.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::SessionId;

// Protocol types
pub use protocol::{OpenPacket, Packet, PacketType};

// Server types
pub use server::{
    ErrorCode, ReadyState, Server, ServerBuilder, ServerOptions, SessionRegistry, Socket,
    UpgradeState,
};

// Transport types
pub use transport::{LifecycleState, Transport, TransportKind};

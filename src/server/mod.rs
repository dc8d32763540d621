//! Server: sessions, routing and configuration.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Server`] | Entry point: router, serve, shutdown |
//! | [`ServerBuilder`] | Fluent configuration builder |
//! | [`ServerOptions`] | Protocol options |
//! | [`Socket`] | One client session |
//! | [`SessionRegistry`] | Live sessions by id |
//!
//! # Example
//!
//! ```no_run
//! use engineio_server::{Result, Server};
//! use tokio::net::TcpListener;
//!
//! # async fn example() -> Result<()> {
//! let server = Server::builder()
//!     .on_connection(|socket| println!("connected: {}", socket.id()))
//!     .build()?;
//!
//! let listener = TcpListener::bind("127.0.0.1:3000").await?;
//! server.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder for server configuration.
pub mod builder;

/// Protocol options.
pub mod options;

/// Session registry.
pub mod registry;

/// Request validation and routing.
pub mod router;

/// Per-client session orchestrator.
pub mod socket;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;

use self::router::Engine;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ServerBuilder;
pub use options::ServerOptions;
pub use registry::SessionRegistry;
pub use crate::error::ErrorCode;
pub use socket::{
    CloseHandler, ConnectionHandler, Handlers, MessageHandler, ReadyState, Socket, UpgradeState,
};

// ============================================================================
// Server
// ============================================================================

/// An Engine.IO server.
///
/// Cheap to clone; every clone serves the same sessions.
#[derive(Clone)]
pub struct Server {
    engine: Arc<Engine>,
    shutdown: CancellationToken,
}

impl Server {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub(crate) fn new(options: ServerOptions, handlers: Handlers) -> Self {
        Self {
            engine: Arc::new(Engine {
                options: Arc::new(options),
                handlers,
                registry: Arc::new(SessionRegistry::new()),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns the server options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ServerOptions {
        &self.engine.options
    }

    /// Returns an axum router serving the mount path.
    ///
    /// Merge it into an application router, or use [`Server::serve`].
    #[must_use]
    pub fn router(&self) -> axum::Router {
        router::router(Arc::clone(&self.engine))
    }

    /// Serves the router on a listener until [`Server::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, path = %self.engine.options.path, "Server listening");

        let service = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, service)
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .await?;

        info!("Server stopped");
        Ok(())
    }

    /// Closes every session and stops [`Server::serve`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let sockets = self.engine.registry.drain();
        info!(sessions = sockets.len(), "Server shutting down");

        for socket in sockets {
            socket.close().await;
        }
    }

    /// Looks up a live session.
    #[must_use]
    pub fn socket(&self, sid: &str) -> Option<Socket> {
        self.engine.registry.get(sid)
    }

    /// Returns the number of live sessions.
    #[inline]
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.engine.registry.len()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("path", &self.engine.options.path)
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::extract::Request;
    use axum::http::{Method, StatusCode};
    use futures_util::{SinkExt, StreamExt};
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;
    use tower::ServiceExt;
    use tracing_subscriber::EnvFilter;

    use crate::protocol::{OpenPacket, Packet, PacketType, payload};

    const WAIT: Duration = Duration::from_secs(5);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn echo_server() -> Server {
        Server::builder()
            .on_message(|socket, data, is_binary| {
                let socket = socket.clone();
                tokio::spawn(async move {
                    socket.send_message(data, is_binary).await;
                });
            })
            .build()
            .expect("valid server")
    }

    async fn wait_for_clients(server: &Server, count: usize) {
        timeout(WAIT, async {
            while server.client_count() != count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("client count reached in time");
    }

    #[tokio::test]
    async fn test_polling_handshake_and_shutdown() {
        init_tracing();
        let server = echo_server();

        let request = Request::builder()
            .method(Method::GET)
            .uri("/engine.io/?EIO=3&transport=polling")
            .body(Body::empty())
            .unwrap();
        let response = server.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let frames = payload::decode_frames(&body).unwrap();
        let open: OpenPacket = serde_json::from_slice(&frames[0].1).unwrap();

        let socket = server.socket(&open.sid).expect("registered");
        assert_eq!(socket.ready_state(), ReadyState::Open);
        assert_eq!(server.client_count(), 1);

        server.shutdown().await;
        assert_eq!(server.client_count(), 0);
        assert_eq!(socket.ready_state(), ReadyState::Closing);
    }

    #[tokio::test]
    async fn test_handshake_carries_initial_packet_and_announces_connection() {
        init_tracing();
        let connections = Arc::new(AtomicUsize::new(0));
        let server = Server::builder()
            .queue_capacity(2)
            .initial_packet("hi")
            .on_connection({
                let connections = Arc::clone(&connections);
                move |_: &Socket| {
                    connections.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build()
            .expect("valid server");

        for expected in 1..=2 {
            let request = Request::builder()
                .method(Method::GET)
                .uri("/engine.io/?EIO=3&transport=polling")
                .body(Body::empty())
                .unwrap();
            let response = timeout(WAIT, server.router().oneshot(request))
                .await
                .expect("handshake answered in time")
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let frames = payload::decode_frames(&body).unwrap();
            assert_eq!(frames.len(), 2);
            assert_eq!(frames[0].0, Packet::text(PacketType::Open));
            assert_eq!(frames[1].0, Packet::text(PacketType::Message));
            assert_eq!(&frames[1].1[..], b"hi");
            assert!(body.ends_with(b"3:4hi"));

            assert_eq!(connections.load(Ordering::SeqCst), expected);
        }

        assert_eq!(server.client_count(), 2);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_websocket_session_end_to_end() {
        init_tracing();
        let server = echo_server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let url = format!("ws://127.0.0.1:{port}/engine.io/?EIO=3&transport=websocket");
        let (mut client, _) = timeout(WAIT, connect_async(url)).await.unwrap().unwrap();

        let Some(Ok(Message::Text(handshake))) = timeout(WAIT, client.next()).await.unwrap()
        else {
            panic!("expected handshake");
        };
        assert!(handshake.starts_with('0'));
        let open: OpenPacket = serde_json::from_str(&handshake[1..]).unwrap();
        assert!(open.upgrades.is_empty());

        let socket = server.socket(&open.sid).expect("registered");
        assert!(socket.remote_addr().is_some());

        client.send(Message::Text("4hello".into())).await.unwrap();
        let Some(Ok(Message::Text(echo))) = timeout(WAIT, client.next()).await.unwrap() else {
            panic!("expected echo");
        };
        assert_eq!(echo.as_str(), "4hello");

        client.close(None).await.unwrap();
        wait_for_clients(&server, 0).await;

        server.shutdown().await;
        timeout(WAIT, serving).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_polling_session_upgrades_to_websocket() {
        init_tracing();
        let server = echo_server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let request = Request::builder()
            .method(Method::GET)
            .uri("/engine.io/?EIO=3&transport=polling")
            .body(Body::empty())
            .unwrap();
        let response = server.router().oneshot(request).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let frames = payload::decode_frames(&body).unwrap();
        let open: OpenPacket = serde_json::from_slice(&frames[0].1).unwrap();
        assert_eq!(open.upgrades, vec!["websocket"]);

        let url = format!(
            "ws://127.0.0.1:{port}/engine.io/?EIO=3&transport=websocket&sid={}",
            open.sid
        );
        let (mut client, _) = timeout(WAIT, connect_async(url)).await.unwrap().unwrap();

        client.send(Message::Text("2probe".into())).await.unwrap();
        let Some(Ok(Message::Text(pong))) = timeout(WAIT, client.next()).await.unwrap() else {
            panic!("expected probe reply");
        };
        assert_eq!(pong.as_str(), "3probe");

        client.send(Message::Text("5".into())).await.unwrap();

        let socket = server.socket(&open.sid).expect("registered");
        timeout(WAIT, async {
            while socket.upgrade_state() != UpgradeState::Upgraded {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("upgrade completed in time");
        assert_eq!(socket.transport_name().await, "websocket");

        client.send(Message::Text("4upgraded".into())).await.unwrap();
        let echo = loop {
            match timeout(WAIT, client.next()).await.unwrap() {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(_)) => continue,
                other => panic!("unexpected websocket event: {other:?}"),
            }
        };
        assert_eq!(echo.as_str(), "4upgraded");

        server.shutdown().await;
        timeout(WAIT, serving).await.unwrap().unwrap().unwrap();
    }
}

//! Request validation and routing.
//!
//! Every request to the mount path lands here and takes one of three
//! routes:
//!
//! | Request | Route |
//! |---------|-------|
//! | no `sid` | handshake: new transport, new socket |
//! | `sid` + `transport=websocket` + upgrade headers | upgrade: new candidate transport |
//! | `sid` | the socket's active polling transport |
//!
//! Client violations are answered with a JSON error body
//! `{"code": <n>, "message": "<text>"}`.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::error::{Error, ErrorCode, Result};
use crate::identifiers::SessionId;
use crate::transport::{Polling, Transport, TransportKind, WebSocketTransport};

use super::options::ServerOptions;
use super::registry::SessionRegistry;
use super::socket::{Handlers, Socket, SocketContext};

// ============================================================================
// Error Responses
// ============================================================================

/// JSON error body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u8,
    message: &'static str,
}

/// Builds the error response for a rejected request.
///
/// Client violations get `400` and CORS headers; anything else is
/// answered with a bare `403 Forbidden`.
pub fn error_response(error: &Error, request_headers: &HeaderMap) -> Response {
    let Some(code) = error.error_code() else {
        let body = ErrorBody {
            code: ErrorCode::Forbidden.code(),
            message: ErrorCode::Forbidden.message(),
        };
        return (StatusCode::FORBIDDEN, Json(body)).into_response();
    };

    let mut headers = HeaderMap::new();
    match request_headers.get(header::ORIGIN) {
        Some(origin) => {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        None => {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
        }
    }

    let body = ErrorBody {
        code: code.code(),
        message: code.message(),
    };
    (StatusCode::BAD_REQUEST, headers, Json(body)).into_response()
}

// ============================================================================
// Query
// ============================================================================

/// The query parameters the router reads.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Query {
    transport: Option<String>,
    sid: Option<SessionId>,
    b64: bool,
    jsonp: bool,
}

impl Query {
    fn parse(query: Option<&str>) -> Self {
        let mut parsed = Self::default();
        for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "transport" => parsed.transport = Some(value.into_owned()),
                "sid" => parsed.sid = Some(SessionId::from_client(value)),
                "b64" => parsed.b64 = true,
                "j" => parsed.jsonp = true,
                _ => {}
            }
        }
        parsed
    }

    /// Peer accepts raw binary unless `b64` is present.
    fn supports_binary(&self) -> bool {
        !self.b64
    }
}

/// Returns `true` if the request asks for a WebSocket upgrade.
fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"));

    connection_upgrade && upgrade_websocket
}

// ============================================================================
// Engine
// ============================================================================

/// Shared server state behind the router.
pub(crate) struct Engine {
    pub(crate) options: Arc<ServerOptions>,
    pub(crate) handlers: Handlers,
    pub(crate) registry: Arc<SessionRegistry>,
}

/// A validated request.
enum Route {
    Handshake(TransportKind),
    Upgrade(Socket),
    Existing(Socket),
}

impl Engine {
    /// Validates and serves one request.
    pub(crate) async fn handle(self: Arc<Self>, request: Request) -> Response {
        let query = Query::parse(request.uri().query());
        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let (parts, body) = request.into_parts();
        let route = match self.verify(&parts.method, &parts.headers, &query).await {
            Ok(route) => route,
            Err(e) => {
                debug!(error = %e, method = %parts.method, "Request rejected");
                return error_response(&e, &parts.headers);
            }
        };
        let request = Request::from_parts(parts, body);

        match route {
            Route::Handshake(kind) => self.handshake(kind, request, &query, remote_addr).await,
            Route::Upgrade(socket) => self.upgrade(socket, request, &query),
            Route::Existing(socket) => match socket.transport().await {
                Transport::Polling(polling) => polling.handle_request(request).await,
                Transport::WebSocket(_) => error_response(
                    &Error::bad_request("session is served over websocket"),
                    request.headers(),
                ),
            },
        }
    }

    /// Checks the transport, the session id and the handshake method.
    async fn verify(&self, method: &Method, headers: &HeaderMap, query: &Query) -> Result<Route> {
        let name = query.transport.as_deref().unwrap_or_default();
        let kind = TransportKind::from_name(name)
            .filter(|kind| self.options.enables(*kind))
            .ok_or_else(|| Error::unknown_transport(name))?;

        let Some(sid) = &query.sid else {
            if method != Method::GET {
                return Err(Error::bad_handshake_method(method.as_str()));
            }
            return Ok(Route::Handshake(kind));
        };

        let socket = self
            .registry
            .get(sid.as_str())
            .ok_or_else(|| Error::unknown_sid(sid.as_str()))?;

        if kind == TransportKind::WebSocket && is_websocket_upgrade(headers) {
            if !self.options.allow_upgrades {
                return Err(Error::bad_request("upgrades are disabled"));
            }
            return Ok(Route::Upgrade(socket));
        }

        let active = socket.transport_name().await;
        if active != kind.name() {
            return Err(Error::bad_request(format!(
                "transport mismatch: session uses {active}, request uses {kind}"
            )));
        }

        Ok(Route::Existing(socket))
    }

    /// Creates a session on a fresh transport.
    async fn handshake(
        self: Arc<Self>,
        kind: TransportKind,
        mut request: Request,
        query: &Query,
        remote_addr: Option<SocketAddr>,
    ) -> Response {
        match kind {
            TransportKind::Polling => {
                let polling = Polling::new(
                    self.options
                        .polling_options(query.supports_binary(), query.jsonp),
                );
                self.open_session(Transport::Polling(Arc::clone(&polling)), remote_addr)
                    .await;
                polling.handle_request(request).await
            }
            TransportKind::WebSocket => {
                let supports_binary = query.supports_binary();
                let capacity = self.options.queue_capacity;
                let engine = Arc::clone(&self);

                accept_websocket(&mut request, move |websocket| async move {
                    let transport = WebSocketTransport::new(websocket, supports_binary, capacity);
                    engine
                        .open_session(Transport::WebSocket(transport), remote_addr)
                        .await;
                })
            }
        }
    }

    /// Hands a new WebSocket to an existing session as upgrade candidate.
    fn upgrade(&self, socket: Socket, mut request: Request, query: &Query) -> Response {
        let supports_binary = query.supports_binary();
        let capacity = self.options.queue_capacity;

        accept_websocket(&mut request, move |websocket| async move {
            let transport = WebSocketTransport::new(websocket, supports_binary, capacity);
            if !socket.begin_upgrade(Transport::WebSocket(Arc::clone(&transport))) {
                warn!(sid = %socket.id(), state = ?socket.upgrade_state(), "Upgrade refused");
                transport.force_close();
            }
        })
    }

    /// Registers, opens and announces a new socket.
    async fn open_session(&self, transport: Transport, remote_addr: Option<SocketAddr>) -> Socket {
        let context = SocketContext {
            options: Arc::clone(&self.options),
            handlers: self.handlers.clone(),
            registry: Arc::downgrade(&self.registry),
            remote_addr,
        };
        let socket = Socket::new(SessionId::generate(), transport, context);

        self.registry.insert(socket.clone());
        socket.open().await;

        if let Some(handler) = &self.handlers.connection {
            handler(&socket);
        }

        socket
    }
}

// ============================================================================
// WebSocket Upgrade
// ============================================================================

/// Answers `101 Switching Protocols` and runs `on_open` on the upgraded stream.
fn accept_websocket<F, Fut>(request: &mut Request, on_open: F) -> Response
where
    F: FnOnce(WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if !is_websocket_upgrade(request.headers()) {
        return error_response(
            &Error::bad_request("websocket transport without upgrade headers"),
            request.headers(),
        );
    }

    let Some(key) = request.headers().get(header::SEC_WEBSOCKET_KEY) else {
        return error_response(
            &Error::bad_request("missing Sec-WebSocket-Key"),
            request.headers(),
        );
    };
    let accept = derive_accept_key(key.as_bytes());

    let on_upgrade = hyper::upgrade::on(&mut *request);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let websocket = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                on_open(websocket).await;
            }
            Err(e) => warn!(error = %e, "WebSocket upgrade failed"),
        }
    });

    let mut headers = HeaderMap::new();
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    match HeaderValue::from_str(&accept) {
        Ok(accept) => {
            headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        }
        Err(e) => warn!(error = %e, "Invalid Sec-WebSocket-Accept value"),
    }

    (StatusCode::SWITCHING_PROTOCOLS, headers, Body::empty()).into_response()
}

// ============================================================================
// Router
// ============================================================================

/// Builds the axum router serving the mount path.
pub(crate) fn router(engine: Arc<Engine>) -> axum::Router {
    let path = engine.options.path.clone();
    axum::Router::new()
        .route(&path, any(serve))
        .with_state(engine)
}

async fn serve(State(engine): State<Arc<Engine>>, request: Request) -> Response {
    engine.handle(request).await
}

// ============================================================================
// Tests
// ============================================================================

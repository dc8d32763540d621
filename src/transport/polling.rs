//! Long-polling transport.
//!
//! One half-duplex HTTP channel modelled as two request slots:
//!
//! - **poll slot**: one outstanding `GET`, answered with the next batch
//!   of outbound packets
//! - **data slot**: one outstanding `POST`, carrying a payload of inbound
//!   packets
//!
//! A second request of either kind while the first is outstanding is
//! rejected with `500`.
//!
//! # Variants
//!
//! | Variant | Selected by | Notes |
//! |---------|-------------|-------|
//! | XHR | no `j` parameter | CORS headers, `OPTIONS` preflight, binary payloads |
//! | JSONP | `j=<index>` | script body `___eio[<index>]("…");`, text only |

// ============================================================================
// Imports
// ============================================================================

use std::convert::Infallible;
use std::io::Write;
use std::str;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use futures_util::{StreamExt, future, stream};
use regex::{Captures, NoExpand, Regex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc};
use tokio::time::{Instant, sleep};
use tracing::{debug, trace, warn};
use url::form_urlencoded;

use crate::error::{Error, Result};
use crate::protocol::payload::{self, Frame};
use crate::protocol::{Packet, PacketType};

use super::lifecycle::{DeadlineExpiry, Lifecycle, TransportCore};

// ============================================================================
// Constants
// ============================================================================

/// Default minimum body size before compression is attempted.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Default maximum accepted POST body.
pub const DEFAULT_MAX_HTTP_BUFFER_SIZE: usize = 100_000_000;

/// Default depth of the outbound and inbound queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 30;

/// Content type of a JSONP poll response.
const JSONP_CONTENT_TYPE: &str = "text/javascript; charset=UTF-8";

/// Escaped newline, optionally preceded by an escaped backslash.
static ESCAPED_NEWLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\\)?\\n").expect("valid regex"));

/// Double-escaped newline.
static DOUBLE_ESCAPED_NEWLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\\\n").expect("valid regex"));

// ============================================================================
// PollingOptions
// ============================================================================

/// Configuration of one long-polling transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingOptions {
    /// Peer accepts raw binary (no `b64` query parameter).
    pub supports_binary: bool,
    /// JSONP variant.
    pub jsonp: bool,
    /// Compress large poll responses.
    pub http_compression: bool,
    /// Minimum body size before compression is attempted.
    pub compression_threshold: usize,
    /// Maximum accepted POST body.
    pub max_http_buffer_size: usize,
    /// Depth of the outbound and inbound queues.
    pub queue_capacity: usize,
    /// Time a closing transport may wait for its final poll.
    pub close_timeout: Duration,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            supports_binary: true,
            jsonp: false,
            http_compression: false,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_http_buffer_size: DEFAULT_MAX_HTTP_BUFFER_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            close_timeout: Duration::from_secs(20),
        }
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Long-polling transport for one client.
pub struct Polling {
    /// Shared lifecycle and queues.
    core: TransportCore,
    /// Transport options.
    options: PollingOptions,
    /// Data slot, held for the duration of one `POST`.
    data_slot: Arc<AsyncMutex<()>>,
    /// Decoded POST bodies, forwarded in order to the inbound queue.
    ingest_tx: mpsc::UnboundedSender<Vec<Frame>>,
}

impl Polling {
    /// Creates a polling transport and spawns its helper tasks.
    ///
    /// JSONP never carries raw binary.
    #[must_use]
    pub fn new(options: PollingOptions) -> Arc<Self> {
        let supports_binary = options.supports_binary && !options.jsonp;
        let core = TransportCore::new(
            supports_binary,
            options.queue_capacity,
            DeadlineExpiry::CloseAfter(options.close_timeout),
        );
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();

        tokio::spawn(send_close_on_closing(core.clone(), options.close_timeout));
        tokio::spawn(forward_ingested(core.clone(), ingest_rx));

        Arc::new(Self {
            core,
            options,
            data_slot: Arc::new(AsyncMutex::new(())),
            ingest_tx,
        })
    }

    /// Returns the transport options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &PollingOptions {
        &self.options
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

    /// Enqueues a packet for the next poll.
    pub async fn send(&self, packet: Packet, data: Bytes, force: bool) -> bool {
        self.core.send(packet, data, force).await
    }

    /// Waits for the next packet posted by the client.
    ///
    /// # Errors
    ///
    /// See [`crate::transport::Transport::receive`].
    pub async fn receive(&self) -> Result<Frame> {
        self.core.receive().await
    }

    /// Retires the transport after an upgrade.
    pub fn discard(&self) {
        if self.core.lifecycle().discard() {
            debug!("Polling transport discarded");
        }
    }

    /// Starts a graceful close; the next poll receives `Close`.
    pub fn close(&self) {
        if self.core.lifecycle().closing() {
            debug!("Polling transport closing");
        }
    }

    /// Closes the transport; a parked poll receives `Noop`.
    pub fn force_close(&self) {
        if self.core.lifecycle().close() {
            debug!("Polling transport closed");
        }
    }

    /// Arms or rearms the inactivity deadline.
    pub fn set_read_deadline(&self, deadline: Instant) {
        self.core.set_read_deadline(deadline);
    }

    /// Takes every queued outbound packet without a poll.
    #[cfg(test)]
    pub(crate) fn take_queued(&self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if let Ok(mut outgoing) = self.core.outgoing().try_lock() {
            while let Ok(frame) = outgoing.try_recv() {
                frames.push(frame);
            }
        }
        frames
    }
}

// ============================================================================
// Polling - Request Handling
// ============================================================================

impl Polling {
    /// Serves one HTTP request addressed to this transport.
    pub async fn handle_request(&self, request: Request) -> Response {
        let mut headers = HeaderMap::new();
        self.apply_headers(request.headers(), &mut headers);

        let method = request.method().clone();

        if method == Method::GET {
            match Arc::clone(self.core.outgoing()).try_lock_owned() {
                Ok(slot) => {
                    let callback = request_callback(&request);
                    let (parts, _) = request.into_parts();
                    self.handle_poll(parts.headers, callback, slot, headers).await
                }
                Err(_) => {
                    warn!("Overlapping poll request rejected");
                    (StatusCode::INTERNAL_SERVER_ERROR, headers).into_response()
                }
            }
        } else if method == Method::POST {
            match Arc::clone(&self.data_slot).try_lock_owned() {
                Ok(slot) => self.handle_data(request, slot, headers).await,
                Err(_) => {
                    warn!("Overlapping data request rejected");
                    (StatusCode::INTERNAL_SERVER_ERROR, headers).into_response()
                }
            }
        } else if method == Method::OPTIONS && !self.options.jsonp {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type"),
            );
            (StatusCode::OK, headers).into_response()
        } else {
            (StatusCode::INTERNAL_SERVER_ERROR, headers).into_response()
        }
    }

    /// Answers a `GET` with the next batch of outbound packets.
    async fn handle_poll(
        &self,
        request_headers: HeaderMap,
        callback: Option<String>,
        mut slot: OwnedMutexGuard<mpsc::Receiver<Frame>>,
        mut headers: HeaderMap,
    ) -> Response {
        let lifecycle = self.core.lifecycle();

        let first = tokio::select! {
            biased;
            frame = slot.recv() => frame,
            _ = lifecycle.closed() => None,
            _ = lifecycle.discarded() => None,
        };

        let mut batch = match first {
            Some(frame) => {
                let mut batch = vec![frame];
                while let Ok(frame) = slot.try_recv() {
                    batch.push(frame);
                }
                batch
            }
            None => vec![(Packet::text(PacketType::Noop), Bytes::new())],
        };

        if lifecycle.is_closed() {
            batch = vec![(Packet::text(PacketType::Noop), Bytes::new())];
        } else if lifecycle.is_closing() {
            batch = vec![(Packet::text(PacketType::Close), Bytes::new())];
        }

        let delivers_close = batch
            .iter()
            .any(|(packet, _)| packet.packet_type == PacketType::Close);

        trace!(packets = batch.len(), "Answering poll");

        let response = match self.render_poll(&request_headers, callback, &batch) {
            Ok((body, content_type, encoding)) => {
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
                if let Some(encoding) = encoding {
                    headers.insert(
                        header::CONTENT_ENCODING,
                        HeaderValue::from_static(encoding.as_str()),
                    );
                }
                (StatusCode::OK, headers, release_after_body(body, slot)).into_response()
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode poll response");
                (StatusCode::INTERNAL_SERVER_ERROR, headers).into_response()
            }
        };

        if delivers_close {
            lifecycle.close();
        }

        response
    }

    /// Encodes, wraps and compresses one poll response body.
    fn render_poll(
        &self,
        request_headers: &HeaderMap,
        callback: Option<String>,
        batch: &[Frame],
    ) -> Result<(Vec<u8>, &'static str, Option<ContentEncoding>)> {
        let encoded = payload::encode_payload(batch, self.core.supports_binary())?;

        let (body, content_type) = match (self.options.jsonp, callback) {
            (true, Some(callback)) => (jsonp_wrap(&callback, &encoded.body)?, JSONP_CONTENT_TYPE),
            _ => {
                let content_type = encoded.content_type();
                (encoded.body, content_type)
            }
        };

        if !self.options.http_compression || body.len() < self.options.compression_threshold {
            return Ok((body, content_type, None));
        }

        match ContentEncoding::negotiate(request_headers) {
            Some(encoding) => Ok((encoding.compress(&body)?, content_type, Some(encoding))),
            None => Ok((body, content_type, None)),
        }
    }

    /// Accepts a `POST` body of inbound packets.
    async fn handle_data(
        &self,
        request: Request,
        _slot: OwnedMutexGuard<()>,
        mut headers: HeaderMap,
    ) -> Response {
        let Some(length) = request
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok())
        else {
            warn!("Data request without valid Content-Length");
            return (StatusCode::BAD_REQUEST, headers).into_response();
        };

        if length > self.options.max_http_buffer_size {
            warn!(
                length,
                max = self.options.max_http_buffer_size,
                "Data request exceeds buffer size"
            );
            return (StatusCode::PAYLOAD_TOO_LARGE, headers).into_response();
        }

        let body = match to_bytes(request.into_body(), length).await {
            Ok(body) if body.len() == length => body,
            Ok(body) => {
                warn!(expected = length, actual = body.len(), "Short data request body");
                return (StatusCode::BAD_REQUEST, headers).into_response();
            }
            Err(e) => {
                warn!(error = %e, "Failed to read data request body");
                return (StatusCode::BAD_REQUEST, headers).into_response();
            }
        };

        let lifecycle = self.core.lifecycle();
        if lifecycle.is_discarded() || lifecycle.is_closing() || lifecycle.is_closed() {
            debug!(state = %lifecycle.state(), "Dropping data for inactive transport");
            return ok_response(headers);
        }

        let frames = if self.options.jsonp {
            jsonp_unescape(&body).and_then(|payload| payload::decode_frames(payload.as_bytes()))
        } else {
            payload::decode_frames(&body)
        };

        match frames {
            Ok(frames) => {
                trace!(packets = frames.len(), "Data request decoded");
                if self.ingest_tx.send(frames).is_err() {
                    debug!("Ingest queue closed");
                }
                ok_response(headers)
            }
            Err(e) => {
                warn!(error = %e, "Failed to decode data request");
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=UTF-8"),
                );
                (StatusCode::BAD_REQUEST, headers, e.to_string()).into_response()
            }
        }
    }

    /// Adds the headers common to every response of this transport.
    fn apply_headers(&self, request_headers: &HeaderMap, headers: &mut HeaderMap) {
        let legacy_ie = request_headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|agent| agent.contains(";MSIE") || agent.contains("Trident/"));
        if legacy_ie {
            headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("0"));
        }

        if self.options.jsonp {
            return;
        }

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
    }
}

// ============================================================================
// ContentEncoding
// ============================================================================

/// Compression applied to a poll response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentEncoding {
    Gzip,
    Deflate,
}

impl ContentEncoding {
    /// Picks the first supported encoding from `Accept-Encoding`.
    fn negotiate(headers: &HeaderMap) -> Option<Self> {
        headers
            .get_all(header::ACCEPT_ENCODING)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|token| token.split(';').next().unwrap_or_default().trim())
            .find_map(|token| match token {
                "gzip" => Some(Self::Gzip),
                "deflate" => Some(Self::Deflate),
                _ => None,
            })
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }

    fn compress(self, body: &[u8]) -> Result<Vec<u8>> {
        let compressed = match self {
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body)?;
                encoder.finish()?
            }
            Self::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body)?;
                encoder.finish()?
            }
        };
        Ok(compressed)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Plain `ok` acknowledgement of a data request.
fn ok_response(mut headers: HeaderMap) -> Response {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=UTF-8"),
    );
    (StatusCode::OK, headers, "ok").into_response()
}

/// Returns the JSONP callback index (`j`) of a request.
fn request_callback(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "j")
        .map(|(_, value)| value.into_owned())
}

/// Builds a body that holds the poll slot until it has been written.
fn release_after_body(body: Vec<u8>, slot: OwnedMutexGuard<mpsc::Receiver<Frame>>) -> Body {
    let chunk = stream::once(future::ready(Ok::<_, Infallible>(Bytes::from(body))));
    let release = stream::once(async move {
        drop(slot);
        None::<std::result::Result<Bytes, Infallible>>
    })
    .filter_map(future::ready);

    Body::from_stream(chunk.chain(release))
}

/// Wraps an encoded payload in a JSONP script body.
fn jsonp_wrap(callback: &str, encoded: &[u8]) -> Result<Vec<u8>> {
    let index: String = callback.chars().filter(char::is_ascii_digit).collect();
    let text = str::from_utf8(encoded)
        .map_err(|_| Error::invalid_payload("JSONP payload is not valid UTF-8"))?;
    let literal = serde_json::to_string(text)?
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029");

    Ok(format!("___eio[{index}]({literal});").into_bytes())
}

/// Extracts the payload from a JSONP form body (`d=…`).
fn jsonp_unescape(body: &[u8]) -> Result<String> {
    let data = form_urlencoded::parse(body)
        .find(|(key, _)| key == "d")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| Error::invalid_payload("JSONP body without d field"))?;

    let data = ESCAPED_NEWLINE.replace_all(&data, |caps: &Captures<'_>| {
        if caps.get(1).is_some() {
            caps[0].to_string()
        } else {
            "\n".to_string()
        }
    });

    Ok(DOUBLE_ESCAPED_NEWLINE
        .replace_all(&data, NoExpand(r"\n"))
        .into_owned())
}

// ============================================================================
// Background Tasks
// ============================================================================

/// Queues the terminal `Close` packet once the transport starts closing,
/// then closes the transport if no poll collects it in time.
async fn send_close_on_closing(core: TransportCore, close_timeout: Duration) {
    let lifecycle = core.lifecycle();

    tokio::select! {
        _ = lifecycle.closed() => return,
        _ = lifecycle.closing_started() => {}
    }

    if !core
        .send(Packet::text(PacketType::Close), Bytes::new(), true)
        .await
    {
        debug!("Close packet not queued, transport already closed");
        return;
    }

    tokio::select! {
        _ = lifecycle.closed() => {}
        _ = sleep(close_timeout) => {
            debug!("Close packet not collected in time");
            lifecycle.close();
        }
    }
}

/// Moves decoded POST bodies into the inbound queue, in arrival order.
async fn forward_ingested(core: TransportCore, mut ingest_rx: mpsc::UnboundedReceiver<Vec<Frame>>) {
    loop {
        let batch = tokio::select! {
            _ = core.lifecycle().closed() => return,
            batch = ingest_rx.recv() => match batch {
                Some(batch) => batch,
                None => return,
            },
        };

        for frame in batch {
            if !core.push_incoming(frame).await {
                return;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Per-client session orchestrator.
//!
//! A [`Socket`] owns the transport currently serving one client. It runs a
//! dispatch loop per transport, answers pings, forwards messages to the
//! application and drives the polling → WebSocket upgrade.
//!
//! # Upgrade Handshake
//!
//! ```text
//! client                         polling (active)        websocket (candidate)
//!   │── Ping "probe" ──────────────────────────────────────────►│
//!   │◄───────────────────────────────────────── Pong "probe" ───│
//!   │◄── Noop every 100 ms ─────────│ (keep-alive)              │
//!   │── Upgrade ───────────────────────────────────────────────►│
//!   │                     discard + close        becomes active
//! ```
//!
//! The active transport is swapped exactly once, under the write lock that
//! every send holds for reading.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::RwLock as AsyncRwLock;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::identifiers::SessionId;
use crate::protocol::{OpenPacket, PROBE, Packet, PacketType};
use crate::transport::Transport;

use super::options::ServerOptions;
use super::registry::SessionRegistry;

// ============================================================================
// Constants
// ============================================================================

/// Interval of the `Noop` keep-alive on the original transport during an upgrade.
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Handlers
// ============================================================================

/// Called once a new session has completed its handshake.
pub type ConnectionHandler = Arc<dyn Fn(&Socket) + Send + Sync>;

/// Called for every `Message` packet with its payload and binary flag.
pub type MessageHandler = Arc<dyn Fn(&Socket, Bytes, bool) + Send + Sync>;

/// Called once when a session reaches `Closed`.
pub type CloseHandler = Arc<dyn Fn(&Socket) + Send + Sync>;

/// Application callbacks shared by every socket of a server.
#[derive(Clone, Default)]
pub struct Handlers {
    pub(crate) connection: Option<ConnectionHandler>,
    pub(crate) message: Option<MessageHandler>,
    pub(crate) close: Option<CloseHandler>,
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("connection", &self.connection.is_some())
            .field("message", &self.message.is_some())
            .field("close", &self.close.is_some())
            .finish()
    }
}

// ============================================================================
// States
// ============================================================================

/// Readiness of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Created, handshake not yet sent.
    Opening,
    /// Handshake sent.
    Open,
    /// Close requested, waiting for the transport to finish.
    Closing,
    /// Terminal.
    Closed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Progress of a transport upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    /// No upgrade attempted, or the last attempt failed.
    None,
    /// A candidate transport is being probed.
    Upgrading,
    /// The candidate replaced the original transport.
    Upgraded,
}

/// Mutable socket state guarded by one lock.
struct SocketState {
    ready: ReadyState,
    upgrade: UpgradeState,
    candidate: Option<Transport>,
    keepalive: Option<CancellationToken>,
}

// ============================================================================
// SocketContext
// ============================================================================

/// Server-side collaborators of a socket.
#[derive(Clone)]
pub(crate) struct SocketContext {
    pub(crate) options: Arc<ServerOptions>,
    pub(crate) handlers: Handlers,
    pub(crate) registry: Weak<SessionRegistry>,
    pub(crate) remote_addr: Option<SocketAddr>,
}

// ============================================================================
// Socket
// ============================================================================

/// One client session, independent of the transport currently serving it.
///
/// Cheap to clone; every clone refers to the same session.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    /// Session id.
    id: SessionId,
    /// Server collaborators.
    context: SocketContext,
    /// Readiness, upgrade progress, candidate and keep-alive.
    state: Mutex<SocketState>,
    /// Active transport; written once per upgrade.
    transport: AsyncRwLock<Transport>,
}

// ============================================================================
// Socket - Lifecycle
// ============================================================================

impl Socket {
    /// Creates a socket in the `Opening` state.
    pub(crate) fn new(id: SessionId, transport: Transport, context: SocketContext) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                id,
                context,
                state: Mutex::new(SocketState {
                    ready: ReadyState::Opening,
                    upgrade: UpgradeState::None,
                    candidate: None,
                    keepalive: None,
                }),
                transport: AsyncRwLock::new(transport),
            }),
        }
    }

    /// Sends the handshake and starts dispatching the initial transport.
    pub(crate) async fn open(&self) {
        let options = &self.inner.context.options;
        let transport = self.inner.transport.read().await.clone();

        self.inner.state.lock().ready = ReadyState::Open;

        let handshake = OpenPacket {
            sid: self.inner.id.to_string(),
            upgrades: options.upgrades_for(transport.kind()),
            ping_interval: duration_millis(options.ping_interval),
            ping_timeout: duration_millis(options.ping_timeout),
        };

        match serde_json::to_vec(&handshake) {
            Ok(body) => {
                transport
                    .send(Packet::text(PacketType::Open), Bytes::from(body), false)
                    .await;
            }
            Err(e) => warn!(sid = %self.inner.id, error = %e, "Failed to encode handshake"),
        }

        if let Some(initial) = &options.initial_packet {
            transport
                .send(Packet::text(PacketType::Message), initial.clone(), false)
                .await;
        }

        transport.set_read_deadline(Instant::now() + options.read_timeout());
        tokio::spawn(self.clone().dispatch(transport.clone(), false));

        info!(sid = %self.inner.id, transport = transport.name(), "Socket opened");
    }

    /// Closes the session gracefully.
    ///
    /// No-op unless the socket is `Open`.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.ready != ReadyState::Open {
                return;
            }
            state.ready = ReadyState::Closing;
        }

        debug!(sid = %self.inner.id, "Socket closing");
        self.inner.transport.read().await.close();
    }

    /// Sends a `Message` on whichever transport is active.
    ///
    /// Returns `false` if the message was rejected because the session is
    /// closing or closed.
    pub async fn send_message(&self, data: impl Into<Bytes>, is_binary: bool) -> bool {
        if self.ready_state() == ReadyState::Closed {
            return false;
        }

        let transport = self.inner.transport.read().await;
        transport
            .send(
                Packet::new(PacketType::Message, is_binary),
                data.into(),
                false,
            )
            .await
    }
}

// ============================================================================
// Socket - Accessors
// ============================================================================

impl Socket {
    /// Returns the session id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// Returns the readiness state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.inner.state.lock().ready
    }

    /// Returns the upgrade progress.
    #[must_use]
    pub fn upgrade_state(&self) -> UpgradeState {
        self.inner.state.lock().upgrade
    }

    /// Returns the name of the active transport.
    pub async fn transport_name(&self) -> &'static str {
        self.inner.transport.read().await.name()
    }

    /// Returns the peer address, if known.
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.context.remote_addr
    }

    /// Returns the active transport.
    pub(crate) async fn transport(&self) -> Transport {
        self.inner.transport.read().await.clone()
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("ready", &self.ready_state())
            .field("upgrade", &self.upgrade_state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Socket - Dispatch
// ============================================================================

impl Socket {
    /// Processes packets from one transport until it stops producing them.
    ///
    /// A candidate loop becomes the active loop once `Upgrade` is handled.
    async fn dispatch(self, transport: Transport, mut candidate: bool) {
        let read_timeout = self.inner.context.options.read_timeout();

        loop {
            let (packet, data) = match transport.receive().await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(
                        sid = %self.inner.id,
                        transport = transport.name(),
                        reason = %e,
                        "Dispatch loop ended"
                    );
                    break;
                }
            };

            trace!(sid = %self.inner.id, %packet, "Packet received");

            match packet.packet_type {
                PacketType::Ping => {
                    let probe = candidate && data.as_ref() == PROBE;
                    transport
                        .send(Packet::new(PacketType::Pong, packet.is_binary), data, false)
                        .await;
                    if probe {
                        self.start_keepalive().await;
                    }
                }

                PacketType::Message => {
                    if let Some(handler) = &self.inner.context.handlers.message {
                        handler(&self, data, packet.is_binary);
                    }
                }

                PacketType::Upgrade if candidate => {
                    if !self.complete_upgrade(&transport).await {
                        break;
                    }
                    candidate = false;
                }

                other => {
                    warn!(
                        sid = %self.inner.id,
                        transport = transport.name(),
                        packet = %other,
                        "Unexpected packet"
                    );
                }
            }

            transport.set_read_deadline(Instant::now() + read_timeout);
        }

        self.dispatch_ended(&transport, candidate).await;
    }

    /// Cleans up after a dispatch loop.
    async fn dispatch_ended(&self, transport: &Transport, candidate: bool) {
        if candidate {
            {
                let mut state = self.inner.state.lock();
                let current = state
                    .candidate
                    .as_ref()
                    .is_some_and(|pending| pending.ptr_eq(transport));
                if current {
                    state.candidate = None;
                    if state.upgrade == UpgradeState::Upgrading {
                        state.upgrade = UpgradeState::None;
                    }
                }
            }
            self.stop_keepalive();
            transport.force_close();
            debug!(sid = %self.inner.id, "Upgrade abandoned");
            return;
        }

        let active = self.inner.transport.read().await.ptr_eq(transport);
        if active {
            self.finish_close(transport);
        } else {
            transport.force_close();
        }
    }

    /// Moves the socket to `Closed` once its active transport is gone.
    fn finish_close(&self, transport: &Transport) {
        let (keepalive, candidate) = {
            let mut state = self.inner.state.lock();
            if state.ready == ReadyState::Closed {
                return;
            }
            state.ready = ReadyState::Closed;
            (state.keepalive.take(), state.candidate.take())
        };

        if let Some(token) = keepalive {
            token.cancel();
        }
        if let Some(candidate) = candidate {
            candidate.force_close();
        }
        transport.force_close();

        if let Some(registry) = self.inner.context.registry.upgrade() {
            registry.remove(self.inner.id.as_str());
        }

        info!(sid = %self.inner.id, "Socket closed");

        if let Some(handler) = &self.inner.context.handlers.close {
            handler(self);
        }
    }
}

// ============================================================================
// Socket - Upgrade
// ============================================================================

impl Socket {
    /// Starts probing a candidate transport.
    ///
    /// Returns `false` if the socket is not open or an upgrade was already
    /// attempted successfully or is in progress.
    pub(crate) fn begin_upgrade(&self, candidate: Transport) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.ready != ReadyState::Open || state.upgrade != UpgradeState::None {
                return false;
            }
            state.upgrade = UpgradeState::Upgrading;
            state.candidate = Some(candidate.clone());
        }

        let options = &self.inner.context.options;
        candidate.set_read_deadline(Instant::now() + options.read_timeout());

        debug!(sid = %self.inner.id, transport = candidate.name(), "Upgrade started");

        tokio::spawn(self.clone().dispatch(candidate.clone(), true));
        tokio::spawn(self.clone().expire_upgrade(candidate, options.upgrade_timeout));

        true
    }

    /// Closes the candidate if it has not upgraded in time.
    async fn expire_upgrade(self, candidate: Transport, upgrade_timeout: Duration) {
        tokio::select! {
            _ = candidate.lifecycle().closed() => return,
            _ = sleep(upgrade_timeout) => {}
        }

        let pending = {
            let state = self.inner.state.lock();
            state.upgrade == UpgradeState::Upgrading
                && state
                    .candidate
                    .as_ref()
                    .is_some_and(|pending| pending.ptr_eq(&candidate))
        };

        if pending {
            warn!(sid = %self.inner.id, "Upgrade timed out");
            candidate.force_close();
        }
    }

    /// Swaps the candidate in as the active transport.
    ///
    /// Returns `false` if the socket closed first; the candidate is closed.
    async fn complete_upgrade(&self, candidate: &Transport) -> bool {
        let mut active = self.inner.transport.write().await;

        let (closing, keepalive) = {
            let mut state = self.inner.state.lock();
            if state.ready == ReadyState::Closed {
                state.candidate = None;
                drop(state);
                candidate.force_close();
                return false;
            }
            state.upgrade = UpgradeState::Upgraded;
            state.candidate = None;
            (state.ready == ReadyState::Closing, state.keepalive.take())
        };

        if let Some(token) = keepalive {
            token.cancel();
        }

        let previous = std::mem::replace(&mut *active, candidate.clone());
        previous.discard();
        previous.close();
        drop(active);

        if closing {
            candidate.close();
        }

        info!(
            sid = %self.inner.id,
            from = previous.name(),
            to = candidate.name(),
            "Transport upgraded"
        );

        true
    }

    /// Starts the `Noop` keep-alive on the active transport.
    async fn start_keepalive(&self) {
        let original = self.inner.transport.read().await.clone();
        let token = CancellationToken::new();

        let previous = self.inner.state.lock().keepalive.replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        trace!(sid = %self.inner.id, "Upgrade keep-alive started");
        tokio::spawn(keepalive(original, token));
    }

    fn stop_keepalive(&self) {
        let token = self.inner.state.lock().keepalive.take();
        if let Some(token) = token {
            token.cancel();
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Sends `Noop` every [`KEEPALIVE_INTERVAL`] until cancelled.
async fn keepalive(transport: Transport, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(KEEPALIVE_INTERVAL) => {}
        }

        tokio::select! {
            _ = token.cancelled() => return,
            sent = transport.send(Packet::text(PacketType::Noop), Bytes::new(), false) => {
                if !sent {
                    return;
                }
            }
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Tests
// ============================================================================

//! Shared transport lifecycle and queues.
//!
//! Both concrete transports embed a [`TransportCore`]: the lifecycle state
//! machine, the bounded outbound/inbound queues and the read-deadline
//! watcher.
//!
//! # State Machine
//!
//! ```text
//! Active ──discard──► Discarded
//!   │
//!   ├──closing──► Closing ──close──► Closed
//!   │
//!   └──close────────────────────────► Closed
//! ```
//!
//! Each transition is a one-shot broadcast event: the first signal fires
//! it for every waiter, later signals are no-ops.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{Frame, Packet, PacketType};

// ============================================================================
// Constants
// ============================================================================

const DISCARDED: u8 = 0b001;
const CLOSING: u8 = 0b010;
const CLOSED: u8 = 0b100;

// ============================================================================
// LifecycleState
// ============================================================================

/// Observable lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Receiving and sending.
    Active,
    /// Retired by an upgrade; may still drain one pending response.
    Discarded,
    /// Graceful shutdown in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Discarded => "discarded",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// One-shot lifecycle events shared by every clone.
#[derive(Clone, Default)]
pub struct Lifecycle {
    inner: Arc<LifecycleInner>,
}

#[derive(Default)]
struct LifecycleInner {
    fired: AtomicU8,
    discarded: CancellationToken,
    closing: CancellationToken,
    closed: CancellationToken,
}

impl Lifecycle {
    /// Creates a lifecycle in the `Active` state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the `Discarded` event. Returns `true` the first time.
    pub fn discard(&self) -> bool {
        self.fire(DISCARDED, &self.inner.discarded)
    }

    /// Fires the `Closing` event. Returns `true` the first time.
    pub fn closing(&self) -> bool {
        self.fire(CLOSING, &self.inner.closing)
    }

    /// Fires the terminal `Closed` event. Returns `true` the first time.
    pub fn close(&self) -> bool {
        self.fire(CLOSED, &self.inner.closed)
    }

    fn fire(&self, bit: u8, token: &CancellationToken) -> bool {
        let first = self.inner.fired.fetch_or(bit, Ordering::AcqRel) & bit == 0;
        if first {
            token.cancel();
        }
        first
    }

    /// Returns `true` once discarded.
    #[inline]
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        self.inner.discarded.is_cancelled()
    }

    /// Returns `true` once closing.
    #[inline]
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.inner.closing.is_cancelled()
    }

    /// Returns `true` once closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Returns the most advanced state reached.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        if self.is_closed() {
            LifecycleState::Closed
        } else if self.is_closing() {
            LifecycleState::Closing
        } else if self.is_discarded() {
            LifecycleState::Discarded
        } else {
            LifecycleState::Active
        }
    }

    /// Completes when the transport is discarded.
    #[inline]
    pub fn discarded(&self) -> WaitForCancellationFuture<'_> {
        self.inner.discarded.cancelled()
    }

    /// Completes when the transport starts closing.
    #[inline]
    pub fn closing_started(&self) -> WaitForCancellationFuture<'_> {
        self.inner.closing.cancelled()
    }

    /// Completes when the transport is closed.
    #[inline]
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.inner.closed.cancelled()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Lifecycle").field(&self.state()).finish()
    }
}

// ============================================================================
// DeadlineExpiry
// ============================================================================

/// What the read-deadline watcher does when the deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeadlineExpiry {
    /// Close immediately.
    Close,
    /// Start closing, then close if still open after the grace period.
    CloseAfter(Duration),
}

// ============================================================================
// TransportCore
// ============================================================================

/// Lifecycle, queues and deadline shared by the concrete transports.
#[derive(Clone)]
pub(crate) struct TransportCore {
    /// Whether the peer accepts raw binary.
    supports_binary: bool,
    /// Lifecycle events.
    lifecycle: Lifecycle,
    /// Outbound queue, producer side.
    outgoing_tx: mpsc::Sender<Frame>,
    /// Outbound queue, consumer side; the lock doubles as the poll slot.
    outgoing_rx: Arc<AsyncMutex<mpsc::Receiver<Frame>>>,
    /// Inbound queue, producer side.
    incoming_tx: mpsc::Sender<Frame>,
    /// Inbound queue, consumer side.
    incoming_rx: Arc<AsyncMutex<mpsc::Receiver<Frame>>>,
    /// Current read deadline.
    deadline: Arc<watch::Sender<Option<Instant>>>,
}

impl TransportCore {
    /// Creates the core and spawns its deadline watcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn new(supports_binary: bool, capacity: usize, expiry: DeadlineExpiry) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(capacity);
        let (incoming_tx, incoming_rx) = mpsc::channel(capacity);
        let (deadline_tx, deadline_rx) = watch::channel(None);
        let lifecycle = Lifecycle::new();

        tokio::spawn(watch_deadline(lifecycle.clone(), deadline_rx, expiry));

        Self {
            supports_binary,
            lifecycle,
            outgoing_tx,
            outgoing_rx: Arc::new(AsyncMutex::new(outgoing_rx)),
            incoming_tx,
            incoming_rx: Arc::new(AsyncMutex::new(incoming_rx)),
            deadline: Arc::new(deadline_tx),
        }
    }

    #[inline]
    pub(crate) fn supports_binary(&self) -> bool {
        self.supports_binary
    }

    #[inline]
    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    #[inline]
    pub(crate) fn outgoing(&self) -> &Arc<AsyncMutex<mpsc::Receiver<Frame>>> {
        &self.outgoing_rx
    }

    /// Enqueues an outbound packet.
    ///
    /// Rejected once closed, or once closing unless `force` is set. Blocks
    /// while the queue is full.
    pub(crate) async fn send(&self, packet: Packet, data: Bytes, force: bool) -> bool {
        if self.lifecycle.is_closed() || (self.lifecycle.is_closing() && !force) {
            return false;
        }

        tokio::select! {
            biased;
            _ = self.lifecycle.closed() => false,
            sent = self.outgoing_tx.send((packet, data)) => sent.is_ok(),
        }
    }

    /// Waits for the next inbound packet.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelClosed`] once the transport is closed
    /// - [`Error::GotClosePacket`] if the peer sent `Close`; the transport is closed
    pub(crate) async fn receive(&self) -> Result<Frame> {
        let mut incoming = self.incoming_rx.lock().await;

        let frame = tokio::select! {
            biased;
            frame = incoming.recv() => frame.ok_or(Error::ChannelClosed)?,
            _ = self.lifecycle.closed() => return Err(Error::ChannelClosed),
        };

        if frame.0.packet_type == PacketType::Close {
            debug!("Peer sent close packet");
            self.lifecycle.close();
            return Err(Error::GotClosePacket);
        }

        Ok(frame)
    }

    /// Pushes a decoded packet into the inbound queue.
    ///
    /// Returns `false` if the transport closed first.
    pub(crate) async fn push_incoming(&self, frame: Frame) -> bool {
        tokio::select! {
            biased;
            _ = self.lifecycle.closed() => false,
            sent = self.incoming_tx.send(frame) => sent.is_ok(),
        }
    }

    /// Arms or rearms the read deadline.
    pub(crate) fn set_read_deadline(&self, deadline: Instant) {
        self.deadline.send_replace(Some(deadline));
    }
}

// ============================================================================
// Deadline Watcher
// ============================================================================

/// Fires the expiry action when no rearm happens before the deadline.
async fn watch_deadline(
    lifecycle: Lifecycle,
    mut deadline_rx: watch::Receiver<Option<Instant>>,
    expiry: DeadlineExpiry,
) {
    loop {
        let deadline = *deadline_rx.borrow_and_update();

        tokio::select! {
            _ = lifecycle.closed() => return,
            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                trace!("Read deadline rearmed");
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                debug!(?expiry, "Read deadline expired");
                match expiry {
                    DeadlineExpiry::Close => {
                        lifecycle.close();
                    }
                    DeadlineExpiry::CloseAfter(grace) => {
                        lifecycle.closing();
                        tokio::select! {
                            _ = lifecycle.closed() => {}
                            _ = sleep(grace) => {
                                lifecycle.close();
                            }
                        }
                    }
                }
                return;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> TransportCore {
        TransportCore::new(true, 4, DeadlineExpiry::Close)
    }

    #[test]
    fn test_transitions_are_one_shot() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Active);

        assert!(lifecycle.discard());
        assert!(!lifecycle.discard());
        assert_eq!(lifecycle.state(), LifecycleState::Discarded);

        assert!(lifecycle.closing());
        assert!(!lifecycle.closing());
        assert_eq!(lifecycle.state(), LifecycleState::Closing);

        assert!(lifecycle.close());
        assert!(!lifecycle.close());
        assert_eq!(lifecycle.state(), LifecycleState::Closed);
    }

    #[test]
    fn test_close_without_closing() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.close());
        assert!(lifecycle.is_closed());
        assert!(!lifecycle.is_closing());
    }

    #[test]
    fn test_closed_future_pends_until_close() {
        let lifecycle = Lifecycle::new();
        let mut closed = tokio_test::task::spawn(lifecycle.closed());
        tokio_test::assert_pending!(closed.poll());

        lifecycle.discard();
        lifecycle.closing();
        assert!(!closed.is_woken());

        lifecycle.close();
        assert!(closed.is_woken());
        tokio_test::assert_ready!(closed.poll());
    }

    #[tokio::test]
    async fn test_events_broadcast_to_all_waiters() {
        let lifecycle = Lifecycle::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                tokio::spawn(async move { lifecycle.closed().await })
            })
            .collect();

        lifecycle.close();
        for waiter in waiters {
            waiter.await.expect("waiter completes");
        }
    }

    #[tokio::test]
    async fn test_send_rejected_when_closing_unless_forced() {
        let core = core();
        assert!(core.send(Packet::text(PacketType::Message), Bytes::new(), false).await);

        core.lifecycle().closing();
        assert!(!core.send(Packet::text(PacketType::Message), Bytes::new(), false).await);
        assert!(core.send(Packet::text(PacketType::Close), Bytes::new(), true).await);

        core.lifecycle().close();
        assert!(!core.send(Packet::text(PacketType::Close), Bytes::new(), true).await);
    }

    #[tokio::test]
    async fn test_receive_returns_frames_in_order() {
        let core = core();
        let first = (Packet::text(PacketType::Message), Bytes::from_static(b"a"));
        let second = (Packet::text(PacketType::Ping), Bytes::from_static(b"b"));

        assert!(core.push_incoming(first.clone()).await);
        assert!(core.push_incoming(second.clone()).await);

        assert_eq!(core.receive().await.unwrap(), first);
        assert_eq!(core.receive().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_receive_close_packet_retires_transport() {
        let core = core();
        core.push_incoming((Packet::text(PacketType::Close), Bytes::new()))
            .await;

        assert!(matches!(core.receive().await, Err(Error::GotClosePacket)));
        assert!(core.lifecycle().is_closed());
        assert!(matches!(core.receive().await, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_close_unblocks_receive() {
        let core = core();
        let receiver = {
            let core = core.clone();
            tokio::spawn(async move { core.receive().await })
        };

        tokio::task::yield_now().await;
        core.lifecycle().close();

        let result = receiver.await.expect("join");
        assert!(matches!(result, Err(Error::ChannelClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_closes() {
        let core = core();
        core.set_read_deadline(Instant::now() + Duration::from_secs(5));

        sleep(Duration::from_secs(4)).await;
        assert!(!core.lifecycle().is_closed());

        sleep(Duration::from_secs(2)).await;
        assert!(core.lifecycle().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_rearm_postpones_expiry() {
        let core = core();
        core.set_read_deadline(Instant::now() + Duration::from_secs(5));

        sleep(Duration::from_secs(4)).await;
        core.set_read_deadline(Instant::now() + Duration::from_secs(5));

        sleep(Duration::from_secs(4)).await;
        assert!(!core.lifecycle().is_closed());

        sleep(Duration::from_secs(2)).await;
        assert!(core.lifecycle().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_grace_period() {
        let core = TransportCore::new(false, 4, DeadlineExpiry::CloseAfter(Duration::from_secs(3)));
        core.set_read_deadline(Instant::now() + Duration::from_secs(1));

        sleep(Duration::from_secs(2)).await;
        assert_eq!(core.lifecycle().state(), LifecycleState::Closing);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(core.lifecycle().state(), LifecycleState::Closed);
    }
}

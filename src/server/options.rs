//! Server configuration.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use engineio_server::ServerOptions;
//!
//! let options = ServerOptions::new()
//!     .with_path("/realtime")
//!     .with_ping_interval(Duration::from_secs(10))
//!     .with_http_compression();
//!
//! assert_eq!(options.path, "/realtime/");
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use bytes::Bytes;

use crate::transport::polling::{
    DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_HTTP_BUFFER_SIZE, DEFAULT_QUEUE_CAPACITY,
};
use crate::transport::{PollingOptions, TransportKind, WEBSOCKET};

// ============================================================================
// Constants
// ============================================================================

/// Default mount path.
pub const DEFAULT_PATH: &str = "/engine.io/";

/// Default interval the client is told to ping at.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

/// Default time the client waits for a pong.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(20);

/// Default time a candidate transport has to complete an upgrade.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ServerOptions
// ============================================================================

/// Server-wide protocol options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Mount path, always ending in `/`.
    pub path: String,

    /// Ping interval advertised in the handshake.
    pub ping_interval: Duration,

    /// Ping timeout advertised in the handshake.
    pub ping_timeout: Duration,

    /// Time a candidate transport has to send `Upgrade`.
    pub upgrade_timeout: Duration,

    /// Compress large poll responses.
    pub http_compression: bool,

    /// Minimum poll response size before compression is attempted.
    pub compression_threshold: usize,

    /// Maximum accepted POST body.
    pub max_http_buffer_size: usize,

    /// Advertise and accept transport upgrades.
    pub allow_upgrades: bool,

    /// Transports accepted at handshake.
    pub transports: Vec<TransportKind>,

    /// Message sent right after the handshake.
    pub initial_packet: Option<Bytes>,

    /// Depth of each transport's outbound and inbound queues.
    pub queue_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ServerOptions {
    /// Creates options with the default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: DEFAULT_PATH.to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
            http_compression: false,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_http_buffer_size: DEFAULT_MAX_HTTP_BUFFER_SIZE,
            allow_upgrades: true,
            transports: vec![TransportKind::Polling, TransportKind::WebSocket],
            initial_packet: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ServerOptions {
    /// Sets the mount path. A trailing `/` is added if missing.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        self.path = path;
        self
    }

    /// Sets the ping interval.
    #[inline]
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Sets the ping timeout.
    #[inline]
    #[must_use]
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Sets the upgrade timeout.
    #[inline]
    #[must_use]
    pub fn with_upgrade_timeout(mut self, timeout: Duration) -> Self {
        self.upgrade_timeout = timeout;
        self
    }

    /// Enables gzip/deflate for large poll responses.
    #[inline]
    #[must_use]
    pub fn with_http_compression(mut self) -> Self {
        self.http_compression = true;
        self
    }

    /// Sets the compression threshold in bytes.
    #[inline]
    #[must_use]
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Sets the maximum accepted POST body in bytes.
    #[inline]
    #[must_use]
    pub fn with_max_http_buffer_size(mut self, size: usize) -> Self {
        self.max_http_buffer_size = size;
        self
    }

    /// Disables transport upgrades.
    #[inline]
    #[must_use]
    pub fn without_upgrades(mut self) -> Self {
        self.allow_upgrades = false;
        self
    }

    /// Restricts the transports accepted at handshake.
    #[must_use]
    pub fn with_transports(mut self, transports: impl IntoIterator<Item = TransportKind>) -> Self {
        self.transports = transports.into_iter().collect();
        self
    }

    /// Sets a message sent right after the handshake.
    #[must_use]
    pub fn with_initial_packet(mut self, data: impl Into<Bytes>) -> Self {
        self.initial_packet = Some(data.into());
        self
    }

    /// Sets the per-transport queue depth.
    #[inline]
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

// ============================================================================
// Derived Settings
// ============================================================================

impl ServerOptions {
    /// Returns `true` if the transport kind is accepted.
    #[inline]
    #[must_use]
    pub fn enables(&self, kind: TransportKind) -> bool {
        self.transports.contains(&kind)
    }

    /// Returns the upgrade targets advertised to a client on `kind`.
    #[must_use]
    pub fn upgrades_for(&self, kind: TransportKind) -> Vec<String> {
        if self.allow_upgrades
            && kind == TransportKind::Polling
            && self.enables(TransportKind::WebSocket)
        {
            vec![WEBSOCKET.to_string()]
        } else {
            Vec::new()
        }
    }

    /// Returns how long a transport may stay silent before it is dead.
    #[inline]
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.ping_interval + self.ping_timeout
    }

    /// Returns the options for one polling transport.
    #[must_use]
    pub fn polling_options(&self, supports_binary: bool, jsonp: bool) -> PollingOptions {
        PollingOptions {
            supports_binary,
            jsonp,
            http_compression: self.http_compression,
            compression_threshold: self.compression_threshold,
            max_http_buffer_size: self.max_http_buffer_size,
            queue_capacity: self.queue_capacity,
            close_timeout: self.ping_timeout,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

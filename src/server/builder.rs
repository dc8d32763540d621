//! Builder pattern for server configuration.
//!
//! Provides a fluent API for configuring and creating [`Server`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use engineio_server::Server;
//!
//! # fn example() -> engineio_server::Result<()> {
//! let server = Server::builder()
//!     .path("/engine.io")
//!     .ping_interval(Duration::from_secs(25))
//!     .on_message(|socket, data, _is_binary| {
//!         let socket = socket.clone();
//!         tokio::spawn(async move {
//!             socket.send_message(data, false).await;
//!         });
//!     })
//!     .build()?;
//! # let _ = server;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::transport::TransportKind;

use super::Server;
use super::options::ServerOptions;
use super::socket::{Handlers, Socket};

// ============================================================================
// ServerBuilder
// ============================================================================

/// Builder for configuring a [`Server`] instance.
///
/// Use [`Server::builder()`] to create a new builder.
#[derive(Debug, Default, Clone)]
pub struct ServerBuilder {
    /// Protocol options.
    options: ServerOptions,
    /// Application callbacks.
    handlers: Handlers,
}

// ============================================================================
// ServerBuilder Implementation
// ============================================================================

impl ServerBuilder {
    /// Creates a builder with default options and no callbacks.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all options at once.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the mount path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.options = self.options.with_path(path);
        self
    }

    /// Sets the ping interval advertised to clients.
    #[inline]
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.options.ping_interval = interval;
        self
    }

    /// Sets the ping timeout advertised to clients.
    #[inline]
    #[must_use]
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.options.ping_timeout = timeout;
        self
    }

    /// Sets the time a candidate transport has to complete an upgrade.
    #[inline]
    #[must_use]
    pub fn upgrade_timeout(mut self, timeout: Duration) -> Self {
        self.options.upgrade_timeout = timeout;
        self
    }

    /// Enables or disables compression of large poll responses.
    #[inline]
    #[must_use]
    pub fn http_compression(mut self, enabled: bool) -> Self {
        self.options.http_compression = enabled;
        self
    }

    /// Sets the minimum poll response size before compression.
    #[inline]
    #[must_use]
    pub fn compression_threshold(mut self, threshold: usize) -> Self {
        self.options.compression_threshold = threshold;
        self
    }

    /// Sets the maximum accepted POST body.
    #[inline]
    #[must_use]
    pub fn max_http_buffer_size(mut self, size: usize) -> Self {
        self.options.max_http_buffer_size = size;
        self
    }

    /// Enables or disables transport upgrades.
    #[inline]
    #[must_use]
    pub fn allow_upgrades(mut self, allow: bool) -> Self {
        self.options.allow_upgrades = allow;
        self
    }

    /// Sets the transports accepted at handshake.
    #[must_use]
    pub fn transports(mut self, transports: impl IntoIterator<Item = TransportKind>) -> Self {
        self.options = self.options.with_transports(transports);
        self
    }

    /// Sets a message sent to every client right after the handshake.
    #[must_use]
    pub fn initial_packet(mut self, data: impl Into<Bytes>) -> Self {
        self.options = self.options.with_initial_packet(data);
        self
    }

    /// Sets the per-transport queue depth.
    #[inline]
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.options.queue_capacity = capacity;
        self
    }

    /// Sets the callback run for every new session.
    #[must_use]
    pub fn on_connection<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Socket) + Send + Sync + 'static,
    {
        self.handlers.connection = Some(Arc::new(handler));
        self
    }

    /// Sets the callback run for every received message.
    #[must_use]
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Socket, Bytes, bool) + Send + Sync + 'static,
    {
        self.handlers.message = Some(Arc::new(handler));
        self
    }

    /// Sets the callback run when a session closes.
    #[must_use]
    pub fn on_close<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Socket) + Send + Sync + 'static,
    {
        self.handlers.close = Some(Arc::new(handler));
        self
    }

    /// Builds the server with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the path does not start with `/`
    /// - [`Error::Config`] if the ping interval, ping timeout or queue capacity is zero
    /// - [`Error::Config`] if the queue cannot hold `Open` plus the initial packet
    /// - [`Error::Config`] if no transport is enabled
    pub fn build(self) -> Result<Server> {
        self.validate_path()?;
        self.validate_timing()?;
        self.validate_transports()?;

        Ok(Server::new(self.options, self.handlers))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ServerBuilder {
    fn validate_path(&self) -> Result<()> {
        if !self.options.path.starts_with('/') {
            return Err(Error::config(format!(
                "Path must start with '/': {:?}",
                self.options.path
            )));
        }
        Ok(())
    }

    fn validate_timing(&self) -> Result<()> {
        if self.options.ping_interval.is_zero() {
            return Err(Error::config("Ping interval must be non-zero"));
        }
        if self.options.ping_timeout.is_zero() {
            return Err(Error::config("Ping timeout must be non-zero"));
        }
        if self.options.queue_capacity == 0 {
            return Err(Error::config("Queue capacity must be non-zero"));
        }

        // Open and the initial packet are queued before the handshake poll drains them.
        let handshake_packets = 1 + usize::from(self.options.initial_packet.is_some());
        if self.options.queue_capacity < handshake_packets {
            return Err(Error::config(format!(
                "Queue capacity {} cannot hold the {handshake_packets} handshake packets",
                self.options.queue_capacity
            )));
        }
        Ok(())
    }

    fn validate_transports(&self) -> Result<()> {
        if self.options.transports.is_empty() {
            return Err(Error::config(
                "At least one transport must be enabled.\n\
                 Example: Server::builder().transports([TransportKind::Polling])",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let server = ServerBuilder::new().build().expect("valid defaults");
        assert_eq!(server.options(), &ServerOptions::default());
    }

    #[test]
    fn test_builder_sets_options() {
        let server = Server::builder()
            .path("/io")
            .ping_interval(Duration::from_secs(5))
            .ping_timeout(Duration::from_secs(3))
            .http_compression(true)
            .allow_upgrades(false)
            .initial_packet("welcome")
            .build()
            .expect("valid options");

        let options = server.options();
        assert_eq!(options.path, "/io/");
        assert_eq!(options.ping_interval, Duration::from_secs(5));
        assert_eq!(options.ping_timeout, Duration::from_secs(3));
        assert!(options.http_compression);
        assert!(!options.allow_upgrades);
        assert_eq!(options.initial_packet.as_deref(), Some(&b"welcome"[..]));
    }

    #[test]
    fn test_builder_rejects_relative_path() {
        let result = Server::builder().path("engine.io").build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_builder_rejects_zero_ping_interval() {
        let result = Server::builder().ping_interval(Duration::ZERO).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_builder_rejects_zero_queue() {
        let result = Server::builder().queue_capacity(0).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_builder_rejects_queue_smaller_than_handshake() {
        let result = Server::builder()
            .queue_capacity(1)
            .initial_packet("hi")
            .build();
        assert!(matches!(result, Err(Error::Config { .. })));

        assert!(Server::builder().queue_capacity(1).build().is_ok());
        assert!(
            Server::builder()
                .queue_capacity(2)
                .initial_packet("hi")
                .build()
                .is_ok()
        );
    }

    #[test]
    fn test_builder_rejects_no_transports() {
        let result = Server::builder().transports(Vec::new()).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_builder_registers_handlers() {
        let builder = Server::builder()
            .on_connection(|_| {})
            .on_message(|_, _, _| {})
            .on_close(|_| {});

        assert!(builder.handlers.connection.is_some());
        assert!(builder.handlers.message.is_some());
        assert!(builder.handlers.close.is_some());
    }
}

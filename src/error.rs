//! Error types for the Engine.IO server.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use engineio_server::{Result, protocol::payload};
//!
//! fn example(body: &[u8]) -> Result<()> {
//!     let segments = payload::decode_payload(body)?;
//!     assert!(!segments.is_empty());
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Malformed input | [`Error::InvalidPacket`], [`Error::InvalidPayload`] |
//! | Lifecycle signals | [`Error::ChannelClosed`], [`Error::GotClosePacket`] |
//! | Client violations | [`Error::UnknownTransport`], [`Error::UnknownSid`], [`Error::BadHandshakeMethod`], [`Error::BadRequest`], [`Error::Forbidden`] |
//! | Configuration | [`Error::Config`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Base64`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use base64::DecodeError;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Malformed Input
    // ========================================================================
    /// Packet kind byte outside the protocol range.
    ///
    /// Returned when a leading byte does not resolve to a packet kind,
    /// even after ASCII normalisation.
    #[error("Invalid packet: kind byte {byte:#04x}")]
    InvalidPacket {
        /// The offending leading byte.
        byte: u8,
    },

    /// Payload framing could not be decoded.
    ///
    /// Returned for bad length prefixes, truncated segments and
    /// text that never satisfies the claimed UTF-16 length.
    #[error("Invalid payload: {message}")]
    InvalidPayload {
        /// Description of the framing problem.
        message: String,
    },

    // ========================================================================
    // Lifecycle Signals
    // ========================================================================
    /// Transport will not produce any more input.
    #[error("Channel closed")]
    ChannelClosed,

    /// Peer sent a `Close` packet; the transport has been retired.
    #[error("Got close packet")]
    GotClosePacket,

    // ========================================================================
    // Client Violations
    // ========================================================================
    /// Requested transport is not supported or not enabled.
    #[error("Transport unknown: {transport}")]
    UnknownTransport {
        /// The transport name from the query.
        transport: String,
    },

    /// Session id does not resolve in the registry.
    #[error("Session ID unknown: {sid}")]
    UnknownSid {
        /// The session id from the query.
        sid: String,
    },

    /// Handshake attempted with a method other than `GET`.
    #[error("Bad handshake method: {method}")]
    BadHandshakeMethod {
        /// The HTTP method used.
        method: String,
    },

    /// Request is well-formed HTTP but not acceptable for this session.
    #[error("Bad request: {message}")]
    BadRequest {
        /// Description of the problem.
        message: String,
    },

    /// Request refused.
    #[error("Forbidden")]
    Forbidden,

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when server options are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Base64 decoding error.
    #[error("Base64 error: {0}")]
    Base64(#[from] DecodeError),
}

// ============================================================================
// ErrorCode
// ============================================================================

/// Wire error codes sent in JSON error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// `transport` missing or not enabled.
    UnknownTransport = 0,
    /// `sid` not registered.
    UnknownSid = 1,
    /// Handshake with a method other than `GET`.
    BadHandshakeMethod = 2,
    /// Malformed request.
    BadRequest = 3,
    /// Request refused.
    Forbidden = 4,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Returns the code for a number, if known.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::UnknownTransport),
            1 => Some(Self::UnknownSid),
            2 => Some(Self::BadHandshakeMethod),
            3 => Some(Self::BadRequest),
            4 => Some(Self::Forbidden),
            _ => None,
        }
    }

    /// Returns the message sent with the code.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::UnknownTransport => "Transport unknown",
            Self::UnknownSid => "Session ID unknown",
            Self::BadHandshakeMethod => "Bad handshake method",
            Self::BadRequest => "Bad request",
            Self::Forbidden => "Forbidden",
        }
    }
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates an invalid packet error.
    #[inline]
    pub fn invalid_packet(byte: u8) -> Self {
        Self::InvalidPacket { byte }
    }

    /// Creates an invalid payload error.
    #[inline]
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Creates an unknown transport error.
    #[inline]
    pub fn unknown_transport(transport: impl Into<String>) -> Self {
        Self::UnknownTransport {
            transport: transport.into(),
        }
    }

    /// Creates an unknown sid error.
    #[inline]
    pub fn unknown_sid(sid: impl Into<String>) -> Self {
        Self::UnknownSid { sid: sid.into() }
    }

    /// Creates a bad handshake method error.
    #[inline]
    pub fn bad_handshake_method(method: impl Into<String>) -> Self {
        Self::BadHandshakeMethod {
            method: method.into(),
        }
    }

    /// Creates a bad request error.
    #[inline]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` for expected transport lifecycle signals.
    ///
    /// These end a receive loop but are not failures.
    #[inline]
    #[must_use]
    pub fn is_lifecycle_signal(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::GotClosePacket)
    }

    /// Returns `true` if this error comes from malformed wire data.
    #[inline]
    #[must_use]
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidPacket { .. } | Self::InvalidPayload { .. } | Self::Base64(_)
        )
    }

    /// Returns `true` if this is a client protocol violation.
    #[inline]
    #[must_use]
    pub fn is_client_violation(&self) -> bool {
        self.error_code().is_some()
    }

    /// Returns the wire error code for client violations.
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::UnknownTransport { .. } => Some(ErrorCode::UnknownTransport),
            Self::UnknownSid { .. } => Some(ErrorCode::UnknownSid),
            Self::BadHandshakeMethod { .. } => Some(ErrorCode::BadHandshakeMethod),
            Self::BadRequest { .. } => Some(ErrorCode::BadRequest),
            Self::Forbidden => Some(ErrorCode::Forbidden),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_payload("missing separator");
        assert_eq!(err.to_string(), "Invalid payload: missing separator");

        let err = Error::invalid_packet(b'9');
        assert_eq!(err.to_string(), "Invalid packet: kind byte 0x39");
    }

    #[test]
    fn test_is_lifecycle_signal() {
        assert!(Error::ChannelClosed.is_lifecycle_signal());
        assert!(Error::GotClosePacket.is_lifecycle_signal());
        assert!(!Error::Forbidden.is_lifecycle_signal());
    }

    #[test]
    fn test_is_malformed_input() {
        assert!(Error::invalid_packet(42).is_malformed_input());
        assert!(Error::invalid_payload("x").is_malformed_input());
        assert!(!Error::ChannelClosed.is_malformed_input());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::unknown_transport("carrier-pigeon").error_code(),
            Some(ErrorCode::UnknownTransport)
        );
        assert_eq!(
            Error::unknown_sid("abc").error_code(),
            Some(ErrorCode::UnknownSid)
        );
        assert_eq!(
            Error::bad_handshake_method("POST").error_code(),
            Some(ErrorCode::BadHandshakeMethod)
        );
        assert_eq!(
            Error::bad_request("mismatch").error_code(),
            Some(ErrorCode::BadRequest)
        );
        assert_eq!(Error::Forbidden.error_code(), Some(ErrorCode::Forbidden));
        assert_eq!(Error::ChannelClosed.error_code(), None);
        assert!(!Error::config("x").is_client_violation());
    }

    #[test]
    fn test_error_code_numbers() {
        for code in 0..=4 {
            assert_eq!(ErrorCode::from_code(code).unwrap().code(), code);
        }
        assert!(ErrorCode::from_code(5).is_none());
        assert_eq!(ErrorCode::UnknownSid.message(), "Session ID unknown");
    }

    #[test]
    fn test_from_websocket_error() {
        let err: Error = WsError::ConnectionClosed.into();
        assert!(matches!(err, Error::WebSocket(_)));
        assert!(err.error_code().is_none());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::BrokenPipe, "pipe closed");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}

//! Packet model.
//!
//! A packet is one protocol frame: a kind tag plus a binary flag. On the
//! wire the kind occupies a single byte, either as its raw ordinal (binary
//! packet to a binary-capable peer) or as an ASCII digit.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// PacketType
// ============================================================================

/// Protocol frame kinds, with their wire ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Handshake, carries the [`OpenPacket`] JSON.
    Open = 0,
    /// Peer-initiated or server-initiated close.
    Close = 1,
    /// Keep-alive probe from the client.
    Ping = 2,
    /// Reply to [`PacketType::Ping`], echoes its payload.
    Pong = 3,
    /// Application message.
    Message = 4,
    /// Commits a transport upgrade.
    Upgrade = 5,
    /// Does nothing; releases a parked poll.
    Noop = 6,
}

impl PacketType {
    /// Returns the kind for an ordinal in `0..=6`.
    #[inline]
    #[must_use]
    pub const fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Open),
            1 => Some(Self::Close),
            2 => Some(Self::Ping),
            3 => Some(Self::Pong),
            4 => Some(Self::Message),
            5 => Some(Self::Upgrade),
            6 => Some(Self::Noop),
            _ => None,
        }
    }

    /// Returns the wire ordinal.
    #[inline]
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// Returns the kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Message => "message",
            Self::Upgrade => "upgrade",
            Self::Noop => "noop",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Packet
// ============================================================================

/// One protocol frame header. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Packet {
    /// Frame kind.
    pub packet_type: PacketType,
    /// Whether the payload is binary data.
    pub is_binary: bool,
}

impl Packet {
    /// Creates a packet.
    #[inline]
    #[must_use]
    pub const fn new(packet_type: PacketType, is_binary: bool) -> Self {
        Self {
            packet_type,
            is_binary,
        }
    }

    /// Creates a text-mode packet.
    #[inline]
    #[must_use]
    pub const fn text(packet_type: PacketType) -> Self {
        Self::new(packet_type, false)
    }

    /// Creates a binary-mode packet.
    #[inline]
    #[must_use]
    pub const fn binary(packet_type: PacketType) -> Self {
        Self::new(packet_type, true)
    }

    /// Returns `true` if this packet has to be base64-encoded for the peer.
    #[inline]
    #[must_use]
    pub const fn needs_base64(&self, supports_binary: bool) -> bool {
        self.is_binary && !supports_binary
    }

    /// Encodes the kind byte.
    ///
    /// Only a binary packet sent to a binary-capable peer uses the raw
    /// ordinal; everything else uses the ASCII digit.
    #[inline]
    #[must_use]
    pub const fn to_byte(&self, supports_binary: bool) -> u8 {
        let ordinal = self.packet_type.ordinal();
        if self.is_binary && supports_binary {
            ordinal
        } else {
            ordinal + b'0'
        }
    }

    /// Decodes a kind byte.
    ///
    /// A byte in `0..=6` is a raw binary kind. Anything else is taken as an
    /// ASCII digit, in which case the binary flag follows `is_base64`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the byte does not resolve to a kind.
    pub fn from_byte(byte: u8, is_base64: bool) -> Result<Self> {
        if let Some(packet_type) = PacketType::from_ordinal(byte) {
            return Ok(Self::binary(packet_type));
        }

        PacketType::from_ordinal(byte.wrapping_sub(b'0'))
            .map(|packet_type| Self::new(packet_type, is_base64))
            .ok_or_else(|| Error::invalid_packet(byte))
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_binary {
            write!(f, "{}(binary)", self.packet_type)
        } else {
            write!(f, "{}", self.packet_type)
        }
    }
}

// ============================================================================
// OpenPacket
// ============================================================================

/// Body of the `Open` packet sent at handshake.
///
/// # Format
///
/// ```json
/// {
///   "sid": "…",
///   "upgrades": ["websocket"],
///   "pingInterval": 20000,
///   "pingTimeout": 20000
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    /// Session id.
    pub sid: String,
    /// Transports the client may upgrade to.
    pub upgrades: Vec<String>,
    /// Ping interval in milliseconds.
    pub ping_interval: u64,
    /// Ping timeout in milliseconds.
    pub ping_timeout: u64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinals() {
        for ordinal in 0..=6u8 {
            let kind = PacketType::from_ordinal(ordinal).expect("in range");
            assert_eq!(kind.ordinal(), ordinal);
        }
        assert!(PacketType::from_ordinal(7).is_none());
    }

    #[test]
    fn test_to_byte_text_uses_digit() {
        let packet = Packet::text(PacketType::Message);
        assert_eq!(packet.to_byte(true), b'4');
        assert_eq!(packet.to_byte(false), b'4');
    }

    #[test]
    fn test_to_byte_binary() {
        let packet = Packet::binary(PacketType::Message);
        assert_eq!(packet.to_byte(true), 4);
        assert_eq!(packet.to_byte(false), b'4');
    }

    #[test]
    fn test_from_byte_raw_is_binary() {
        let packet = Packet::from_byte(4, false).expect("valid");
        assert_eq!(packet, Packet::binary(PacketType::Message));
    }

    #[test]
    fn test_from_byte_digit() {
        let packet = Packet::from_byte(b'2', false).expect("valid");
        assert_eq!(packet, Packet::text(PacketType::Ping));

        let packet = Packet::from_byte(b'4', true).expect("valid");
        assert_eq!(packet, Packet::binary(PacketType::Message));
    }

    #[test]
    fn test_from_byte_out_of_range() {
        assert!(matches!(
            Packet::from_byte(b'7', false),
            Err(Error::InvalidPacket { byte: b'7' })
        ));
        assert!(Packet::from_byte(b'x', false).is_err());
        assert!(Packet::from_byte(7, false).is_err());
    }

    #[test]
    fn test_open_packet_json() {
        let open = OpenPacket {
            sid: "abc".into(),
            upgrades: vec!["websocket".into()],
            ping_interval: 25000,
            ping_timeout: 5000,
        };
        let json = serde_json::to_string(&open).expect("serialize");
        assert_eq!(
            json,
            r#"{"sid":"abc","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":5000}"#
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Packet::text(PacketType::Noop).to_string(), "noop");
        assert_eq!(
            Packet::binary(PacketType::Message).to_string(),
            "message(binary)"
        );
    }
}

//! Wire protocol: packets and payload framing.
//!
//! # Protocol Overview
//!
//! | Kind | Ordinal | Direction | Purpose |
//! |------|---------|-----------|---------|
//! | `Open` | 0 | Server → Client | Handshake data |
//! | `Close` | 1 | Both | Close the session |
//! | `Ping` | 2 | Client → Server | Keep-alive, upgrade probe |
//! | `Pong` | 3 | Server → Client | Ping reply |
//! | `Message` | 4 | Both | Application data |
//! | `Upgrade` | 5 | Client → Server | Commit transport upgrade |
//! | `Noop` | 6 | Server → Client | Release a parked poll |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `packet` | Packet kinds and the kind byte |
//! | `payload` | Length-prefixed framing and base64 smuggling |

// ============================================================================
// Submodules
// ============================================================================

/// Packet kinds and the handshake body.
pub mod packet;

/// Payload encoding and decoding.
pub mod payload;

// ============================================================================
// Re-exports
// ============================================================================

pub use packet::{OpenPacket, Packet, PacketType};
pub use payload::{EncodedPayload, Frame};

// ============================================================================
// Constants
// ============================================================================

/// Payload of the `Ping` a client sends to verify a candidate transport.
pub const PROBE: &[u8] = b"probe";

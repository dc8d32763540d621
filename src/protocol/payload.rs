//! Payload codec.
//!
//! Encodes one packet per WebSocket frame, or many packets into one
//! length-prefixed body for long-polling.
//!
//! # Framing
//!
//! Text payload (every packet text, or peer without binary support):
//!
//! ```text
//! <decimal length>:<kind digit><text>
//! <decimal length>:b<kind digit><base64>
//! ```
//!
//! The length counts UTF-16 code units, as a browser string would, plus
//! one for the kind character.
//!
//! Binary payload (XHR2, at least one binary packet and a binary peer):
//!
//! ```text
//! 0x00 <length digits as raw bytes> 0xFF <kind digit><text>
//! 0x01 <length digits as raw bytes> 0xFF <raw kind><bytes>
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::str;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use tracing::{trace, warn};

use crate::error::{Error, Result};

use super::packet::Packet;

// ============================================================================
// Constants
// ============================================================================

/// Marker preceding a string segment in a binary payload.
pub const STRING_MARKER: u8 = 0x00;

/// Marker preceding a binary segment in a binary payload.
pub const BINARY_MARKER: u8 = 0x01;

/// Terminates the length digits of a binary payload segment.
pub const LENGTH_TERMINATOR: u8 = 0xFF;

/// Marks a base64-encoded binary packet on a text channel.
pub const BASE64_MARKER: u8 = b'b';

/// Separates the decimal length from the segment in a text payload.
const LENGTH_SEPARATOR: u8 = b':';

/// Content type of a binary poll response.
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type of a text poll response.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

// ============================================================================
// Types
// ============================================================================

/// One packet together with its payload bytes.
pub type Frame = (Packet, Bytes);

/// Result of encoding a batch of packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    /// Encoded body.
    pub body: Vec<u8>,
    /// Whether the body uses binary framing.
    pub is_binary: bool,
}

impl EncodedPayload {
    /// Returns the HTTP content type for this body.
    #[inline]
    #[must_use]
    pub const fn content_type(&self) -> &'static str {
        if self.is_binary {
            BINARY_CONTENT_TYPE
        } else {
            TEXT_CONTENT_TYPE
        }
    }
}

// ============================================================================
// Length Rule
// ============================================================================

/// Counts the UTF-16 code units `text` occupies as a browser string.
///
/// One unit per code point, plus one for every code point that needs a
/// surrogate pair.
///
/// # Errors
///
/// Returns [`Error::InvalidPayload`] if `text` is not valid UTF-8.
pub fn utf16_len(text: &[u8]) -> Result<usize> {
    let text = str::from_utf8(text)
        .map_err(|_| Error::invalid_payload("text packet is not valid UTF-8"))?;
    Ok(utf16_units(text))
}

#[inline]
fn utf16_units(text: &str) -> usize {
    let runes = text.chars().count();
    let surrogates = text.chars().filter(|c| c.len_utf16() == 2).count();
    runes + surrogates
}

/// Returns the value carried in the length prefix of one packet.
///
/// # Errors
///
/// Returns [`Error::InvalidPayload`] if a text packet is not valid UTF-8.
pub fn encoded_length(packet: &Packet, data: &[u8], supports_binary: bool) -> Result<usize> {
    if packet.is_binary && supports_binary {
        Ok(data.len() + 1)
    } else if packet.is_binary {
        // 'b' marker plus kind digit
        Ok(base64::encoded_len(data.len(), true).unwrap_or(usize::MAX) + 2)
    } else {
        Ok(utf16_len(data)? + 1)
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Writes the kind byte, preceded by `'b'` if the packet is base64-encoded.
pub fn write_header(out: &mut Vec<u8>, packet: &Packet, supports_binary: bool) {
    if packet.needs_base64(supports_binary) {
        out.push(BASE64_MARKER);
    }
    out.push(packet.to_byte(supports_binary));
}

/// Writes the payload bytes, base64-encoding them if required.
pub fn write_body(out: &mut Vec<u8>, packet: &Packet, data: &[u8], supports_binary: bool) {
    if packet.needs_base64(supports_binary) {
        out.extend_from_slice(STANDARD.encode(data).as_bytes());
    } else {
        out.extend_from_slice(data);
    }
}

/// Encodes a single packet without a length prefix (one WebSocket frame).
#[must_use]
pub fn encode_packet(packet: &Packet, data: &[u8], supports_binary: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    write_header(&mut out, packet, supports_binary);
    write_body(&mut out, packet, data, supports_binary);
    out
}

/// Encodes a batch of packets into one poll response body.
///
/// The body uses binary framing when the peer supports binary and at least
/// one packet is binary; otherwise every packet is framed as text.
///
/// # Errors
///
/// Returns [`Error::InvalidPayload`] if a text packet is not valid UTF-8.
pub fn encode_payload(frames: &[Frame], supports_binary: bool) -> Result<EncodedPayload> {
    let is_binary = supports_binary && frames.iter().any(|(packet, _)| packet.is_binary);
    let mut body = Vec::new();

    for (packet, data) in frames {
        let length = encoded_length(packet, data, supports_binary)?;

        if is_binary {
            body.push(if packet.is_binary {
                BINARY_MARKER
            } else {
                STRING_MARKER
            });
            body.extend(length.to_string().bytes().map(|digit| digit - b'0'));
            body.push(LENGTH_TERMINATOR);
        } else {
            body.extend_from_slice(length.to_string().as_bytes());
            body.push(LENGTH_SEPARATOR);
        }

        write_header(&mut body, packet, supports_binary);
        write_body(&mut body, packet, data, supports_binary);
    }

    trace!(packets = frames.len(), bytes = body.len(), is_binary, "Payload encoded");

    Ok(EncodedPayload { body, is_binary })
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes a single packet (one WebSocket frame or one payload segment).
///
/// # Errors
///
/// - [`Error::InvalidPayload`] if the frame is empty
/// - [`Error::InvalidPacket`] if the kind byte is out of range
/// - [`Error::Base64`] if a `'b'` packet does not carry valid base64
pub fn decode_packet(frame: &[u8]) -> Result<Frame> {
    let (&first, rest) = frame
        .split_first()
        .ok_or_else(|| Error::invalid_payload("empty packet"))?;

    if first == BASE64_MARKER {
        let (&kind, encoded) = rest
            .split_first()
            .ok_or_else(|| Error::invalid_payload("base64 packet without kind"))?;
        let packet = Packet::from_byte(kind, true)?;
        let data = STANDARD.decode(encoded)?;
        return Ok((packet, Bytes::from(data)));
    }

    let packet = Packet::from_byte(first, false)?;
    Ok((packet, Bytes::copy_from_slice(rest)))
}

/// Splits a multi-packet payload into its segments.
///
/// Each returned slice is one encoded packet, ready for [`decode_packet`].
///
/// # Errors
///
/// Returns [`Error::InvalidPayload`] on a bad length prefix, a truncated
/// segment, or text that never matches its claimed UTF-16 length.
pub fn decode_payload(payload: &[u8]) -> Result<Vec<&[u8]>> {
    let mut segments = Vec::new();
    let mut rest = payload;

    while let Some(&first) = rest.first() {
        let (segment, remaining) = match first {
            STRING_MARKER | BINARY_MARKER => {
                let (length, after_prefix) = read_binary_length(&rest[1..])?;
                if first == BINARY_MARKER {
                    if length > after_prefix.len() {
                        return Err(Error::invalid_payload("binary segment is truncated"));
                    }
                    after_prefix.split_at(length)
                } else {
                    let byte_len = scan_text_segment(after_prefix, length)?;
                    after_prefix.split_at(byte_len)
                }
            }
            _ => {
                let (length, after_prefix) = read_decimal_length(rest)?;
                let byte_len = scan_text_segment(after_prefix, length)?;
                after_prefix.split_at(byte_len)
            }
        };

        segments.push(segment);
        rest = remaining;
    }

    Ok(segments)
}

/// Decodes every packet of a payload, skipping segments that fail.
///
/// # Errors
///
/// Returns [`Error::InvalidPayload`] if the framing itself is broken.
pub fn decode_frames(payload: &[u8]) -> Result<Vec<Frame>> {
    let segments = decode_payload(payload)?;
    let mut frames = Vec::with_capacity(segments.len());

    for segment in segments {
        match decode_packet(segment) {
            Ok(frame) => frames.push(frame),
            Err(e) => warn!(error = %e, "Skipping undecodable packet in payload"),
        }
    }

    Ok(frames)
}

/// Reads `<digits>:` and returns the length plus the bytes after `:`.
fn read_decimal_length(input: &[u8]) -> Result<(usize, &[u8])> {
    let mut length: usize = 0;

    for (index, &byte) in input.iter().enumerate() {
        if byte == LENGTH_SEPARATOR {
            return Ok((length, &input[index + 1..]));
        }
        if !byte.is_ascii_digit() {
            return Err(Error::invalid_payload(format!(
                "unexpected byte {byte:#04x} in length prefix"
            )));
        }
        length = push_digit(length, byte - b'0')?;
    }

    Err(Error::invalid_payload("length prefix without separator"))
}

/// Reads raw digit bytes up to `0xFF` and returns the length plus the rest.
fn read_binary_length(input: &[u8]) -> Result<(usize, &[u8])> {
    let mut length: usize = 0;

    for (index, &byte) in input.iter().enumerate() {
        if byte == LENGTH_TERMINATOR {
            return Ok((length, &input[index + 1..]));
        }
        if byte > 9 {
            return Err(Error::invalid_payload(format!(
                "unexpected byte {byte:#04x} in binary length prefix"
            )));
        }
        length = push_digit(length, byte)?;
    }

    Err(Error::invalid_payload("binary length prefix without terminator"))
}

#[inline]
fn push_digit(length: usize, digit: u8) -> Result<usize> {
    length
        .checked_mul(10)
        .and_then(|l| l.checked_add(usize::from(digit)))
        .ok_or_else(|| Error::invalid_payload("length prefix overflows"))
}

/// Finds the byte length of a text segment claimed to be `units` long.
///
/// The UTF-8 byte length is unknown up front. The candidate slice grows
/// until it is valid UTF-8 and its UTF-16 length equals `units`.
fn scan_text_segment(input: &[u8], units: usize) -> Result<usize> {
    // Every UTF-16 unit takes at least one UTF-8 byte.
    let mut candidate = units;

    while candidate <= input.len() {
        match str::from_utf8(&input[..candidate]) {
            Ok(text) => {
                let counted = utf16_units(text);
                if counted == units {
                    return Ok(candidate);
                }
                if counted > units {
                    break;
                }
                candidate += units - counted;
            }
            // Cut inside a code point: one more byte may complete it.
            Err(e) if e.error_len().is_none() => candidate += 1,
            Err(_) => {
                return Err(Error::invalid_payload("text segment is not valid UTF-8"));
            }
        }
    }

    Err(Error::invalid_payload(format!(
        "no text segment of {units} UTF-16 units"
    )))
}

// ============================================================================
// Tests
// ============================================================================

//! Type-safe identifiers.
//!
//! Newtype wrappers keep session ids from being confused with other
//! strings flowing through the request path.

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Borrow;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;

// ============================================================================
// Constants
// ============================================================================

/// Number of random bytes in a generated session id (192 bits).
const SESSION_ID_BYTES: usize = 24;

// ============================================================================
// SessionId
// ============================================================================

/// Server-generated, unguessable identifier of one client session.
///
/// Generated ids are 24 random bytes, URL-safe base64 encoded.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random session id.
    ///
    /// Uses the thread-local cryptographically secure generator.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        Self(URL_SAFE.encode(bytes))
    }

    /// Wraps an id received from a client (`sid` query parameter).
    #[inline]
    #[must_use]
    pub fn from_client(sid: impl Into<String>) -> Self {
        Self(sid.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use rustc_hash::FxHashSet;

    #[test]
    fn test_generate_length_and_alphabet() {
        let id = SessionId::generate();
        // 24 bytes encode to exactly 32 base64 characters, no padding.
        assert_eq!(id.as_str().len(), 32);
        assert!(
            id.as_str()
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        );
    }

    #[test]
    fn test_generate_is_unique() {
        let ids: FxHashSet<SessionId> = (0..1000).map(|_| SessionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_from_client_roundtrip() {
        let id = SessionId::from_client("abc123");
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(id.to_string(), "abc123");
        assert_eq!(format!("{id:?}"), "SessionId(abc123)");
    }

    #[test]
    fn test_borrow_as_str_for_lookup() {
        let mut set = FxHashSet::default();
        set.insert(SessionId::from_client("sid-1"));
        assert!(set.contains("sid-1"));
    }
}

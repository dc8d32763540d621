//! Session registry.
//!
//! Maps session ids to live sockets. Lookups take the read lock and may
//! run concurrently; handshakes and evictions take the write lock.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           SessionRegistry               │
//! │  ┌─────────────────────────────────┐    │
//! │  │ "kx3Q…" → Socket (polling)      │    │
//! │  │ "Zp0a…" → Socket (websocket)    │    │
//! │  └─────────────────────────────────┘    │
//! └─────────────────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::identifiers::SessionId;

use super::socket::Socket;

// ============================================================================
// SessionRegistry
// ============================================================================

/// Live sockets keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sockets: RwLock<FxHashMap<SessionId, Socket>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a socket under its session id.
    pub fn insert(&self, socket: Socket) {
        let id = socket.id().clone();
        self.sockets.write().insert(id.clone(), socket);
        debug!(sid = %id, "Session registered");
    }

    /// Looks up a socket.
    #[must_use]
    pub fn get(&self, sid: &str) -> Option<Socket> {
        self.sockets.read().get(sid).cloned()
    }

    /// Removes a socket. Returns it if it was registered.
    pub fn remove(&self, sid: &str) -> Option<Socket> {
        let removed = self.sockets.write().remove(sid);
        if removed.is_some() {
            debug!(sid, "Session evicted");
        }
        removed
    }

    /// Returns the number of live sessions.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.sockets.read().len()
    }

    /// Returns `true` if no session is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sockets.read().is_empty()
    }

    /// Removes and returns every socket.
    pub fn drain(&self) -> Vec<Socket> {
        let mut sockets = self.sockets.write();
        sockets.drain().map(|(_, socket)| socket).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::server::ServerOptions;
    use crate::server::socket::{Handlers, SocketContext};
    use crate::transport::{Polling, PollingOptions, Transport};

    fn socket(registry: &Arc<SessionRegistry>) -> Socket {
        let context = SocketContext {
            options: Arc::new(ServerOptions::new()),
            handlers: Handlers::default(),
            registry: Arc::downgrade(registry),
            remote_addr: None,
        };
        let transport = Transport::Polling(Polling::new(PollingOptions::default()));
        Socket::new(SessionId::generate(), transport, context)
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = Arc::new(SessionRegistry::new());
        assert!(registry.is_empty());

        let socket = socket(&registry);
        let sid = socket.id().to_string();
        registry.insert(socket);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&sid).map(|s| s.id().to_string()), Some(sid.clone()));
        assert!(registry.get("unknown").is_none());

        assert!(registry.remove(&sid).is_some());
        assert!(registry.remove(&sid).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_drain_empties_registry() {
        let registry = Arc::new(SessionRegistry::new());
        for _ in 0..3 {
            registry.insert(socket(&registry));
        }

        let drained = registry.drain();
        assert_eq!(drained.len(), 3);
        assert!(registry.is_empty());
    }
}

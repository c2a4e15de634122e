//! Server state management.
//!
//! Holds the live-connection registry: `user_id → (connection_id, sender)`.
//! The registry is process-local, in-memory state mutated only by the
//! connect/disconnect handlers — it is not a source of truth for message
//! history (that is the [`crate::store::MessageStore`]).
//!
//! Policy: single active connection per user. A reconnect supersedes the
//! previous connection; a stale disconnect for an already-superseded
//! connection must not evict the newer one, which is why disconnects are
//! keyed by (user, connection) rather than user alone.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::protocol::ServerMessage;
use crate::store::MessageStore;

/// A connected client's outbound channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Registry entry for one user's live connection.
#[derive(Clone)]
pub struct ConnectionEntry {
    /// Identifier of the transport connection currently owning the entry
    pub connection_id: String,
    /// Channel to the connection's sender task
    pub sender: ClientSender,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen port
    pub port: u16,
    /// SQLite path; None = in-memory (tests, throwaway instances)
    pub db_path: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: None,
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// user_id → live connection. At most one entry per user.
    connections: Arc<DashMap<String, ConnectionEntry>>,

    /// Durable message / profile / key storage.
    pub store: MessageStore,

    /// Server configuration.
    pub config: RelayConfig,
}

impl RelayState {
    /// Create a new relay state.
    pub fn new(config: RelayConfig, store: MessageStore) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            store,
            config,
        }
    }

    // ── Connection Registry ───────────────────────────────────────────────

    /// Register a user's connection, superseding any previous one.
    pub fn register_connection(&self, user_id: &str, connection_id: &str, sender: ClientSender) {
        let previous = self.connections.insert(
            user_id.to_string(),
            ConnectionEntry {
                connection_id: connection_id.to_string(),
                sender,
            },
        );
        match previous {
            Some(old) => tracing::info!(
                user_id = user_id,
                connection_id = connection_id,
                superseded = old.connection_id.as_str(),
                "Connection replaced"
            ),
            None => tracing::info!(
                user_id = user_id,
                connection_id = connection_id,
                "User connected"
            ),
        }
    }

    /// Remove a user's registry entry, but only if it still belongs to
    /// `connection_id`. A stale disconnect for a superseded connection is
    /// a no-op. Returns whether an entry was removed.
    pub fn unregister_connection(&self, user_id: &str, connection_id: &str) -> bool {
        let removed = self
            .connections
            .remove_if(user_id, |_, entry| entry.connection_id == connection_id)
            .is_some();
        if removed {
            tracing::info!(
                user_id = user_id,
                connection_id = connection_id,
                "User disconnected"
            );
        } else {
            tracing::debug!(
                user_id = user_id,
                connection_id = connection_id,
                "Ignored stale disconnect"
            );
        }
        removed
    }

    /// Whether a user currently has a live connection.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    /// Deliver a message to a user's live connection, if any.
    /// Returns true on success; an offline user simply yields false.
    pub fn send_to_user(&self, user_id: &str, message: ServerMessage) -> bool {
        if let Some(entry) = self.connections.get(user_id) {
            entry.sender.send(message).is_ok()
        } else {
            false
        }
    }

    /// Number of currently connected users.
    pub fn online_count(&self) -> usize {
        self.connections.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RelayState {
        RelayState::new(RelayConfig::default(), MessageStore::open(None).unwrap())
    }

    #[test]
    fn test_register_and_unregister() {
        let state = state();
        let (tx, _rx) = mpsc::unbounded_channel();

        state.register_connection("alice", "conn-1", tx);
        assert!(state.is_online("alice"));
        assert_eq!(state.online_count(), 1);

        assert!(state.unregister_connection("alice", "conn-1"));
        assert!(!state.is_online("alice"));
        assert_eq!(state.online_count(), 0);
    }

    #[test]
    fn test_reconnect_supersedes() {
        let state = state();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        state.register_connection("alice", "conn-1", tx1);
        state.register_connection("alice", "conn-2", tx2);
        assert_eq!(state.online_count(), 1);

        // Delivery goes to the newer connection
        assert!(state.send_to_user("alice", ServerMessage::Pong));
        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv().unwrap(), ServerMessage::Pong));
    }

    #[test]
    fn test_stale_disconnect_does_not_evict_newer_connection() {
        let state = state();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        state.register_connection("alice", "conn-1", tx1);
        state.register_connection("alice", "conn-2", tx2);

        // conn-1's disconnect arrives after conn-2 registered
        assert!(!state.unregister_connection("alice", "conn-1"));
        assert!(state.is_online("alice"));

        assert!(state.unregister_connection("alice", "conn-2"));
        assert!(!state.is_online("alice"));
    }

    #[test]
    fn test_send_to_offline_user_returns_false() {
        let state = state();
        assert!(!state.send_to_user("nobody", ServerMessage::Pong));
    }
}

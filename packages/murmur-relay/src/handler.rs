//! WebSocket connection handler.
//!
//! Runs one task per connection: registers the authenticated user in the
//! connection registry, forwards outbound messages through a sender task,
//! and processes inbound `send_message` events until disconnect.
//!
//! The user identity comes from the connection-time `userId` query
//! parameter, supplied by the authentication collaborator; the relay
//! trusts it without re-verifying.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use murmur_core::codec::{self, ChatMessage};

use crate::protocol::{ClientMessage, DeliveredMessage, ServerMessage};
use crate::state::RelayState;
use crate::store::StoredMessage;

/// Handle a single WebSocket connection for an authenticated user.
pub async fn handle_websocket(socket: WebSocket, state: RelayState, user_id: String) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound channel for this client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.register_connection(&user_id, &connection_id, tx);

    // Sender task: serialize and forward everything queued for this client
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize server message");
                }
            }
        }
    });

    // Inbound loop
    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::SendMessage { message }) => {
                    process_send(&state, &user_id, message);
                }
                Ok(ClientMessage::Ping) => {
                    state.send_to_user(&user_id, ServerMessage::Pong);
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = user_id.as_str(),
                        error = %e,
                        "Failed to parse client message"
                    );
                    state.send_to_user(
                        &user_id,
                        ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        },
                    );
                }
            },
            Ok(Message::Ping(_)) => {
                // Axum answers transport pings at the protocol level
            }
            Ok(Message::Close(_)) => {
                tracing::debug!(user_id = user_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(user_id = user_id.as_str(), error = %e, "WebSocket error");
                break;
            }
            _ => {} // Binary, Pong — ignore
        }
    }

    // Stale-safe cleanup: only evicts the registry entry if this
    // connection still owns it.
    state.unregister_connection(&user_id, &connection_id);
    sender_task.abort();
}

/// Handle an outbound send: validate, persist, enrich, fan out.
///
/// Persistence failure aborts delivery — a message that was not durably
/// stored is never fanned out, and the sender is told the send failed.
/// An offline receiver is not an error; that delivery leg is skipped and
/// the message remains retrievable via history fetch.
pub(crate) fn process_send(state: &RelayState, from: &str, mut message: ChatMessage) {
    // The connection identity is authoritative for the sender field.
    if message.sender.is_empty() {
        message.sender = from.to_string();
    } else if message.sender != from {
        tracing::warn!(
            user_id = from,
            claimed = message.sender.as_str(),
            "Rejected send with mismatched sender"
        );
        state.send_to_user(
            from,
            ServerMessage::Error {
                message: "sender does not match connection identity".into(),
            },
        );
        return;
    }

    if let Err(e) = codec::validate_for_send(&message) {
        tracing::warn!(user_id = from, error = %e, "Rejected invalid message");
        state.send_to_user(
            from,
            ServerMessage::Error {
                message: e.to_string(),
            },
        );
        return;
    }

    // Persist before any delivery
    let stored = match state.store.save_message(&message) {
        Ok(stored) => stored,
        Err(e) => {
            tracing::error!(user_id = from, error = %e, "Failed to persist message");
            state.send_to_user(
                from,
                ServerMessage::Error {
                    message: "message could not be stored; not delivered".into(),
                },
            );
            return;
        }
    };

    let delivered = enrich(state, stored);

    // One copy each to sender and receiver (deduplicated, so a user
    // messaging themselves receives a single delivery).
    let receiver = delivered.receiver.user_id.clone();
    let mut targets = vec![delivered.sender.user_id.clone()];
    if receiver != targets[0] {
        targets.push(receiver);
    }

    for target in targets {
        let sent = state.send_to_user(
            &target,
            ServerMessage::ReceiveMessage {
                message: delivered.clone(),
            },
        );
        if !sent {
            tracing::debug!(
                target = target.as_str(),
                message_id = delivered.id.as_str(),
                "Target offline; message available via history"
            );
        }
    }
}

/// Attach sender/receiver public profile fields to a stored message.
fn enrich(state: &RelayState, stored: StoredMessage) -> DeliveredMessage {
    DeliveredMessage {
        id: stored.id,
        sender: state.store.profile(&stored.sender),
        receiver: state.store.profile(&stored.receiver),
        message_type: stored.message_type,
        message: stored.message,
        file_url: stored.file_url,
        encrypted: stored.encrypted,
        session_key_id: stored.session_key_id,
        encrypted_session_key: stored.encrypted_session_key,
        iv: stored.iv,
        timestamp: stored.timestamp,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RelayConfig;
    use crate::store::{MessageStore, UserProfile};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn state() -> RelayState {
        RelayState::new(RelayConfig::default(), MessageStore::open(None).unwrap())
    }

    fn connect(state: &RelayState, user_id: &str, conn_id: &str) -> UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.register_connection(user_id, conn_id, tx);
        rx
    }

    fn recv_delivery(rx: &mut UnboundedReceiver<ServerMessage>) -> DeliveredMessage {
        match rx.try_recv().expect("expected a queued message") {
            ServerMessage::ReceiveMessage { message } => message,
            other => panic!("expected receive_message, got {:?}", other),
        }
    }

    #[test]
    fn test_fan_out_to_sender_and_receiver() {
        let state = state();
        let mut alice_rx = connect(&state, "alice", "conn-a");
        let mut bob_rx = connect(&state, "bob", "conn-b");

        process_send(&state, "alice", ChatMessage::text("alice", "bob", "hi bob"));

        let to_alice = recv_delivery(&mut alice_rx);
        let to_bob = recv_delivery(&mut bob_rx);
        assert_eq!(to_alice, to_bob);
        assert_eq!(to_alice.sender.user_id, "alice");
        assert_eq!(to_alice.receiver.user_id, "bob");
        assert_eq!(to_alice.message.as_deref(), Some("hi bob"));

        // Exactly one copy each
        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err());
    }

    #[test]
    fn test_offline_receiver_gets_history_not_delivery() {
        let state = state();
        let mut alice_rx = connect(&state, "alice", "conn-a");

        process_send(&state, "alice", ChatMessage::text("alice", "bob", "hello?"));

        // Sender still gets the echo
        let echo = recv_delivery(&mut alice_rx);
        assert_eq!(echo.message.as_deref(), Some("hello?"));

        // And the message is retrievable via history
        let history = state.store.conversation("alice", "bob").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message.as_deref(), Some("hello?"));
    }

    #[test]
    fn test_self_message_delivers_once() {
        let state = state();
        let mut alice_rx = connect(&state, "alice", "conn-a");

        process_send(&state, "alice", ChatMessage::text("alice", "alice", "note"));

        recv_delivery(&mut alice_rx);
        assert!(alice_rx.try_recv().is_err(), "self-message delivered twice");
    }

    #[test]
    fn test_missing_receiver_rejected() {
        let state = state();
        let mut alice_rx = connect(&state, "alice", "conn-a");

        let mut msg = ChatMessage::text("alice", "bob", "hi");
        msg.receiver = String::new();
        process_send(&state, "alice", msg);

        assert!(matches!(
            alice_rx.try_recv().unwrap(),
            ServerMessage::Error { .. }
        ));
        assert_eq!(state.store.message_count(), 0);
    }

    #[test]
    fn test_sender_mismatch_rejected() {
        let state = state();
        let mut mallory_rx = connect(&state, "mallory", "conn-m");
        let _bob_rx = connect(&state, "bob", "conn-b");

        process_send(&state, "mallory", ChatMessage::text("alice", "bob", "hi"));

        assert!(matches!(
            mallory_rx.try_recv().unwrap(),
            ServerMessage::Error { .. }
        ));
        assert_eq!(state.store.message_count(), 0);
    }

    #[test]
    fn test_invalid_envelope_rejected() {
        let state = state();
        let mut alice_rx = connect(&state, "alice", "conn-a");

        let mut msg = ChatMessage::text("alice", "bob", "Y2lwaGVydGV4dA==");
        msg.encrypted = true; // declared encrypted, but no sessionKeyId/iv
        process_send(&state, "alice", msg);

        assert!(matches!(
            alice_rx.try_recv().unwrap(),
            ServerMessage::Error { .. }
        ));
        assert_eq!(state.store.message_count(), 0);
    }

    #[test]
    fn test_empty_sender_defaults_to_connection_identity() {
        let state = state();
        let mut alice_rx = connect(&state, "alice", "conn-a");

        let mut msg = ChatMessage::text("", "bob", "hi");
        msg.sender = String::new();
        process_send(&state, "alice", msg);

        let echo = recv_delivery(&mut alice_rx);
        assert_eq!(echo.sender.user_id, "alice");
    }

    #[test]
    fn test_enrichment_carries_profiles() {
        let state = state();
        state
            .store
            .upsert_profile(&UserProfile {
                user_id: "alice".into(),
                name: Some("Alice".into()),
                user_name: Some("alice01".into()),
                profile_picture: None,
                bio: None,
            })
            .unwrap();
        let mut bob_rx = connect(&state, "bob", "conn-b");

        process_send(&state, "alice", ChatMessage::text("alice", "bob", "hi"));

        let delivered = recv_delivery(&mut bob_rx);
        assert_eq!(delivered.sender.name.as_deref(), Some("Alice"));
        // Receiver never stored a profile: bare fallback
        assert_eq!(delivered.receiver, UserProfile::bare("bob"));
    }

    #[test]
    fn test_encrypted_message_relayed_opaquely() {
        let state = state();
        let _alice_rx = connect(&state, "alice", "conn-a");
        let mut bob_rx = connect(&state, "bob", "conn-b");

        let mut msg = ChatMessage::text("alice", "bob", "b2hubyBjaXBoZXJ0ZXh0");
        msg.encrypted = true;
        msg.session_key_id = Some("key-1".into());
        msg.encrypted_session_key = Some("wrapped".into());
        msg.iv = Some("aXZpdml2aXZpdg==".into());
        process_send(&state, "alice", msg);

        let delivered = recv_delivery(&mut bob_rx);
        assert!(delivered.encrypted);
        assert_eq!(delivered.message.as_deref(), Some("b2hubyBjaXBoZXJ0ZXh0"));
        assert_eq!(delivered.session_key_id.as_deref(), Some("key-1"));
        assert_eq!(delivered.encrypted_session_key.as_deref(), Some("wrapped"));
    }
}

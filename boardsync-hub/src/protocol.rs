//! Binary wire protocol for hub ↔ client traffic.
//!
//! Messages are bincode-encoded and travel as WebSocket binary frames.
//! Requests flow client → hub; the hub answers lock requests directly
//! on the requesting connection (correlated by `request_id`) and fans
//! everything else out as [`ServerMessage`]s.
//!
//! Cross-instance relay wraps a pre-encoded [`ServerMessage`] in a
//! [`Frame`] carrying the originating connection id, so each instance
//! can decide locally whether the originator hears its own message.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use boardsync_core::{Board, BoardEvent, User};

/// A message submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// `presence:join` — announce identity, go online.
    Join(User),
    /// `presence:heartbeat` — refresh the presence record.
    Heartbeat(User),
    /// One of the `card:*` board mutations.
    Mutate(BoardEvent),
    /// `edit:lock` — request exclusive edit rights on a card. The
    /// hub replies with `edit:lock:ok` or `edit:lock:denied` carrying
    /// the same `request_id`.
    Lock { request_id: u64, card_id: String },
    /// `edit:unlock` — release a held lock.
    Unlock { card_id: String },
}

impl ClientRequest {
    /// Wire name of this request kind (used in logs).
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::Join(_) => "presence:join",
            ClientRequest::Heartbeat(_) => "presence:heartbeat",
            ClientRequest::Mutate(event) => event.kind(),
            ClientRequest::Lock { .. } => "edit:lock",
            ClientRequest::Unlock { .. } => "edit:unlock",
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// A message delivered by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// `board:init` — full snapshot, sent once on connect.
    Init(Board),
    /// A `card:*` mutation accepted by the hub. Delivered to every
    /// connection including the sender, so the sender's optimistic
    /// local change is reconciled against the confirmed version.
    Event(BoardEvent),
    /// `presence:join`, to everyone but the joiner.
    PeerJoined(User),
    /// `presence:leave`, to everyone but the leaver.
    PeerLeft { user_id: String },
    /// `edit:lock`, to everyone but the new holder.
    Locked {
        card_id: String,
        user_id: String,
        user_name: String,
    },
    /// `edit:unlock`, to everyone but the releaser.
    Unlocked { card_id: String, user_id: String },
    /// `edit:lock:ok` — direct reply to the requester.
    LockGranted { request_id: u64, card_id: String },
    /// `edit:lock:denied` — direct reply to the requester.
    LockDenied { request_id: u64, card_id: String },
}

impl ServerMessage {
    /// Wire name of this message kind (used in logs).
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Init(_) => "board:init",
            ServerMessage::Event(event) => event.kind(),
            ServerMessage::PeerJoined(_) => "presence:join",
            ServerMessage::PeerLeft { .. } => "presence:leave",
            ServerMessage::Locked { .. } => "edit:lock",
            ServerMessage::Unlocked { .. } => "edit:unlock",
            ServerMessage::LockGranted { .. } => "edit:lock:ok",
            ServerMessage::LockDenied { .. } => "edit:lock:denied",
        }
    }

    /// Whether fan-out of this message skips the originating
    /// connection. Board mutations echo back to the sender; presence
    /// and lock notifications do not — the originator already knows
    /// the outcome (join/unlock locally, lock via the direct reply).
    pub fn excludes_origin(&self) -> bool {
        matches!(
            self,
            ServerMessage::PeerJoined(_)
                | ServerMessage::PeerLeft { .. }
                | ServerMessage::Locked { .. }
                | ServerMessage::Unlocked { .. }
        )
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// One fan-out unit: a pre-encoded [`ServerMessage`] plus the routing
/// metadata needed to evaluate sender exclusion at delivery time.
///
/// The message is encoded once at publish time and the same bytes are
/// handed to every local connection.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Connection that triggered the message. `Uuid::nil()` for
    /// hub-originated traffic (expiry sweeps), which matches no
    /// connection and therefore excludes nobody.
    pub origin: Uuid,
    /// Evaluated from [`ServerMessage::excludes_origin`] at publish
    /// time so delivery never has to decode the payload.
    pub exclude_origin: bool,
    /// Encoded [`ServerMessage`], ready for the wire.
    pub wire: Arc<Vec<u8>>,
}

impl Frame {
    /// Build a frame from a message, encoding it once.
    pub fn new(origin: Uuid, message: &ServerMessage) -> Result<Self, ProtocolError> {
        Ok(Self {
            origin,
            exclude_origin: message.excludes_origin(),
            wire: Arc::new(message.encode()?),
        })
    }

    /// Whether this frame should be delivered to the given connection.
    pub fn is_for(&self, connection_id: Uuid) -> bool {
        !(self.exclude_origin && self.origin == connection_id)
    }

    /// Serialize for the cross-instance relay channel.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(
            &(self.origin, self.exclude_origin, self.wire.as_slice()),
            bincode::config::standard(),
        )
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the cross-instance relay channel.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let ((origin, exclude_origin, wire), _): ((Uuid, bool, Vec<u8>), usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(Self {
            origin,
            exclude_origin,
            wire: Arc::new(wire),
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Request timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use boardsync_core::Card;

    fn user() -> User {
        User {
            id: "u1".to_string(),
            name: "Alice".to_string(),
            color: "#e91e63".to_string(),
        }
    }

    fn card() -> Card {
        Card {
            id: "c1".to_string(),
            column_id: "col-todo".to_string(),
            title: "Ship it".to_string(),
            description: String::new(),
            order: 0,
            comments: Vec::new(),
            created_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_client_request_roundtrip() {
        let req = ClientRequest::Lock {
            request_id: 42,
            card_id: "c1".to_string(),
        };
        let decoded = ClientRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.kind(), "edit:lock");
    }

    #[test]
    fn test_mutation_request_roundtrip() {
        let req = ClientRequest::Mutate(BoardEvent::CardCreate(card()));
        let decoded = ClientRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.kind(), "card:create");
    }

    #[test]
    fn test_server_message_roundtrip() {
        let msg = ServerMessage::Locked {
            card_id: "c1".to_string(),
            user_id: "u1".to_string(),
            user_name: "Alice".to_string(),
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), "edit:lock");
    }

    #[test]
    fn test_init_roundtrip_carries_full_board() {
        let mut board = Board::default();
        board.cards.push(card());
        let msg = ServerMessage::Init(board.clone());
        match ServerMessage::decode(&msg.encode().unwrap()).unwrap() {
            ServerMessage::Init(decoded) => assert_eq!(decoded, board),
            other => panic!("expected Init, got {other:?}"),
        }
    }

    #[test]
    fn test_origin_exclusion_matrix() {
        // Board mutations echo back to the sender.
        assert!(!ServerMessage::Event(BoardEvent::CardDelete {
            card_id: "c1".to_string()
        })
        .excludes_origin());
        assert!(!ServerMessage::Init(Board::default()).excludes_origin());
        assert!(!ServerMessage::LockGranted {
            request_id: 1,
            card_id: "c1".to_string()
        }
        .excludes_origin());

        // Presence and lock notifications do not.
        assert!(ServerMessage::PeerJoined(user()).excludes_origin());
        assert!(ServerMessage::PeerLeft {
            user_id: "u1".to_string()
        }
        .excludes_origin());
        assert!(ServerMessage::Unlocked {
            card_id: "c1".to_string(),
            user_id: "u1".to_string()
        }
        .excludes_origin());
    }

    #[test]
    fn test_frame_relay_roundtrip() {
        let origin = Uuid::new_v4();
        let msg = ServerMessage::PeerJoined(user());
        let frame = Frame::new(origin, &msg).unwrap();

        let relayed = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(relayed.origin, origin);
        assert!(relayed.exclude_origin);
        assert_eq!(*relayed.wire, *frame.wire);

        // The carried bytes still decode to the original message.
        assert_eq!(ServerMessage::decode(&relayed.wire).unwrap(), msg);
    }

    #[test]
    fn test_frame_delivery_filter() {
        let origin = Uuid::new_v4();
        let other = Uuid::new_v4();

        let excluded = Frame::new(origin, &ServerMessage::PeerJoined(user())).unwrap();
        assert!(!excluded.is_for(origin));
        assert!(excluded.is_for(other));

        let echoed = Frame::new(
            origin,
            &ServerMessage::Event(BoardEvent::CardDelete { card_id: "c1".to_string() }),
        )
        .unwrap();
        assert!(echoed.is_for(origin));
        assert!(echoed.is_for(other));

        // Sweep-originated frames exclude nobody.
        let sweep = Frame::new(
            Uuid::nil(),
            &ServerMessage::Unlocked {
                card_id: "c1".to_string(),
                user_id: "u1".to_string(),
            },
        )
        .unwrap();
        assert!(sweep.is_for(origin));
        assert!(sweep.is_for(other));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ClientRequest::decode(&garbage).is_err());
        assert!(ServerMessage::decode(&garbage).is_err());
        assert!(Frame::decode(&garbage).is_err());
    }
}

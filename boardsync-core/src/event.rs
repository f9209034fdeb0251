//! Board mutation events.
//!
//! One `BoardEvent` describes exactly one state transition and is the
//! wire-level unit of synchronization: clients submit them, the hub
//! reduces them onto the authoritative board and fans them back out.
//! The board itself is never sent incrementally except as the full
//! snapshot at connection time.

use serde::{Deserialize, Serialize};

use crate::board::{Card, CardPatch, Comment};

/// A board mutation. Presence and lock traffic travels on separate
/// message kinds in the hub crate; only these five reach the reducer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoardEvent {
    /// `card:create` — the client already assigned the card's id,
    /// column, and order; the card is appended verbatim.
    CardCreate(Card),
    /// `card:move` — rewrite the card's column and position.
    CardMove {
        card_id: String,
        column_id: String,
        order: i64,
    },
    /// `card:update` — merge the enumerated mutable fields.
    CardUpdate(CardPatch),
    /// `card:delete` — remove the card. Also implicitly releases any
    /// edit lock held on it (handled by the hub, not the reducer).
    CardDelete { card_id: String },
    /// `card:comment` — append a comment to the owning card.
    CardComment(Comment),
}

impl BoardEvent {
    /// Wire name of this event kind, as used in logs and by the
    /// original browser protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            BoardEvent::CardCreate(_) => "card:create",
            BoardEvent::CardMove { .. } => "card:move",
            BoardEvent::CardUpdate(_) => "card:update",
            BoardEvent::CardDelete { .. } => "card:delete",
            BoardEvent::CardComment(_) => "card:comment",
        }
    }

    /// Id of the card this event targets.
    pub fn card_id(&self) -> &str {
        match self {
            BoardEvent::CardCreate(card) => &card.id,
            BoardEvent::CardMove { card_id, .. } => card_id,
            BoardEvent::CardUpdate(patch) => &patch.id,
            BoardEvent::CardDelete { card_id } => card_id,
            BoardEvent::CardComment(comment) => &comment.card_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        let ev = BoardEvent::CardDelete { card_id: "c1".to_string() };
        assert_eq!(ev.kind(), "card:delete");

        let ev = BoardEvent::CardMove {
            card_id: "c1".to_string(),
            column_id: "col-done".to_string(),
            order: 0,
        };
        assert_eq!(ev.kind(), "card:move");
    }

    #[test]
    fn test_card_id_targets() {
        let ev = BoardEvent::CardUpdate(CardPatch {
            id: "c9".to_string(),
            ..CardPatch::default()
        });
        assert_eq!(ev.card_id(), "c9");

        let ev = BoardEvent::CardComment(Comment {
            id: "m1".to_string(),
            card_id: "c3".to_string(),
            author_id: "u1".to_string(),
            author_name: "Alice".to_string(),
            content: "hi".to_string(),
            created_at: 0,
        });
        assert_eq!(ev.card_id(), "c3");
    }
}

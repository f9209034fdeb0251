//! Board data model.
//!
//! All identifiers are opaque strings assigned by clients; timestamps
//! are epoch milliseconds. Serialized field names are camelCase to
//! match the persisted record layout.

use serde::{Deserialize, Serialize};

/// An ordered lane on the board. Display sorts by `order`; uniqueness
/// of `order` values is not enforced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: String,
    pub title: String,
    pub order: i64,
}

/// A comment attached to a card. Append-only: never mutated or
/// deleted once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub card_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    /// Creation time in epoch milliseconds.
    pub created_at: u64,
}

/// A card on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: String,
    /// Owning column. Always references an existing [`Column`].
    pub column_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Position within the owning column.
    pub order: i64,
    #[serde(default)]
    pub comments: Vec<Comment>,
    /// Creation time in epoch milliseconds.
    pub created_at: u64,
}

impl Card {
    /// Merge a partial update onto this card.
    ///
    /// Only the enumerated mutable fields are patched; `id`,
    /// `comments`, and `created_at` are never overwritten.
    pub fn merge(&mut self, patch: &CardPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(column_id) = &patch.column_id {
            self.column_id = column_id.clone();
        }
        if let Some(order) = patch.order {
            self.order = order;
        }
    }
}

/// Partial card update: the explicit set of fields a `card:update`
/// event may change. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardPatch {
    /// Target card. Identifies the card; never written to it.
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub column_id: Option<String>,
    #[serde(default)]
    pub order: Option<i64>,
}

/// A connected user's display identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    /// Display color as a CSS color string.
    pub color: String,
}

/// The full Kanban state for one collaboration session.
///
/// The hub's copy is authoritative; every client holds a replica
/// reconciled by replaying hub-broadcast events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub id: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub cards: Vec<Card>,
}

impl Board {
    /// Look up a card by id.
    pub fn card(&self, card_id: &str) -> Option<&Card> {
        self.cards.iter().find(|c| c.id == card_id)
    }

    /// Whether a column with the given id exists.
    pub fn has_column(&self, column_id: &str) -> bool {
        self.columns.iter().any(|c| c.id == column_id)
    }
}

impl Default for Board {
    /// The empty three-column board served before any event has been
    /// applied.
    fn default() -> Self {
        Self {
            id: "board-1".to_string(),
            columns: vec![
                Column { id: "col-todo".to_string(), title: "To Do".to_string(), order: 0 },
                Column { id: "col-progress".to_string(), title: "In Progress".to_string(), order: 1 },
                Column { id: "col-done".to_string(), title: "Done".to_string(), order: 2 },
            ],
            cards: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card() -> Card {
        Card {
            id: "card-1".to_string(),
            column_id: "col-todo".to_string(),
            title: "Write tests".to_string(),
            description: "cover the merge rules".to_string(),
            order: 0,
            comments: Vec::new(),
            created_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_default_board_shape() {
        let board = Board::default();
        assert_eq!(board.id, "board-1");
        assert_eq!(board.columns.len(), 3);
        assert!(board.cards.is_empty());
        assert!(board.has_column("col-todo"));
        assert!(board.has_column("col-done"));
        assert!(!board.has_column("col-archive"));
    }

    #[test]
    fn test_merge_patches_mutable_fields() {
        let mut c = card();
        c.merge(&CardPatch {
            id: "card-1".to_string(),
            title: Some("Write more tests".to_string()),
            description: None,
            column_id: Some("col-done".to_string()),
            order: Some(3),
        });
        assert_eq!(c.title, "Write more tests");
        assert_eq!(c.description, "cover the merge rules");
        assert_eq!(c.column_id, "col-done");
        assert_eq!(c.order, 3);
    }

    #[test]
    fn test_merge_never_touches_identity_or_derived_fields() {
        let mut c = card();
        c.comments.push(Comment {
            id: "comment-1".to_string(),
            card_id: "card-1".to_string(),
            author_id: "u1".to_string(),
            author_name: "Alice".to_string(),
            content: "looks good".to_string(),
            created_at: 1_700_000_000_500,
        });

        // A patch whose `id` differs cannot rename the card, and the
        // comment list and creation time survive any patch.
        c.merge(&CardPatch { id: "card-other".to_string(), ..CardPatch::default() });
        assert_eq!(c.id, "card-1");
        assert_eq!(c.comments.len(), 1);
        assert_eq!(c.created_at, 1_700_000_000_000);
    }

    #[test]
    fn test_board_card_lookup() {
        let mut board = Board::default();
        board.cards.push(card());
        assert!(board.card("card-1").is_some());
        assert!(board.card("card-2").is_none());
    }

    #[test]
    fn test_json_field_names_are_camel_case() {
        let json = serde_json::to_value(&card()).unwrap();
        assert!(json.get("columnId").is_some());
        assert!(json.get("createdAt").is_some());
        assert!(json.get("column_id").is_none());
    }
}

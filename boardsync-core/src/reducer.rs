//! The event reducer: `apply(board, event) -> board'`.
//!
//! Pure and total. The input snapshot is never mutated; the returned
//! board reflects exactly one event. Events referencing a nonexistent
//! card or column are absorbed as no-ops rather than rejected, which
//! keeps the pipeline resilient to out-of-order and duplicate
//! delivery. Duplicate `card:create` / `card:comment` deliveries
//! (same id seen twice, e.g. a reconnect-triggered resend) are
//! deduplicated by identifier here.

use crate::board::Board;
use crate::event::BoardEvent;

/// Apply one mutation event to a board snapshot, producing a new
/// snapshot. Last write wins: whatever order boards get
/// read-reduced-written in is the globally observed order.
pub fn apply(board: &Board, event: &BoardEvent) -> Board {
    let mut next = board.clone();

    match event {
        BoardEvent::CardCreate(card) => {
            let duplicate = next.cards.iter().any(|c| c.id == card.id);
            if !duplicate && next.has_column(&card.column_id) {
                next.cards.push(card.clone());
            }
        }
        BoardEvent::CardMove { card_id, column_id, order } => {
            if next.has_column(column_id) {
                if let Some(card) = next.cards.iter_mut().find(|c| &c.id == card_id) {
                    card.column_id = column_id.clone();
                    card.order = *order;
                }
            }
        }
        BoardEvent::CardUpdate(patch) => {
            // A patched column must exist; otherwise that field of the
            // patch is dropped and the rest still applies.
            let mut patch = patch.clone();
            if let Some(column_id) = &patch.column_id {
                if !next.has_column(column_id) {
                    patch.column_id = None;
                }
            }
            if let Some(card) = next.cards.iter_mut().find(|c| c.id == patch.id) {
                card.merge(&patch);
            }
        }
        BoardEvent::CardDelete { card_id } => {
            next.cards.retain(|c| &c.id != card_id);
        }
        BoardEvent::CardComment(comment) => {
            if let Some(card) = next.cards.iter_mut().find(|c| c.id == comment.card_id) {
                let duplicate = card.comments.iter().any(|m| m.id == comment.id);
                if !duplicate {
                    card.comments.push(comment.clone());
                }
            }
        }
    }

    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{Card, CardPatch, Comment};

    fn card(id: &str, column_id: &str, order: i64) -> Card {
        Card {
            id: id.to_string(),
            column_id: column_id.to_string(),
            title: format!("Card {id}"),
            description: "something to do".to_string(),
            order,
            comments: Vec::new(),
            created_at: 1_700_000_000_000,
        }
    }

    fn comment(id: &str, card_id: &str) -> Comment {
        Comment {
            id: id.to_string(),
            card_id: card_id.to_string(),
            author_id: "u1".to_string(),
            author_name: "Alice".to_string(),
            content: "a note".to_string(),
            created_at: 1_700_000_001_000,
        }
    }

    #[test]
    fn test_create_appends_card() {
        let board = Board::default();
        let next = apply(&board, &BoardEvent::CardCreate(card("c1", "col-todo", 0)));
        assert_eq!(next.cards.len(), 1);
        assert_eq!(next.cards[0].column_id, "col-todo");
    }

    #[test]
    fn test_create_is_idempotent() {
        let board = Board::default();
        let ev = BoardEvent::CardCreate(card("c1", "col-todo", 0));
        let once = apply(&board, &ev);
        let twice = apply(&once, &ev);
        assert_eq!(once, twice);
        assert_eq!(twice.cards.len(), 1);
    }

    #[test]
    fn test_create_into_unknown_column_is_noop() {
        let board = Board::default();
        let next = apply(&board, &BoardEvent::CardCreate(card("c1", "col-nope", 0)));
        assert_eq!(next, board);
    }

    #[test]
    fn test_move_rewrites_placement() {
        let mut board = Board::default();
        board.cards.push(card("c1", "col-todo", 2));
        let next = apply(
            &board,
            &BoardEvent::CardMove {
                card_id: "c1".to_string(),
                column_id: "col-done".to_string(),
                order: 0,
            },
        );
        let moved = next.card("c1").unwrap();
        assert_eq!(moved.column_id, "col-done");
        assert_eq!(moved.order, 0);
        // Everything else untouched.
        assert_eq!(moved.title, "Card c1");
    }

    #[test]
    fn test_move_missing_card_or_column_is_noop() {
        let mut board = Board::default();
        board.cards.push(card("c1", "col-todo", 0));

        let missing_card = apply(
            &board,
            &BoardEvent::CardMove {
                card_id: "c99".to_string(),
                column_id: "col-done".to_string(),
                order: 0,
            },
        );
        assert_eq!(missing_card, board);

        let missing_column = apply(
            &board,
            &BoardEvent::CardMove {
                card_id: "c1".to_string(),
                column_id: "col-nope".to_string(),
                order: 0,
            },
        );
        assert_eq!(missing_column, board);
    }

    #[test]
    fn test_update_merges_partial_fields() {
        let mut board = Board::default();
        board.cards.push(card("c1", "col-todo", 0));
        let next = apply(
            &board,
            &BoardEvent::CardUpdate(CardPatch {
                id: "c1".to_string(),
                title: Some("Renamed".to_string()),
                ..CardPatch::default()
            }),
        );
        let updated = next.card("c1").unwrap();
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.description, "something to do");
        assert_eq!(updated.id, "c1");
    }

    #[test]
    fn test_update_missing_card_is_noop() {
        let board = Board::default();
        let next = apply(
            &board,
            &BoardEvent::CardUpdate(CardPatch {
                id: "c1".to_string(),
                title: Some("Renamed".to_string()),
                ..CardPatch::default()
            }),
        );
        assert_eq!(next, board);
    }

    #[test]
    fn test_update_to_unknown_column_keeps_other_fields() {
        let mut board = Board::default();
        board.cards.push(card("c1", "col-todo", 0));
        let next = apply(
            &board,
            &BoardEvent::CardUpdate(CardPatch {
                id: "c1".to_string(),
                title: Some("Renamed".to_string()),
                column_id: Some("col-nope".to_string()),
                ..CardPatch::default()
            }),
        );
        let updated = next.card("c1").unwrap();
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.column_id, "col-todo");
    }

    #[test]
    fn test_delete_removes_card() {
        let mut board = Board::default();
        board.cards.push(card("c1", "col-todo", 0));
        board.cards.push(card("c2", "col-todo", 1));
        let next = apply(&board, &BoardEvent::CardDelete { card_id: "c1".to_string() });
        assert_eq!(next.cards.len(), 1);
        assert!(next.card("c1").is_none());

        let again = apply(&next, &BoardEvent::CardDelete { card_id: "c1".to_string() });
        assert_eq!(again, next);
    }

    #[test]
    fn test_comment_appends_and_dedupes() {
        let mut board = Board::default();
        board.cards.push(card("c1", "col-todo", 0));

        let ev = BoardEvent::CardComment(comment("m1", "c1"));
        let once = apply(&board, &ev);
        let twice = apply(&once, &ev);
        assert_eq!(once.card("c1").unwrap().comments.len(), 1);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_comment_on_missing_card_is_noop() {
        let board = Board::default();
        let next = apply(&board, &BoardEvent::CardComment(comment("m1", "c1")));
        assert_eq!(next, board);
    }

    #[test]
    fn test_apply_never_mutates_input() {
        let mut board = Board::default();
        board.cards.push(card("c1", "col-todo", 0));
        let snapshot = board.clone();

        let _ = apply(&board, &BoardEvent::CardDelete { card_id: "c1".to_string() });
        let _ = apply(&board, &BoardEvent::CardCreate(card("c2", "col-done", 0)));
        let _ = apply(
            &board,
            &BoardEvent::CardUpdate(CardPatch {
                id: "c1".to_string(),
                title: Some("Renamed".to_string()),
                ..CardPatch::default()
            }),
        );

        // The input reference is still usable and unchanged.
        assert_eq!(board, snapshot);
    }

    #[test]
    fn test_create_then_move_end_to_end() {
        let board = Board::default();
        let created = apply(&board, &BoardEvent::CardCreate(card("card-1", "col-todo", 0)));
        let moved = apply(
            &created,
            &BoardEvent::CardMove {
                card_id: "card-1".to_string(),
                column_id: "col-done".to_string(),
                order: 0,
            },
        );

        assert_eq!(moved.cards.len(), 1);
        let c = moved.card("card-1").unwrap();
        assert_eq!(c.column_id, "col-done");
        assert_eq!(c.order, 0);
        assert_eq!(c.title, "Card card-1");
        assert_eq!(c.description, "something to do");
    }
}

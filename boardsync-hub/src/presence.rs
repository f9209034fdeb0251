//! Presence tracking and edit-lock arbitration.
//!
//! The manager owns explicit tables for the users and locks that
//! arrived through *this* hub instance — presence keyed by user id
//! with a last-heartbeat deadline, locks keyed by card id with a
//! lease deadline. The [`StateStore`] stays the cross-instance
//! arbiter; the tables exist so this instance can run the expiry
//! sweep and the disconnect cascade for its own clients.
//!
//! Lock state machine per card:
//!
//! ```text
//! Unlocked ──acquire(u)──► LockedBy(u) ──acquire(u)──► LockedBy(u)
//!    ▲                         │  (idempotent re-acquire, lease refreshed)
//!    │                         │
//!    └── release(u) | lease expiry | disconnect(u) | card deleted ──┘
//!
//! LockedBy(u) ──acquire(v), v≠u──► LockedBy(u)   (denied)
//! ```
//!
//! Presence per user: `Offline → Online` on join, refreshed by
//! heartbeat, back to `Offline` on disconnect or expiry — which also
//! cascades release of every lock that user held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use boardsync_core::User;

use crate::store::{LockHolder, StateStore, StoreError};

struct UserEntry {
    user: User,
    last_seen: Instant,
}

struct LockEntry {
    holder: LockHolder,
    expires_at: Instant,
}

#[derive(Default)]
struct Tables {
    users: HashMap<String, UserEntry>,
    locks: HashMap<String, LockEntry>,
}

/// What one expiry sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Users silent past the presence TTL.
    pub expired_users: Vec<String>,
    /// Released locks as `(card_id, holder user_id)` — lapsed leases
    /// plus every lock cascaded from an expired user.
    pub released_locks: Vec<(String, String)>,
}

impl SweepOutcome {
    pub fn is_empty(&self) -> bool {
        self.expired_users.is_empty() && self.released_locks.is_empty()
    }
}

/// Tracks who is online and which cards are locked, on top of the
/// state store.
pub struct PresenceManager {
    store: Arc<dyn StateStore>,
    presence_ttl: Duration,
    lock_ttl: Duration,
    tables: Mutex<Tables>,
}

impl PresenceManager {
    pub fn new(store: Arc<dyn StateStore>, presence_ttl: Duration, lock_ttl: Duration) -> Self {
        Self {
            store,
            presence_ttl,
            lock_ttl,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// A user came online (or refreshed their presence).
    pub async fn join(&self, user: &User) -> Result<(), StoreError> {
        self.store.set_presence(user).await?;
        let mut tables = self.tables.lock().await;
        tables.users.insert(
            user.id.clone(),
            UserEntry {
                user: user.clone(),
                last_seen: Instant::now(),
            },
        );
        Ok(())
    }

    /// Heartbeats are joins as far as the tables are concerned: the
    /// store record and the local deadline both get rewritten.
    pub async fn heartbeat(&self, user: &User) -> Result<(), StoreError> {
        self.join(user).await
    }

    /// A user's connection closed. Removes presence and releases
    /// every lock they held; returns the released card ids so the
    /// gateway can announce them.
    pub async fn disconnect(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let released = {
            let mut tables = self.tables.lock().await;
            tables.users.remove(user_id);
            let cards: Vec<String> = tables
                .locks
                .iter()
                .filter(|(_, entry)| entry.holder.user_id == user_id)
                .map(|(card_id, _)| card_id.clone())
                .collect();
            for card_id in &cards {
                tables.locks.remove(card_id);
            }
            cards
        };

        for card_id in &released {
            self.store.release_lock(card_id, user_id).await?;
        }
        self.store.remove_presence(user_id).await?;
        Ok(released)
    }

    /// Try to take the edit lock on a card for a user. Denial is a
    /// normal negative result, not an error.
    pub async fn acquire(&self, card_id: &str, user: &User) -> Result<bool, StoreError> {
        let granted = self
            .store
            .acquire_lock(card_id, &user.id, &user.name)
            .await?;
        if granted {
            let mut tables = self.tables.lock().await;
            tables.locks.insert(
                card_id.to_string(),
                LockEntry {
                    holder: LockHolder {
                        user_id: user.id.clone(),
                        user_name: user.name.clone(),
                    },
                    expires_at: Instant::now() + self.lock_ttl,
                },
            );
        }
        Ok(granted)
    }

    /// Release a lock if the user holds it. Returns whether a release
    /// actually happened.
    pub async fn release(&self, card_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let released = self.store.release_lock(card_id, user_id).await?;
        if released {
            let mut tables = self.tables.lock().await;
            tables.locks.remove(card_id);
        }
        Ok(released)
    }

    /// The card was deleted: drop its lock unconditionally. Returns
    /// the evicted holder if one is known (store record, or this
    /// instance's table when the store entry already lapsed).
    pub async fn card_deleted(&self, card_id: &str) -> Result<Option<LockHolder>, StoreError> {
        let evicted = self.store.clear_lock(card_id).await?;
        let local = {
            let mut tables = self.tables.lock().await;
            tables.locks.remove(card_id)
        };
        Ok(evicted.or(local.map(|entry| entry.holder)))
    }

    /// One expiry pass: expire users silent past the presence TTL
    /// (cascading their locks) and locks past their lease. The caller
    /// broadcasts the outcome.
    pub async fn sweep(&self) -> Result<SweepOutcome, StoreError> {
        let now = Instant::now();
        let mut outcome = SweepOutcome::default();

        {
            let mut tables = self.tables.lock().await;

            let expired: Vec<String> = tables
                .users
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.last_seen) >= self.presence_ttl)
                .map(|(_, entry)| entry.user.id.clone())
                .collect();

            for user_id in &expired {
                tables.users.remove(user_id);
            }

            let released: Vec<String> = tables
                .locks
                .iter()
                .filter(|(_, entry)| {
                    entry.expires_at <= now || expired.contains(&entry.holder.user_id)
                })
                .map(|(card_id, _)| card_id.clone())
                .collect();

            for card_id in &released {
                if let Some(entry) = tables.locks.remove(card_id) {
                    outcome
                        .released_locks
                        .push((card_id.clone(), entry.holder.user_id));
                }
            }

            outcome.expired_users = expired;
        }

        // Store calls happen outside the table lock. For the shared
        // store these may be no-ops — the TTL'd keys can have lapsed
        // on their own already.
        for (card_id, user_id) in &outcome.released_locks {
            self.store.release_lock(card_id, user_id).await?;
        }
        for user_id in &outcome.expired_users {
            self.store.remove_presence(user_id).await?;
        }

        Ok(outcome)
    }

    /// Locally-known holder of a card's lock (test observability).
    pub async fn lock_holder(&self, card_id: &str) -> Option<LockHolder> {
        let tables = self.tables.lock().await;
        tables.locks.get(card_id).map(|entry| entry.holder.clone())
    }

    /// Number of users this instance currently tracks.
    pub async fn online_count(&self) -> usize {
        self.tables.lock().await.users.len()
    }
}

//! Process-local fallback store.
//!
//! Used when the shared backing store is unreachable at startup: the
//! hub keeps serving a single instance out of plain maps. Expiry is
//! enforced lazily — every access checks the stored deadline — so a
//! lapsed lock is acquirable immediately even though the entry is
//! only physically removed on the next touch.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;

use boardsync_core::{Board, User};

use super::{LockHolder, StateStore, StoreConfig, StoreError};

struct PresenceEntry {
    #[allow(dead_code)]
    user: User,
    expires_at: Instant,
}

struct LockEntry {
    holder: LockHolder,
    expires_at: Instant,
}

struct Inner {
    board: Option<Board>,
    presence: HashMap<String, PresenceEntry>,
    locks: HashMap<String, LockEntry>,
}

/// In-memory implementation of [`StateStore`]. No cross-instance
/// visibility; the single mutex is what makes acquire atomic.
pub struct MemoryStore {
    config: StoreConfig,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                board: None,
                presence: HashMap::new(),
                locks: HashMap::new(),
            }),
        }
    }

    /// Number of unexpired presence records (test observability).
    pub async fn presence_count(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        inner
            .presence
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn board(&self) -> Result<Board, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.board.clone().unwrap_or_default())
    }

    async fn set_board(&self, board: &Board) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.board = Some(board.clone());
        Ok(())
    }

    async fn set_presence(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.presence.insert(
            user.id.clone(),
            PresenceEntry {
                user: user.clone(),
                expires_at: Instant::now() + self.config.presence_ttl,
            },
        );
        Ok(())
    }

    async fn remove_presence(&self, user_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.presence.remove(user_id);
        Ok(())
    }

    async fn acquire_lock(
        &self,
        card_id: &str,
        user_id: &str,
        user_name: &str,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        if let Some(entry) = inner.locks.get(card_id) {
            if entry.expires_at > now && entry.holder.user_id != user_id {
                return Ok(false);
            }
        }

        inner.locks.insert(
            card_id.to_string(),
            LockEntry {
                holder: LockHolder {
                    user_id: user_id.to_string(),
                    user_name: user_name.to_string(),
                },
                expires_at: now + self.config.lock_ttl,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, card_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        match inner.locks.get(card_id) {
            Some(entry) if entry.holder.user_id == user_id => {
                let live = entry.expires_at > now;
                inner.locks.remove(card_id);
                Ok(live)
            }
            _ => Ok(false),
        }
    }

    async fn clear_lock(&self, card_id: &str) -> Result<Option<LockHolder>, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Ok(inner
            .locks
            .remove(card_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.holder))
    }
}

//! State store abstraction.
//!
//! One interface, two implementations selected once at startup:
//!
//! ```text
//! ┌─────────────┐        ┌────────────────────────────────┐
//! │   Gateway   │ ─────► │ StateStore                      │
//! └─────────────┘        │  ├── RedisStore  (shared,       │
//!                        │  │    cross-instance, TTL keys) │
//!                        │  └── MemoryStore (process-local │
//!                        │       fallback, lazy expiry)    │
//!                        └────────────────────────────────┘
//! ```
//!
//! The store owns the three shared mutable resources: the board
//! snapshot, the presence table, and the lock table. Lock acquisition
//! is an atomic conditional write in both implementations — never a
//! separate read followed by a write.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use boardsync_core::{Board, User};

/// Store configuration: the expiry horizons applied on write.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Presence records expire this long after the last refresh.
    pub presence_ttl: Duration,
    /// Edit locks expire this long after acquire/refresh.
    pub lock_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            presence_ttl: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(120),
        }
    }
}

impl StoreConfig {
    /// Config with explicit expiry horizons (tests use millisecond
    /// leases so expiry is observable without waiting).
    pub fn with_ttls(presence_ttl: Duration, lock_ttl: Duration) -> Self {
        Self { presence_ttl, lock_ttl }
    }
}

/// The recorded holder of an edit lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockHolder {
    pub user_id: String,
    pub user_name: String,
}

/// Store errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backing store connection or command failure
    BackendError(String),
    /// Record encoding failed
    SerializationError(String),
    /// Record decoding failed
    DeserializationError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::BackendError(e) => write!(f, "Backend error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<::redis::RedisError> for StoreError {
    fn from(e: ::redis::RedisError) -> Self {
        StoreError::BackendError(e.to_string())
    }
}

/// Durable storage of board state, presence records, and edit locks.
///
/// All calls may suspend on I/O. Implementations are shared across
/// connection handlers behind an `Arc<dyn StateStore>`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current board snapshot, or the default board if none stored.
    async fn board(&self) -> Result<Board, StoreError>;

    /// Replace the stored snapshot.
    async fn set_board(&self, board: &Board) -> Result<(), StoreError>;

    /// (Re)write a presence record with the presence TTL. Absence of
    /// a refresh before expiry is equivalent to removal.
    async fn set_presence(&self, user: &User) -> Result<(), StoreError>;

    /// Drop a presence record.
    async fn remove_presence(&self, user_id: &str) -> Result<(), StoreError>;

    /// Try to take the edit lock on a card. Succeeds iff the card is
    /// unlocked, the existing lock has expired, or the caller already
    /// holds it (idempotent re-acquire refreshes the lease). The
    /// check and the write are a single atomic step.
    async fn acquire_lock(
        &self,
        card_id: &str,
        user_id: &str,
        user_name: &str,
    ) -> Result<bool, StoreError>;

    /// Release the lock if — and only if — the caller holds it.
    /// Returns whether a release actually happened.
    async fn release_lock(&self, card_id: &str, user_id: &str) -> Result<bool, StoreError>;

    /// Unconditionally drop the lock on a card (the card was
    /// deleted). Returns the evicted holder, if any.
    async fn clear_lock(&self, card_id: &str) -> Result<Option<LockHolder>, StoreError>;
}

//! Redis-backed shared store.
//!
//! Key layout:
//! - `board:state`       — serialized board snapshot (JSON)
//! - `presence:{userId}` — presence record (JSON), `EX` presence TTL
//! - `edit:{cardId}`     — lock holder record (JSON), `EX` lock TTL
//!
//! Lock arbitration runs as a server-side Lua script: the holder
//! check and the conditional write happen in one atomic step, so two
//! racing acquires can never both observe "unlocked". Records are
//! JSON so the script can inspect the stored holder with `cjson`.
//!
//! Commands go through a [`ConnectionManager`], which re-establishes
//! the underlying connection transparently after a broker restart.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use boardsync_core::{Board, User};

use super::{LockHolder, StateStore, StoreConfig, StoreError};

const BOARD_KEY: &str = "board:state";
const PRESENCE_PREFIX: &str = "presence:";
const LOCK_PREFIX: &str = "edit:";

/// Grant iff unlocked or already held by the caller; a grant
/// (re)writes the record and refreshes the lease.
const ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
    local holder = cjson.decode(current)
    if holder.userId ~= ARGV[1] then
        return 0
    end
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
return 1
"#;

/// Delete iff the caller is the current holder.
const RELEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
local holder = cjson.decode(current)
if holder.userId ~= ARGV[1] then
    return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

/// Shared-store implementation of [`StateStore`], visible to every
/// hub instance behind the same Redis.
pub struct RedisStore {
    conn: ConnectionManager,
    config: StoreConfig,
    acquire: Script,
    release: Script,
}

impl RedisStore {
    /// Wrap an established connection. Connection setup (and the
    /// bounded startup probe) is the caller's concern.
    pub fn new(conn: ConnectionManager, config: StoreConfig) -> Self {
        Self {
            conn,
            config,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    /// Open a connection and wrap it (used by tests that talk to a
    /// live Redis; the hub itself probes with a bounded timeout).
    pub async fn connect(url: &str, config: StoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, config))
    }

    fn presence_key(user_id: &str) -> String {
        format!("{PRESENCE_PREFIX}{user_id}")
    }

    fn lock_key(card_id: &str) -> String {
        format!("{LOCK_PREFIX}{card_id}")
    }

    /// TTLs are written in whole seconds; sub-second configs round up
    /// so a lease is never zero.
    fn ttl_secs(ttl: std::time::Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn board(&self) -> Result<Board, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(BOARD_KEY).await?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| StoreError::DeserializationError(e.to_string())),
            None => Ok(Board::default()),
        }
    }

    async fn set_board(&self, board: &Board) -> Result<(), StoreError> {
        let json = serde_json::to_string(board)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(BOARD_KEY, json).await?;
        Ok(())
    }

    async fn set_presence(&self, user: &User) -> Result<(), StoreError> {
        let json = serde_json::to_string(user)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(
                Self::presence_key(&user.id),
                json,
                Self::ttl_secs(self.config.presence_ttl),
            )
            .await?;
        Ok(())
    }

    async fn remove_presence(&self, user_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::presence_key(user_id)).await?;
        Ok(())
    }

    async fn acquire_lock(
        &self,
        card_id: &str,
        user_id: &str,
        user_name: &str,
    ) -> Result<bool, StoreError> {
        let record = serde_json::to_string(&LockHolder {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
        })
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let mut conn = self.conn.clone();
        let granted: i64 = self
            .acquire
            .key(Self::lock_key(card_id))
            .arg(user_id)
            .arg(record)
            .arg(Self::ttl_secs(self.config.lock_ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(granted == 1)
    }

    async fn release_lock(&self, card_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release
            .key(Self::lock_key(card_id))
            .arg(user_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn clear_lock(&self, card_id: &str) -> Result<Option<LockHolder>, StoreError> {
        let mut conn = self.conn.clone();
        let previous: Option<String> = redis::cmd("GETDEL")
            .arg(Self::lock_key(card_id))
            .query_async(&mut conn)
            .await?;
        match previous {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::DeserializationError(e.to_string())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(RedisStore::presence_key("u1"), "presence:u1");
        assert_eq!(RedisStore::lock_key("c1"), "edit:c1");
    }

    #[test]
    fn test_ttl_rounds_up_to_a_second() {
        assert_eq!(RedisStore::ttl_secs(std::time::Duration::from_millis(20)), 1);
        assert_eq!(RedisStore::ttl_secs(std::time::Duration::from_secs(120)), 120);
    }

    #[test]
    fn test_lock_record_is_script_readable() {
        // The acquire script reads `holder.userId` via cjson; the
        // serialized record must keep that field name.
        let json = serde_json::to_string(&LockHolder {
            user_id: "u1".to_string(),
            user_name: "Alice".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"userId\""));
        assert!(json.contains("\"userName\""));
    }
}

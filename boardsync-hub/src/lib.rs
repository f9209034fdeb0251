//! # boardsync-hub — Realtime synchronization hub for a shared board
//!
//! Keeps many concurrent clients viewing one mutable Kanban board in
//! agreement, arbitrates per-card edit locks, and fans accepted events
//! out to every interested client — including across multiple hub
//! instances sharing one backing store.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐   WebSocket   ┌──────────┐    reduce    ┌────────────┐
//!             ├─────────────► │ Gateway  │ ───────────► │ StateStore │
//! Client B ──┘               └────┬─────┘              │ Redis | mem│
//!                                 │                     └─────┬──────┘
//!                          ┌──────▼──────┐                    │
//!                          │ Broadcaster │ ◄── board:events ──┘
//!                          │  (fan-out)  │     (pub/sub, all instances)
//!                          └──────┬──────┘
//!                     ┌───────────┼───────────┐
//!                     ▼           ▼           ▼
//!                 Client A    Client B    Client C
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded messages)
//! - [`store`] — State store abstraction: shared Redis or in-memory fallback
//! - [`presence`] — Presence tracking and edit-lock arbitration with expiry
//! - [`broadcast`] — Cross-instance fan-out over pub/sub with local delivery
//! - [`server`] — The WebSocket connection gateway
//! - [`client`] — Rust hub client with heartbeats and an offline queue
//! - [`config`] — Hub configuration and environment loading

pub mod broadcast;
pub mod client;
pub mod config;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use broadcast::{Broadcaster, FanoutError, FanoutStats};
pub use client::{ConnectionState, HubClient, HubEvent, OfflineQueue};
pub use config::HubConfig;
pub use presence::{PresenceManager, SweepOutcome};
pub use protocol::{ClientRequest, Frame, ProtocolError, ServerMessage};
pub use server::{Hub, HubStats, StorageMode};
pub use store::{
    LockHolder, MemoryStore, RedisStore, StateStore, StoreConfig, StoreError,
};

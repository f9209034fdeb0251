//! Fan-out of accepted events to every connection on every instance.
//!
//! Locally this is a tokio broadcast channel of pre-encoded
//! [`Frame`]s: encode once, deliver N times, with per-receiver
//! buffering as backpressure. Across instances, frames travel over
//! the backing store's `board:events` pub/sub channel; every
//! instance's subscriber — including the publisher's own — injects
//! received frames into its local channel, so local and remote
//! clients observe the same stream.
//!
//! In fallback mode there is no shared channel and publish degrades
//! to direct local delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{Frame, ProtocolError, ServerMessage};

/// Pub/sub channel carrying relay frames between hub instances.
pub const EVENTS_CHANNEL: &str = "board:events";

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    /// Frames published (shared channel or direct local delivery).
    pub published: u64,
    /// Frames injected into the local channel.
    pub delivered: u64,
}

/// Fan-out errors.
#[derive(Debug, Clone)]
pub enum FanoutError {
    /// Frame encoding failed
    Encode(String),
    /// Publishing to the shared channel failed
    Publish(String),
}

impl std::fmt::Display for FanoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FanoutError::Encode(e) => write!(f, "Encode error: {e}"),
            FanoutError::Publish(e) => write!(f, "Publish error: {e}"),
        }
    }
}

impl std::error::Error for FanoutError {}

impl From<ProtocolError> for FanoutError {
    fn from(e: ProtocolError) -> Self {
        FanoutError::Encode(e.to_string())
    }
}

/// Publishes accepted events and owns the local delivery channel.
pub struct Broadcaster {
    local: broadcast::Sender<Frame>,
    publisher: Option<ConnectionManager>,
    published: AtomicU64,
    delivered: AtomicU64,
}

impl Broadcaster {
    /// Fallback mode: publish goes straight to local connections.
    pub fn local_only(capacity: usize) -> Self {
        let (local, _) = broadcast::channel(capacity);
        Self {
            local,
            publisher: None,
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Shared mode: publish goes to the pub/sub channel; delivery
    /// happens when the subscriber pump hands frames back via
    /// [`Broadcaster::deliver`].
    pub fn shared(capacity: usize, publisher: ConnectionManager) -> Self {
        let (local, _) = broadcast::channel(capacity);
        Self {
            local,
            publisher: Some(publisher),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Whether cross-instance fan-out is active.
    pub fn is_shared(&self) -> bool {
        self.publisher.is_some()
    }

    /// Subscribe a connection to local delivery.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.local.subscribe()
    }

    /// Publish an accepted message on behalf of `origin`.
    ///
    /// Returns the number of local receivers reached directly (0 in
    /// shared mode — delivery arrives through the subscriber pump).
    pub async fn publish(
        &self,
        origin: Uuid,
        message: &ServerMessage,
    ) -> Result<usize, FanoutError> {
        let frame = Frame::new(origin, message)?;
        self.published.fetch_add(1, Ordering::Relaxed);

        match &self.publisher {
            Some(conn) => {
                let payload = frame.encode()?;
                let mut conn = conn.clone();
                let _: () = conn
                    .publish(EVENTS_CHANNEL, payload)
                    .await
                    .map_err(|e| FanoutError::Publish(e.to_string()))?;
                Ok(0)
            }
            None => Ok(self.deliver(frame)),
        }
    }

    /// Inject a frame into local delivery. Returns the number of
    /// receivers reached; a send with no subscribers is not an error.
    pub fn deliver(&self, frame: Frame) -> usize {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.local.send(frame).unwrap_or(0)
    }

    /// Fan-out statistics (lock-free snapshot).
    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

/// Consume the shared channel and deliver frames locally, forever.
///
/// `initial` carries the subscription opened during the startup
/// probe. If the subscription drops later, the pump re-subscribes
/// with capped exponential backoff rather than giving up.
pub async fn run_subscriber(
    client: redis::Client,
    initial: Option<redis::aio::PubSub>,
    broadcaster: Arc<Broadcaster>,
) {
    let mut backoff = Duration::from_millis(500);
    let mut pubsub = initial;

    loop {
        let ps = match pubsub.take() {
            Some(ps) => ps,
            None => match resubscribe(&client).await {
                Ok(ps) => {
                    log::info!("event channel subscription re-established");
                    backoff = Duration::from_millis(500);
                    ps
                }
                Err(e) => {
                    log::warn!("event channel unavailable ({e}); retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                    continue;
                }
            },
        };

        let mut stream = ps.into_on_message();
        while let Some(msg) = stream.next().await {
            let payload: Vec<u8> = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("unreadable relay payload: {e}");
                    continue;
                }
            };
            match Frame::decode(&payload) {
                Ok(frame) => {
                    broadcaster.deliver(frame);
                }
                Err(e) => log::warn!("undecodable relay frame: {e}"),
            }
        }

        log::warn!("event channel subscription lost; reconnecting");
    }
}

async fn resubscribe(client: &redis::Client) -> Result<redis::aio::PubSub, redis::RedisError> {
    let mut ps = client.get_async_pubsub().await?;
    ps.subscribe(EVENTS_CHANNEL).await?;
    Ok(ps)
}

//! The WebSocket connection gateway.
//!
//! Architecture:
//! ```text
//! Client ── WebSocket ──► handle_connection (one task per connection)
//!                              │
//!                  ┌───────────┼────────────────┐
//!                  ▼           ▼                ▼
//!            PresenceManager  read-reduce-    Broadcaster
//!            (join/locks)     write board     (fan-out)
//!                  │           │                │
//!                  └───────────┴── StateStore ──┘
//!                                 (Redis | memory)
//! ```
//!
//! Each hub instance runs one logical handler per inbound message;
//! handlers suspend at store I/O without blocking other connections.
//! Multiple instances coordinate only through the shared store and
//! its pub/sub channel.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use boardsync_core::{apply, BoardEvent, User};

use crate::broadcast::{run_subscriber, Broadcaster, EVENTS_CHANNEL};
use crate::config::HubConfig;
use crate::presence::PresenceManager;
use crate::protocol::{ClientRequest, ServerMessage};
use crate::store::{MemoryStore, RedisStore, StateStore, StoreConfig, StoreError};

/// Which storage/fan-out mode was selected at startup. The choice is
/// made once and holds for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Shared backing store; events relay across instances.
    Shared,
    /// Process-local state; single, non-horizontally-scalable instance.
    Local,
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub events_applied: u64,
    pub locks_granted: u64,
    pub locks_denied: u64,
}

/// Write half of an accepted connection.
type WsSender =
    futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<TcpStream>, Message>;

/// Resources held for the relay pump until `run` spawns it.
struct RelayHandle {
    client: redis::Client,
    pubsub: redis::aio::PubSub,
}

/// The synchronization hub.
pub struct Hub {
    config: HubConfig,
    mode: StorageMode,
    store: Arc<dyn StateStore>,
    presence: Arc<PresenceManager>,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<RwLock<HubStats>>,
    relay: std::sync::Mutex<Option<RelayHandle>>,
}

impl Hub {
    /// Create a hub, probing the backing store once within the
    /// configured window. On probe failure (or `force_fallback`) the
    /// hub degrades to in-memory state for the process lifetime; the
    /// choice is not retried.
    pub async fn connect(config: HubConfig) -> Self {
        let store_config = StoreConfig::with_ttls(config.presence_ttl, config.lock_ttl);

        let mut mode = StorageMode::Local;
        let mut relay = None;
        let mut shared: Option<(Arc<dyn StateStore>, Arc<Broadcaster>)> = None;

        if config.force_fallback {
            log::info!("fallback mode forced; running single-instance with in-memory state");
        } else {
            match tokio::time::timeout(config.probe_timeout, probe_shared(&config.redis_url)).await
            {
                Ok(Ok((client, conn, pubsub))) => {
                    log::info!("backing store connected at {}", config.redis_url);
                    let store: Arc<dyn StateStore> =
                        Arc::new(RedisStore::new(conn.clone(), store_config.clone()));
                    let broadcaster =
                        Arc::new(Broadcaster::shared(config.broadcast_capacity, conn));
                    relay = Some(RelayHandle { client, pubsub });
                    shared = Some((store, broadcaster));
                    mode = StorageMode::Shared;
                }
                Ok(Err(e)) => {
                    log::warn!("backing store unreachable ({e}); using in-memory state for this process");
                }
                Err(_) => {
                    log::warn!(
                        "backing store probe timed out after {:?}; using in-memory state for this process",
                        config.probe_timeout
                    );
                }
            }
        }

        let (store, broadcaster) = shared.unwrap_or_else(|| {
            (
                Arc::new(MemoryStore::new(store_config.clone())) as Arc<dyn StateStore>,
                Arc::new(Broadcaster::local_only(config.broadcast_capacity)),
            )
        });

        let presence = Arc::new(PresenceManager::new(
            store.clone(),
            config.presence_ttl,
            config.lock_ttl,
        ));

        Self {
            config,
            mode,
            store,
            presence,
            broadcaster,
            stats: Arc::new(RwLock::new(HubStats::default())),
            relay: std::sync::Mutex::new(relay),
        }
    }

    /// Start listening for WebSocket connections and run forever.
    ///
    /// Also spawns the expiry sweeper and, in shared mode, the relay
    /// pump consuming the pub/sub channel.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_sweeper();
        self.spawn_relay_pump();

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "hub listening on {} ({:?} mode)",
            self.config.bind_addr,
            self.mode
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let store = self.store.clone();
            let presence = self.presence.clone();
            let broadcaster = self.broadcaster.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, addr, store, presence, broadcaster, stats, config)
                        .await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_sweeper(&self) {
        let presence = self.presence.clone();
        let broadcaster = self.broadcaster.clone();
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                match presence.sweep().await {
                    Ok(outcome) => {
                        for (card_id, user_id) in outcome.released_locks {
                            log::info!("lock on {card_id} expired (was held by {user_id})");
                            let _ = broadcaster
                                .publish(Uuid::nil(), &ServerMessage::Unlocked { card_id, user_id })
                                .await;
                        }
                        for user_id in outcome.expired_users {
                            log::info!("presence expired for {user_id}");
                            let _ = broadcaster
                                .publish(Uuid::nil(), &ServerMessage::PeerLeft { user_id })
                                .await;
                        }
                    }
                    Err(e) => log::warn!("expiry sweep failed: {e}"),
                }
            }
        });
    }

    fn spawn_relay_pump(&self) {
        let handle = match self.relay.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(RelayHandle { client, pubsub }) = handle {
            let broadcaster = self.broadcaster.clone();
            tokio::spawn(async move {
                run_subscriber(client, Some(pubsub), broadcaster).await;
            });
        }
    }

    /// Get hub statistics.
    pub async fn stats(&self) -> HubStats {
        self.stats.read().await.clone()
    }

    /// Storage mode selected at startup.
    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Handle to the selected state store.
    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }
}

async fn probe_shared(
    url: &str,
) -> Result<(redis::Client, redis::aio::ConnectionManager, redis::aio::PubSub), StoreError> {
    let client = redis::Client::open(url)?;
    let conn = redis::aio::ConnectionManager::new(client.clone()).await?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(EVENTS_CHANNEL).await?;
    Ok((client, conn, pubsub))
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    store: Arc<dyn StateStore>,
    presence: Arc<PresenceManager>,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<RwLock<HubStats>>,
    config: HubConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let allowed_origin = config.allowed_origin.clone();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        check_origin(req, resp, allowed_origin.as_deref(), addr)
    })
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");

    // Connection identity, used for sender inclusion/exclusion during
    // fan-out.
    let connection_id = Uuid::new_v4();

    // Every connection starts with the full snapshot; from then on the
    // client's replica is reconciled by replaying broadcast events.
    let board = store.board().await?;
    let init = ServerMessage::Init(board);
    ws_sender.send(Message::Binary(init.encode()?.into())).await?;

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut current_user: Option<User> = None;
    let mut broadcast_rx = broadcaster.subscribe();
    let mut keepalive = tokio::time::interval(config.ping_interval);
    keepalive.tick().await; // first tick is immediate
    let mut last_activity = tokio::time::Instant::now();

    loop {
        tokio::select! {
            // Inbound client message
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        last_activity = tokio::time::Instant::now();
                        let bytes: Vec<u8> = data.into();
                        match ClientRequest::decode(&bytes) {
                            Ok(request) => {
                                // A failed direct reply means the peer is
                                // gone; fall through to cleanup.
                                if let Err(e) = handle_request(
                                    request,
                                    addr,
                                    connection_id,
                                    &mut current_user,
                                    &store,
                                    &presence,
                                    &broadcaster,
                                    &stats,
                                    &mut ws_sender,
                                )
                                .await
                                {
                                    log::error!("send failed to {addr}: {e}");
                                    break;
                                }
                            }
                            Err(e) => {
                                log::warn!("undecodable message from {addr}: {e}");
                            }
                        }
                    }

                    Some(Ok(Message::Ping(data))) => {
                        last_activity = tokio::time::Instant::now();
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }

                    Some(Ok(Message::Pong(_))) => {
                        last_activity = tokio::time::Instant::now();
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("connection closed from {addr}");
                        break;
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {} // text frames are not part of the protocol
                }
            }

            // Outgoing fan-out frame
            frame = broadcast_rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if frame.is_for(connection_id)
                            && ws_sender
                                .send(Message::Binary(frame.wire.as_ref().clone().into()))
                                .await
                                .is_err()
                        {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("connection from {addr} lagged by {n} frames");
                    }
                    Err(_) => break,
                }
            }

            // Transport keepalive
            _ = keepalive.tick() => {
                if last_activity.elapsed() >= config.idle_timeout {
                    log::info!("closing idle connection from {addr}");
                    break;
                }
                if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Cleanup: presence leave + lock release cascade.
    if let Some(user) = current_user {
        match presence.disconnect(&user.id).await {
            Ok(released) => {
                for card_id in released {
                    let _ = broadcaster
                        .publish(
                            connection_id,
                            &ServerMessage::Unlocked {
                                card_id,
                                user_id: user.id.clone(),
                            },
                        )
                        .await;
                }
                let _ = broadcaster
                    .publish(
                        connection_id,
                        &ServerMessage::PeerLeft { user_id: user.id.clone() },
                    )
                    .await;
            }
            Err(e) => log::error!("presence cleanup failed for {}: {e}", user.id),
        }
    }

    {
        let mut s = stats.write().await;
        s.active_connections -= 1;
    }

    Ok(())
}

/// Dispatch one decoded client request.
///
/// Store failures are logged and the triggering event dropped; they
/// never tear down the connection.
#[allow(clippy::too_many_arguments)]
async fn handle_request(
    request: ClientRequest,
    addr: SocketAddr,
    connection_id: Uuid,
    current_user: &mut Option<User>,
    store: &Arc<dyn StateStore>,
    presence: &Arc<PresenceManager>,
    broadcaster: &Arc<Broadcaster>,
    stats: &Arc<RwLock<HubStats>>,
    ws_sender: &mut WsSender,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match request {
        ClientRequest::Join(user) => {
            *current_user = Some(user.clone());
            match presence.join(&user).await {
                Ok(()) => {
                    log::info!("{} ({}) joined from {addr}", user.name, user.id);
                    if let Err(e) = broadcaster
                        .publish(connection_id, &ServerMessage::PeerJoined(user))
                        .await
                    {
                        log::error!("presence:join fanout failed: {e}");
                    }
                }
                Err(e) => log::error!("presence join failed for {}: {e}", user.id),
            }
        }

        ClientRequest::Heartbeat(user) => {
            *current_user = Some(user.clone());
            if let Err(e) = presence.heartbeat(&user).await {
                log::warn!("heartbeat failed for {}: {e}", user.id);
            }
        }

        ClientRequest::Mutate(event) => {
            match apply_mutation(store, presence, broadcaster, connection_id, &event).await {
                Ok(()) => {
                    let mut s = stats.write().await;
                    s.events_applied += 1;
                }
                Err(e) => log::error!("dropping {} event: {e}", event.kind()),
            }
        }

        ClientRequest::Lock { request_id, card_id } => {
            let Some(user) = current_user.clone() else {
                log::debug!("ignoring edit:lock before presence:join from {addr}");
                return Ok(());
            };
            match presence.acquire(&card_id, &user).await {
                Ok(true) => {
                    {
                        let mut s = stats.write().await;
                        s.locks_granted += 1;
                    }
                    let reply = ServerMessage::LockGranted {
                        request_id,
                        card_id: card_id.clone(),
                    };
                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                    if let Err(e) = broadcaster
                        .publish(
                            connection_id,
                            &ServerMessage::Locked {
                                card_id,
                                user_id: user.id,
                                user_name: user.name,
                            },
                        )
                        .await
                    {
                        log::error!("edit:lock fanout failed: {e}");
                    }
                }
                Ok(false) => {
                    {
                        let mut s = stats.write().await;
                        s.locks_denied += 1;
                    }
                    let reply = ServerMessage::LockDenied { request_id, card_id };
                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                }
                // No reply on arbitration failure: the requester's own
                // timeout distinguishes this from a denial.
                Err(e) => log::error!("lock arbitration unavailable for {card_id}: {e}"),
            }
        }

        ClientRequest::Unlock { card_id } => {
            let Some(user) = current_user.clone() else {
                log::debug!("ignoring edit:unlock before presence:join from {addr}");
                return Ok(());
            };
            match presence.release(&card_id, &user.id).await {
                Ok(true) => {
                    if let Err(e) = broadcaster
                        .publish(
                            connection_id,
                            &ServerMessage::Unlocked { card_id, user_id: user.id },
                        )
                        .await
                    {
                        log::error!("edit:unlock fanout failed: {e}");
                    }
                }
                Ok(false) => {} // not the holder — nothing to announce
                Err(e) => log::error!("lock release failed for {card_id}: {e}"),
            }
        }
    }

    Ok(())
}

/// Read-reduce-write one board mutation, then fan it out.
///
/// The event goes to every connection including the sender; a delete
/// that evicted an edit lock additionally fans out the unlock.
async fn apply_mutation(
    store: &Arc<dyn StateStore>,
    presence: &Arc<PresenceManager>,
    broadcaster: &Arc<Broadcaster>,
    connection_id: Uuid,
    event: &BoardEvent,
) -> Result<(), StoreError> {
    let board = store.board().await?;
    let next = apply(&board, event);
    store.set_board(&next).await?;

    log::debug!("applied {} for card {}", event.kind(), event.card_id());

    if let Err(e) = broadcaster
        .publish(connection_id, &ServerMessage::Event(event.clone()))
        .await
    {
        log::error!("fanout failed for {}: {e}", event.kind());
    }

    // Deleting a card implicitly releases its edit lock.
    if let BoardEvent::CardDelete { card_id } = event {
        match presence.card_deleted(card_id).await {
            Ok(Some(holder)) => {
                let _ = broadcaster
                    .publish(
                        connection_id,
                        &ServerMessage::Unlocked {
                            card_id: card_id.clone(),
                            user_id: holder.user_id,
                        },
                    )
                    .await;
            }
            Ok(None) => {}
            Err(e) => log::warn!("lock eviction failed for deleted card {card_id}: {e}"),
        }
    }

    Ok(())
}

fn check_origin(
    req: &Request,
    resp: Response,
    allowed: Option<&str>,
    addr: SocketAddr,
) -> Result<Response, ErrorResponse> {
    if let Some(expected) = allowed {
        let origin = req
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok());
        if origin != Some(expected) {
            log::warn!("rejected connection from {addr}: origin {origin:?} not allowed");
            let mut deny = ErrorResponse::new(Some("origin not allowed".to_string()));
            *deny.status_mut() = StatusCode::FORBIDDEN;
            return Err(deny);
        }
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback_config() -> HubConfig {
        HubConfig {
            force_fallback: true,
            bind_addr: "127.0.0.1:0".to_string(),
            ..HubConfig::default()
        }
    }

    #[tokio::test]
    async fn test_forced_fallback_selects_local_mode() {
        let hub = Hub::connect(fallback_config()).await;
        assert_eq!(hub.mode(), StorageMode::Local);
        assert_eq!(hub.bind_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_to_local_mode() {
        let config = HubConfig {
            redis_url: "redis://127.0.0.1:1".to_string(),
            probe_timeout: std::time::Duration::from_millis(200),
            bind_addr: "127.0.0.1:0".to_string(),
            ..HubConfig::default()
        };
        let hub = Hub::connect(config).await;
        assert_eq!(hub.mode(), StorageMode::Local);
    }

    #[tokio::test]
    async fn test_initial_stats() {
        let hub = Hub::connect(fallback_config()).await;
        let stats = hub.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.events_applied, 0);
        assert_eq!(stats.locks_granted, 0);
        assert_eq!(stats.locks_denied, 0);
    }

    #[tokio::test]
    async fn test_fallback_store_serves_default_board() {
        let hub = Hub::connect(fallback_config()).await;
        let board = hub.store().board().await.unwrap();
        assert_eq!(board, boardsync_core::Board::default());
    }

    #[test]
    fn test_origin_check() {
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let req = Request::builder()
            .uri("ws://localhost/")
            .header("origin", "http://localhost:3000")
            .body(())
            .unwrap();
        let resp = Response::new(());
        assert!(check_origin(&req, resp, Some("http://localhost:3000"), addr).is_ok());

        let resp = Response::new(());
        assert!(check_origin(&req, resp, Some("http://example.com"), addr).is_err());

        // No configured origin: everything passes.
        let resp = Response::new(());
        assert!(check_origin(&req, resp, None, addr).is_ok());
    }
}

//! WebSocket client for connecting to the hub.
//!
//! Provides:
//! - Connection lifecycle with automatic `presence:join` on connect
//! - A heartbeat task refreshing presence every 15s
//! - Board mutations with an offline queue replayed on reconnect
//! - Lock requests correlated by request id over per-request oneshot
//!   channels, with a client-side timeout (a missing reply is a
//!   transport problem, not a denial)

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use boardsync_core::{BoardEvent, User};

use crate::protocol::{ClientRequest, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Full board snapshot received on connect
    Init(boardsync_core::Board),
    /// A board mutation accepted by the hub (own mutations included)
    Event(BoardEvent),
    /// A user came online
    PeerJoined(User),
    /// A user went offline
    PeerLeft { user_id: String },
    /// Another user took an edit lock
    Locked {
        card_id: String,
        user_id: String,
        user_name: String,
    },
    /// An edit lock was released
    Unlocked { card_id: String, user_id: String },
}

/// Queue for mutations submitted while disconnected.
///
/// Queued events are replayed on reconnection; the hub's reducer
/// dedupes any create/comment the server had in fact already seen.
pub struct OfflineQueue {
    queue: VecDeque<BoardEvent>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an event for later replay.
    pub fn enqueue(&mut self, event: BoardEvent) -> bool {
        if self.queue.len() >= self.max_size {
            return false; // Queue full
        }
        self.queue.push_back(event);
        true
    }

    /// Drain all queued events for replay.
    pub fn drain(&mut self) -> Vec<BoardEvent> {
        self.queue.drain(..).collect()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Clear all queued events.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

type PendingLocks = Arc<Mutex<HashMap<u64, oneshot::Sender<bool>>>>;

/// The hub client.
pub struct HubClient {
    user: User,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    offline: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<HubEvent>>,
    event_tx: mpsc::Sender<HubEvent>,
    pending_locks: PendingLocks,
    next_request_id: AtomicU64,
    heartbeat_interval: Duration,
    lock_timeout: Duration,
}

impl HubClient {
    /// Create a new client for the given identity.
    pub fn new(user: User, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            pending_locks: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicU64::new(1),
            heartbeat_interval: Duration::from_secs(15),
            lock_timeout: Duration::from_secs(10),
        }
    }

    /// Override the presence heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Override the lock-reply timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<HubEvent>> {
        self.event_rx.take()
    }

    /// Connect to the hub.
    ///
    /// Spawns background tasks for the WebSocket reader/writer and
    /// the presence heartbeat, announces presence, and replays any
    /// queued offline mutations.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;
        let (ws_stream, _) = match ws_result {
            Ok(ok) => ok,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the WebSocket.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            let mut writer = ws_writer;
            while let Some(msg) = out_rx.recv().await {
                use futures_util::SinkExt;
                if writer.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Announce presence.
        let join = ClientRequest::Join(self.user.clone());
        let _ = out_tx.send(Message::Binary(join.encode()?.into())).await;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(HubEvent::Connected).await;

        // Replay offline queue.
        {
            let mut queue = self.offline.lock().await;
            let queued = queue.drain();
            if !queued.is_empty() {
                log::info!("replaying {} queued mutations", queued.len());
                for event in queued {
                    let request = ClientRequest::Mutate(event);
                    if let Ok(encoded) = request.encode() {
                        let _ = out_tx.send(Message::Binary(encoded.into())).await;
                    }
                }
            }
        }

        // Heartbeat task: refresh presence until disconnected.
        {
            let state = self.state.clone();
            let user = self.user.clone();
            let out_tx = out_tx.clone();
            let interval = self.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick is immediate
                loop {
                    ticker.tick().await;
                    if *state.read().await != ConnectionState::Connected {
                        break;
                    }
                    let heartbeat = ClientRequest::Heartbeat(user.clone());
                    let Ok(encoded) = heartbeat.encode() else { break };
                    if out_tx.send(Message::Binary(encoded.into())).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Reader task: decode server messages into events; lock
        // replies resolve their pending request instead.
        {
            let event_tx = self.event_tx.clone();
            let state = self.state.clone();
            let pending = self.pending_locks.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            let bytes: Vec<u8> = data.into();
                            match ServerMessage::decode(&bytes) {
                                Ok(message) => {
                                    if let Some(event) =
                                        translate(message, &pending).await
                                    {
                                        let _ = event_tx.send(event).await;
                                    }
                                }
                                Err(e) => log::warn!("undecodable server message: {e}"),
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }

                // Connection lost: fail pending lock requests.
                *state.write().await = ConnectionState::Disconnected;
                pending.lock().await.clear();
                let _ = event_tx.send(HubEvent::Disconnected).await;
            });
        }

        Ok(())
    }

    /// Close the connection.
    pub async fn close(&mut self) {
        *self.state.write().await = ConnectionState::Disconnected;
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
    }

    /// Submit a board mutation.
    ///
    /// If disconnected, queues the event for replay on reconnect.
    pub async fn submit(&self, event: BoardEvent) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline.lock().await;
            if !queue.enqueue(event) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        self.send(ClientRequest::Mutate(event)).await
    }

    /// Request the edit lock on a card.
    ///
    /// `Ok(true)` — granted; `Ok(false)` — denied (someone else holds
    /// it); `Err(Timeout)` — no reply within the lock timeout.
    pub async fn request_lock(&self, card_id: &str) -> Result<bool, ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_locks.lock().await.insert(request_id, tx);

        self.send(ClientRequest::Lock {
            request_id,
            card_id: card_id.to_string(),
        })
        .await?;

        match tokio::time::timeout(self.lock_timeout, rx).await {
            Ok(Ok(granted)) => Ok(granted),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.pending_locks.lock().await.remove(&request_id);
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Release a held edit lock.
    pub async fn release_lock(&self, card_id: &str) -> Result<(), ProtocolError> {
        self.send(ClientRequest::Unlock {
            card_id: card_id.to_string(),
        })
        .await
    }

    async fn send(&self, request: ClientRequest) -> Result<(), ProtocolError> {
        let encoded = request.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(Message::Binary(encoded.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Our identity.
    pub fn user(&self) -> &User {
        &self.user
    }

    /// The hub URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Number of queued offline mutations.
    pub async fn offline_queue_len(&self) -> usize {
        self.offline.lock().await.len()
    }
}

/// Map a server message to an application event. Lock replies resolve
/// the matching pending request and surface nothing.
async fn translate(message: ServerMessage, pending: &PendingLocks) -> Option<HubEvent> {
    match message {
        ServerMessage::Init(board) => Some(HubEvent::Init(board)),
        ServerMessage::Event(event) => Some(HubEvent::Event(event)),
        ServerMessage::PeerJoined(user) => Some(HubEvent::PeerJoined(user)),
        ServerMessage::PeerLeft { user_id } => Some(HubEvent::PeerLeft { user_id }),
        ServerMessage::Locked {
            card_id,
            user_id,
            user_name,
        } => Some(HubEvent::Locked {
            card_id,
            user_id,
            user_name,
        }),
        ServerMessage::Unlocked { card_id, user_id } => {
            Some(HubEvent::Unlocked { card_id, user_id })
        }
        ServerMessage::LockGranted { request_id, .. } => {
            if let Some(tx) = pending.lock().await.remove(&request_id) {
                let _ = tx.send(true);
            }
            None
        }
        ServerMessage::LockDenied { request_id, .. } => {
            if let Some(tx) = pending.lock().await.remove(&request_id) {
                let _ = tx.send(false);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardsync_core::Card;

    fn user() -> User {
        User {
            id: "u1".to_string(),
            name: "Alice".to_string(),
            color: "#673ab7".to_string(),
        }
    }

    fn create_event(id: &str) -> BoardEvent {
        BoardEvent::CardCreate(Card {
            id: id.to_string(),
            column_id: "col-todo".to_string(),
            title: "A card".to_string(),
            description: String::new(),
            order: 0,
            comments: Vec::new(),
            created_at: 0,
        })
    }

    #[test]
    fn test_client_creation() {
        let client = HubClient::new(user(), "ws://localhost:3001");
        assert_eq!(client.user().name, "Alice");
        assert_eq!(client.server_url(), "ws://localhost:3001");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = HubClient::new(user(), "ws://localhost:3001");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_submit_offline_queues() {
        let client = HubClient::new(user(), "ws://localhost:3001");

        client.submit(create_event("c1")).await.unwrap();
        client.submit(create_event("c2")).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 2);
    }

    #[tokio::test]
    async fn test_lock_request_offline_fails_fast() {
        let client = HubClient::new(user(), "ws://localhost:3001");
        match client.request_lock("c1").await {
            Err(ProtocolError::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(create_event("c1"));
        queue.enqueue(create_event("c2"));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].card_id(), "c1");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(create_event("c1")));
        assert!(queue.enqueue(create_event("c2")));
        assert!(!queue.enqueue(create_event("c3"))); // Full
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_offline_queue_clear() {
        let mut queue = OfflineQueue::new(100);
        queue.enqueue(create_event("c1"));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut client = HubClient::new(user(), "ws://localhost:3001");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_lock_replies_resolve_pending_requests() {
        let pending: PendingLocks = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(7, tx);

        let surfaced = translate(
            ServerMessage::LockGranted {
                request_id: 7,
                card_id: "c1".to_string(),
            },
            &pending,
        )
        .await;
        assert!(surfaced.is_none());
        assert_eq!(rx.await.unwrap(), true);
        assert!(pending.lock().await.is_empty());
    }
}

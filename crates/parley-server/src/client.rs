use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use parley_core::ids::SessionId;
use parley_engine::{SessionController, Transport};

use crate::protocol::{ClientEvent, ServerEvent};

/// Inbound events buffered per connection before the reader waits.
const INBOUND_QUEUE: usize = 64;

/// A connected WebSocket client. One client is one session.
pub struct Client {
    pub session_id: SessionId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Client {
    fn new(session_id: SessionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            session_id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected WebSocket clients, keyed by session.
pub struct ClientRegistry {
    clients: DashMap<SessionId, Arc<Client>>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
            client_timeout,
        }
    }

    /// Register a new client under a fresh session and return its outbound queue.
    pub fn register(&self) -> (SessionId, mpsc::Receiver<String>) {
        let session_id = SessionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let client = Arc::new(Client::new(session_id.clone(), tx));
        self.clients.insert(session_id.clone(), client);
        (session_id, rx)
    }

    /// Remove a client. Returns whether it was registered.
    pub fn unregister(&self, session_id: &SessionId) -> bool {
        match self.clients.remove(session_id) {
            Some((_, client)) => {
                client.connected.store(false, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn mark_disconnected(&self, session_id: &SessionId) {
        if let Some(client) = self.clients.get(session_id) {
            client.connected.store(false, Ordering::Relaxed);
        }
    }

    fn record_pong(&self, session_id: &SessionId) {
        if let Some(client) = self.clients.get(session_id) {
            client.record_pong();
        }
    }

    /// Queue a raw frame for a client. Never blocks; a full or closed queue
    /// drops the frame and returns `false`.
    pub fn send_to(&self, session_id: &SessionId, message: String) -> bool {
        let Some(tx) = self.clients.get(session_id).map(|c| c.tx.clone()) else {
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(
                    session_id = %session_id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Remove clients that haven't answered a ping within the timeout.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<SessionId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive(self.client_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for session_id in dead {
            if self.unregister(&session_id) {
                removed += 1;
                info!(session_id = %session_id, "cleaned up dead client");
            }
        }
        removed
    }
}

impl Transport for ClientRegistry {
    fn is_live(&self, session_id: &SessionId) -> bool {
        self.clients
            .get(session_id)
            .is_some_and(|c| c.is_connected())
    }

    fn emit(&self, session_id: &SessionId, text: String) -> bool {
        match serde_json::to_string(&ServerEvent::response(text)) {
            Ok(json) => self.send_to(session_id, json),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to encode response");
                false
            }
        }
    }
}

/// Drive one WebSocket connection until it closes: a writer task drains the
/// outbound queue and pings, a reader task queues parsed frames for the
/// connection's inbound worker.
pub async fn handle_ws_connection(
    socket: WebSocket,
    session_id: SessionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    controller: Arc<SessionController>,
    heartbeat: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_sid = session_id.clone();
    let writer_registry = Arc::clone(&registry);
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::<u8>::new().into())).await.is_err() {
                        break;
                    }
                    trace!(session_id = %writer_sid, "sent ping");
                }
            }
        }

        writer_registry.mark_disconnected(&writer_sid);
    });

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    tokio::spawn(run_inbound(
        Arc::clone(&controller),
        session_id.clone(),
        inbound_rx,
    ));

    let reader_sid = session_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader_controller = Arc::clone(&controller);
    let mut reader = tokio::spawn(async move {
        loop {
            match ws_rx.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let Some(event) = parse_frame(&reader_sid, text.as_str()) else {
                        continue;
                    };
                    if inbound_tx.send(event).await.is_err() {
                        return "inbound queue closed".to_string();
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => reader_registry.record_pong(&reader_sid),
                Some(Ok(WsMessage::Close(frame))) => {
                    return frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "client closed".to_string());
                }
                Some(Ok(_)) => {} // axum answers pings itself
                Some(Err(e)) => {
                    reader_controller.transport_error(&reader_sid, &e);
                    return "transport error".to_string();
                }
                None => return "connection ended".to_string(),
            }
        }
    });

    let reason = tokio::select! {
        result = &mut reader => {
            writer.abort();
            result.unwrap_or_else(|_| "reader aborted".to_string())
        }
        _ = &mut writer => {
            reader.abort();
            "connection lost".to_string()
        }
    };

    registry.unregister(&session_id);
    controller.disconnect(&session_id, &reason);
}

fn parse_frame(session_id: &SessionId, raw: &str) -> Option<ClientEvent> {
    match serde_json::from_str::<ClientEvent>(raw) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "ignoring unparseable frame");
            None
        }
    }
}

/// Work through a connection's inbound events one at a time, in arrival
/// order. Runs apart from the reader so a slow generation never stalls it,
/// and drains whatever was queued after the socket closes.
async fn run_inbound(
    controller: Arc<SessionController>,
    session_id: SessionId,
    mut inbound: mpsc::Receiver<ClientEvent>,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            ClientEvent::UserQuery(prompt) => {
                debug!(session_id = %session_id, prompt_len = prompt.len(), "user query");
                controller.handle_prompt(&session_id, prompt).await;
            }
            ClientEvent::NewChat => controller.new_chat(&session_id).await,
        }
    }
}

/// Start a background task that periodically cleans up dead clients.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = shutdown.cancelled() => break,
            }
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                info!(removed, "dead client cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(queue: usize) -> ClientRegistry {
        ClientRegistry::new(queue, Duration::from_secs(90))
    }

    #[test]
    fn register_assigns_fresh_sessions() {
        let registry = registry(32);
        let (a, _rx_a) = registry.register();
        let (b, _rx_b) = registry.register();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("sess_"));
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn register_and_unregister() {
        let registry = registry(32);
        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();

        assert!(registry.unregister(&id1));
        assert_eq!(registry.count(), 1);
        assert!(!registry.unregister(&id1));

        registry.unregister(&id2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn send_to_specific_client() {
        let registry = registry(32);
        let (id, mut rx) = registry.register();

        assert!(registry.send_to(&id, "test message".into()));
        assert_eq!(rx.recv().await.unwrap(), "test message");
    }

    #[test]
    fn parse_frame_skips_garbage() {
        let id = SessionId::new();
        assert_eq!(parse_frame(&id, r#"{"event":"new-chat"}"#), Some(ClientEvent::NewChat));
        assert_eq!(parse_frame(&id, "not json"), None);
        assert_eq!(parse_frame(&id, r#"{"event":"launch-rockets"}"#), None);
    }

    #[test]
    fn send_to_unknown_session() {
        let registry = registry(32);
        assert!(!registry.send_to(&SessionId::new(), "test".into()));
    }

    #[test]
    fn send_to_full_queue_drops() {
        let registry = registry(2);
        let (id, _rx) = registry.register();

        assert!(registry.send_to(&id, "msg1".into()));
        assert!(registry.send_to(&id, "msg2".into()));
        assert!(!registry.send_to(&id, "msg3".into()));
    }

    #[test]
    fn send_after_receiver_dropped_fails() {
        let registry = registry(8);
        let (id, rx) = registry.register();
        drop(rx);
        assert!(!registry.send_to(&id, "anyone?".into()));
    }

    #[test]
    fn liveness_follows_registration() {
        let registry = registry(8);
        let (id, _rx) = registry.register();
        assert!(registry.is_live(&id));

        registry.mark_disconnected(&id);
        assert!(!registry.is_live(&id));

        registry.unregister(&id);
        assert!(!registry.is_live(&id));
        assert!(!registry.is_live(&SessionId::new()));
    }

    #[tokio::test]
    async fn emit_wraps_text_in_response_frame() {
        let registry = registry(8);
        let (id, mut rx) = registry.register();

        assert!(registry.emit(&id, "Finished".into()));
        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, serde_json::json!({"event": "response", "data": "Finished"}));
    }

    #[test]
    fn emit_to_gone_session_returns_false() {
        let registry = registry(8);
        let (id, _rx) = registry.register();
        registry.unregister(&id);
        assert!(!registry.emit(&id, "late".into()));
    }

    #[test]
    fn client_pong_tracking() {
        let (tx, _rx) = mpsc::channel(1);
        let client = Client::new(SessionId::new(), tx);
        assert!(client.is_alive(Duration::from_secs(90)));

        client.last_pong.store(0, Ordering::Relaxed);
        assert!(!client.is_alive(Duration::from_secs(90)));

        client.record_pong();
        assert!(client.is_alive(Duration::from_secs(90)));
    }

    #[test]
    fn cleanup_dead_clients_removes_expired() {
        let registry = registry(32);
        let (dead, _rx1) = registry.register();
        let (alive, _rx2) = registry.register();

        if let Some(client) = registry.clients.get(&dead) {
            client.last_pong.store(0, Ordering::Relaxed);
        }

        assert_eq!(registry.cleanup_dead_clients(), 1);
        assert_eq!(registry.count(), 1);
        assert!(registry.is_live(&alive));
        assert!(!registry.is_live(&dead));
    }
}

//! WebSocket hub for real-time client updates.
//!
//! Each connected client gets its own bounded outbound queue; broadcast is a
//! non-blocking fan-out, and a client whose queue overflows is dropped so a
//! stuck peer can never stall the pipeline. Events are JSON envelopes of the
//! form `{type, ...payload, timestamp}` and arrive at any single client in
//! the order the hub accepted them.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct WsHub {
    clients: DashMap<Uuid, mpsc::Sender<String>>,
    queue_capacity: usize,
}

impl WsHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: DashMap::new(),
            queue_capacity,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Attach a client queue. The socket loop owns the receiver; everything
    /// queued is already-serialized JSON text.
    pub fn register(&self) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.clients.insert(id, tx);
        (id, rx)
    }

    pub fn unregister(&self, id: &Uuid) {
        self.clients.remove(id);
    }

    /// Evict every client. Dropping the senders closes each per-client queue,
    /// so the socket loops observe the closed queue and exit. Used on
    /// shutdown.
    pub fn close(&self) {
        let evicted = self.clients.len();
        self.clients.clear();
        if evicted > 0 {
            tracing::info!(clients = evicted, "WebSocket hub closed");
        }
    }

    /// Fan an event out to every client. Never blocks: a full queue means the
    /// client is too slow and gets disconnected.
    pub fn broadcast(&self, event_type: &str, payload: Value) {
        let mut envelope = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                if !other.is_null() {
                    map.insert("data".to_string(), other);
                }
                map
            }
        };
        envelope.insert("type".to_string(), Value::String(event_type.to_string()));
        envelope.insert(
            "timestamp".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        let text = Value::Object(envelope).to_string();

        let mut dropped = Vec::new();
        for entry in self.clients.iter() {
            if entry.value().try_send(text.clone()).is_err() {
                dropped.push(*entry.key());
            }
        }
        for id in dropped {
            self.clients.remove(&id);
            tracing::warn!(client = %id, "dropping slow or closed WebSocket client");
        }
    }
}

#[derive(Clone)]
struct WsState {
    hub: Arc<WsHub>,
    ping_interval: Duration,
}

pub fn router(hub: Arc<WsHub>, ping_interval_secs: u64) -> Router {
    let state = WsState {
        hub,
        ping_interval: Duration::from_secs(ping_interval_secs.max(1)),
    };
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub, state.ping_interval))
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<WsHub>, ping_interval: Duration) {
    let (id, mut queue) = hub.register();
    tracing::debug!(client = %id, clients = hub.client_count(), "WebSocket client connected");

    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ping.tick().await;

    loop {
        tokio::select! {
            outbound = queue.recv() => {
                match outbound {
                    Some(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Queue closed: the hub dropped us as a slow client
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    hub.unregister(&id);
    tracing::debug!(client = %id, "WebSocket client disconnected");
}

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{
        ws::{close_code, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    protocol::ServerMessage,
    session::{SessionState, ViewerSession},
    AppState,
};

/// Live viewer connections, owned by the application state.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<DashMap<Uuid, ConnectionEntry>>,
}

struct ConnectionEntry {
    opened_at: Instant,
    remote_addr: Option<SocketAddr>,
    tenant: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: Uuid,
    pub tenant: Option<String>,
    pub remote_addr: Option<String>,
    pub age_seconds: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, remote_addr: Option<SocketAddr>) -> usize {
        self.inner.insert(
            id,
            ConnectionEntry {
                opened_at: Instant::now(),
                remote_addr,
                tenant: None,
            },
        );
        let active = self.inner.len();
        gauge!("vitrine_viewer_connections_active").set(active as f64);
        counter!("vitrine_viewer_connections_total").increment(1);
        active
    }

    pub fn set_tenant(&self, id: Uuid, tenant: &str) {
        if let Some(mut entry) = self.inner.get_mut(&id) {
            if entry.tenant.is_none() {
                entry.tenant = Some(tenant.to_string());
            }
        }
    }

    pub fn unregister(&self, id: Uuid) -> usize {
        self.inner.remove(&id);
        let active = self.inner.len();
        gauge!("vitrine_viewer_connections_active").set(active as f64);
        active
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshot: Vec<ConnectionSnapshot> = self
            .inner
            .iter()
            .map(|entry| ConnectionSnapshot {
                id: *entry.key(),
                tenant: entry.tenant.clone(),
                remote_addr: entry.remote_addr.map(|addr| addr.to_string()),
                age_seconds: entry.opened_at.elapsed().as_secs(),
            })
            .collect();
        snapshot.sort_by_key(|entry| std::cmp::Reverse(entry.age_seconds));
        snapshot
    }
}

/// Per-connection behaviour knobs.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub send_hello: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            send_hello: true,
        }
    }
}

/// How a viewer connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Orderly close handshake.
    Normal,
    /// Transport-level anomaly: reset, missing close handshake, odd close code.
    Abnormal,
    /// Anything else; worth an error log.
    Failure,
}

impl Disconnect {
    pub fn from_close_code(code: Option<u16>) -> Self {
        match code {
            None | Some(close_code::NORMAL) | Some(close_code::AWAY) | Some(close_code::STATUS) => {
                Disconnect::Normal
            }
            Some(_) => Disconnect::Abnormal,
        }
    }

    pub fn from_error(message: &str) -> Self {
        const BENIGN: [&str; 7] = [
            "without closing handshake",
            "connection reset",
            "connection closed",
            "already closed",
            "broken pipe",
            "invalid close code",
            "invalid status code",
        ];
        let lowered = message.to_ascii_lowercase();
        if BENIGN.iter().any(|pattern| lowered.contains(pattern)) {
            Disconnect::Abnormal
        } else {
            Disconnect::Failure
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Disconnect::Normal => "normal",
            Disconnect::Abnormal => "abnormal",
            Disconnect::Failure => "failure",
        }
    }
}

/// WebSocket upgrade handler for viewers.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_viewer(socket, state, Some(remote_addr)))
}

/// Drives one viewer connection from open to close.
pub async fn serve_viewer(socket: WebSocket, state: AppState, remote_addr: Option<SocketAddr>) {
    let mut session = ViewerSession::new(state.signaling.clone());
    let session_id = session.id();
    let active = state.connections.register(session_id, remote_addr);
    info!(session = %session_id, remote = ?remote_addr, active, "viewer connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
        debug!(session = %session_id, "writer task ended");
    });

    if state.settings.send_hello {
        send(&tx, ServerMessage::Hello(chrono::Utc::now().timestamp_millis()));
    }

    let period = state.settings.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    let disconnect = loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if tx.send(Message::Ping(Vec::new())).is_err() {
                    break Disconnect::Abnormal;
                }
            }
            frame = receiver.next() => match frame {
                None => break Disconnect::Abnormal,
                Some(Err(err)) => {
                    let kind = Disconnect::from_error(&err.to_string());
                    match kind {
                        Disconnect::Failure => {
                            error!(session = %session_id, error = %err, "viewer socket error");
                        }
                        _ => info!(session = %session_id, error = %err, "viewer socket dropped"),
                    }
                    break kind;
                }
                Some(Ok(Message::Text(text))) => {
                    dispatch(&mut session, &state, &tx, &text).await;
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => dispatch(&mut session, &state, &tx, &text).await,
                    Err(_) => debug!(session = %session_id, "ignoring non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map(|frame| frame.code);
                    let kind = Disconnect::from_close_code(code);
                    if kind == Disconnect::Abnormal {
                        info!(session = %session_id, ?code, "viewer closed with abnormal code");
                    }
                    break kind;
                }
                Some(Ok(_)) => {}
            }
        }
    };

    let report = session.close().await;
    let active = state.connections.unregister(session_id);
    drop(tx);
    writer.abort();

    counter!("vitrine_viewer_disconnects_total", "kind" => disconnect.label()).increment(1);
    info!(
        session = %session_id,
        disconnect = disconnect.label(),
        released = report.released,
        release_failures = report.failed,
        active,
        "viewer disconnected"
    );
}

async fn dispatch(
    session: &mut ViewerSession,
    state: &AppState,
    tx: &mpsc::UnboundedSender<Message>,
    text: &str,
) {
    let was_init = session.state() == SessionState::Init;
    let replies = session.handle_text(text).await;
    if was_init {
        if let Some(code) = session.tenant_code() {
            state.connections.set_tenant(session.id(), code);
        }
    }
    for reply in replies {
        send(tx, reply);
    }
}

fn send(tx: &mpsc::UnboundedSender<Message>, message: ServerMessage) {
    match serde_json::to_string(&message) {
        Ok(json) => {
            if tx.send(Message::Text(json)).is_err() {
                debug!(kind = message.type_name(), "viewer gone; reply discarded");
            }
        }
        Err(err) => warn!(kind = message.type_name(), error = %err, "failed to encode reply"),
    }
}

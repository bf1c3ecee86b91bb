#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use vitrine_gateway::{
    auth::{IngestVerifier, TokenValidator, Validation},
    connection::ConnectionSettings,
    media::{
        Consumer, EgressTransport, InMemoryMediaEngine, IngressTransport, MediaEngine, MediaError,
        MediaHandle, MediaKind, MediaResult, Producer,
    },
    registry::TenantRegistry,
    relay::AgentRelay,
    session::SignalingContext,
    AppState,
};

pub type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Single-use tokens, each granted for one tenant.
#[derive(Default)]
pub struct ScriptedValidator {
    grants: Mutex<HashMap<String, (String, String)>>,
}

impl ScriptedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(self, token: &str, tenant: &str, subject: &str) -> Self {
        self.grants
            .lock()
            .unwrap()
            .insert(token.to_string(), (tenant.to_string(), subject.to_string()));
        self
    }
}

#[async_trait]
impl TokenValidator for ScriptedValidator {
    async fn validate(&self, token: &str, tenant_code: &str) -> Validation {
        match self.grants.lock().unwrap().remove(token) {
            Some((tenant, subject)) if tenant == tenant_code => Validation::granted(subject),
            _ => Validation::denied(),
        }
    }
}

/// Accepts one fixed ingest key.
pub struct StaticKey(pub &'static str);

#[async_trait]
impl IngestVerifier for StaticKey {
    async fn verify_ingest_key(&self, key: &str, _tenant_code: &str) -> bool {
        key == self.0
    }
}

/// Loopback engine with switchable failures.
#[derive(Clone, Default)]
pub struct FaultyEngine {
    pub inner: InMemoryMediaEngine,
    pub fail_producers: Arc<AtomicBool>,
    pub fail_audio_consumer: Arc<AtomicBool>,
}

impl FaultyEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaEngine for FaultyEngine {
    async fn create_ingress_transport(&self, ip: Option<&str>) -> MediaResult<IngressTransport> {
        self.inner.create_ingress_transport(ip).await
    }

    async fn create_producer(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Producer> {
        if self.fail_producers.load(Ordering::SeqCst) {
            return Err(MediaError::Rejected {
                status: 500,
                body: "no rtp yet".into(),
            });
        }
        self.inner.create_producer(transport_id, kind, rtp_parameters).await
    }

    async fn create_egress_transport(&self) -> MediaResult<EgressTransport> {
        self.inner.create_egress_transport().await
    }

    async fn connect_egress_transport(&self, transport_id: &str, dtls: Value) -> MediaResult<()> {
        self.inner.connect_egress_transport(transport_id, dtls).await
    }

    async fn create_consumer(
        &self,
        transport_id: &str,
        producer: &Producer,
        rtp_capabilities: Value,
    ) -> MediaResult<Consumer> {
        if producer.kind == MediaKind::Audio && self.fail_audio_consumer.load(Ordering::SeqCst) {
            return Err(MediaError::Unavailable("audio router gone".into()));
        }
        self.inner
            .create_consumer(transport_id, producer, rtp_capabilities)
            .await
    }

    async fn rtp_capabilities(&self) -> MediaResult<Value> {
        self.inner.rtp_capabilities().await
    }

    async fn close(&self, handle: MediaHandle) -> MediaResult<()> {
        self.inner.close(handle).await
    }
}

pub fn signaling(
    engine: Arc<dyn MediaEngine>,
    validator: Arc<dyn TokenValidator>,
    agents: HashMap<String, String>,
) -> SignalingContext {
    let registry = TenantRegistry::new(engine, Some("203.0.113.9".into()));
    let relay = AgentRelay::new(registry.clone(), agents, Duration::from_secs(1));
    SignalingContext {
        registry,
        validator,
        relay,
        call_timeout: Duration::from_secs(2),
    }
}

/// Provisions ingress and both producers for a tenant.
pub async fn start_stream(registry: &TenantRegistry, code: &str) {
    registry.get_or_create_ingress(code).await.unwrap();
    registry.get_or_create_producers(code).await.unwrap();
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl TestGateway {
    pub async fn spawn(state: AppState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(vitrine_gateway::serve(
            listener,
            state.clone(),
            async move {
                let _ = rx.await;
            },
            Duration::from_secs(1),
        ));
        Self {
            addr,
            state,
            shutdown: Some(tx),
            server,
        }
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn viewer(&self) -> ClientSocket {
        let (socket, _) = connect_async(format!("ws://{}/ws", self.addr)).await.unwrap();
        socket
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.server.await.unwrap().unwrap();
    }
}

pub fn state_with(engine: Arc<dyn MediaEngine>, validator: Arc<dyn TokenValidator>) -> AppState {
    AppState::new(
        signaling(engine, validator, HashMap::new()),
        ConnectionSettings::default(),
    )
}

pub async fn send_json(socket: &mut ClientSocket, value: Value) {
    socket.send(Message::text(value.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping pings and other control frames.
pub async fn next_json(socket: &mut ClientSocket) -> Value {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("socket ended while waiting for a message: {other:?}"),
        }
    }
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

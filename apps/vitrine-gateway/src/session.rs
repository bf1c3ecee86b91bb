use std::{future::Future, sync::Arc, time::Duration};

use metrics::counter;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{TokenValidator, Validation};
use crate::media::{Consumer, EgressTransport, MediaEngine, MediaError, MediaHandle, MediaResult};
use crate::protocol::{
    ClientMessage, ConnectRequest, ConsumerDescription, Decoded, ErrorCode, JoinRequest,
    ServerMessage, TransportOffer,
};
use crate::registry::{release, TenantChannel, TenantRegistry};
use crate::relay::AgentRelay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Joined,
    Active,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::Joined => "joined",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        }
    }
}

/// Collaborators shared by every viewer session.
#[derive(Clone)]
pub struct SignalingContext {
    pub registry: TenantRegistry,
    pub validator: Arc<dyn TokenValidator>,
    pub relay: AgentRelay,
    /// Upper bound for any single call to the auth service or media engine.
    pub call_timeout: Duration,
}

impl SignalingContext {
    fn engine(&self) -> &dyn MediaEngine {
        self.registry.engine().as_ref()
    }

    async fn bounded<T>(&self, call: impl Future<Output = MediaResult<T>>) -> MediaResult<T> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(MediaError::Timeout),
        }
    }
}

/// Handles released when a session ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: usize,
    pub failed: usize,
}

pub struct ViewerSession {
    id: Uuid,
    state: SessionState,
    ctx: SignalingContext,
    tenant: Option<Arc<TenantChannel>>,
    subject_id: Option<String>,
    recv_transport: Option<EgressTransport>,
    transport_connected: bool,
    router_capabilities: Option<Value>,
    consumers: Vec<Consumer>,
}

impl ViewerSession {
    pub fn new(ctx: SignalingContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Init,
            ctx,
            tenant: None,
            subject_id: None,
            recv_transport: None,
            transport_connected: false,
            router_capabilities: None,
            consumers: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn tenant_code(&self) -> Option<&str> {
        self.tenant.as_ref().map(|channel| channel.code())
    }

    pub fn subject_id(&self) -> Option<&str> {
        self.subject_id.as_deref()
    }

    pub fn recv_transport_id(&self) -> Option<&str> {
        self.recv_transport.as_ref().map(|transport| transport.id.as_str())
    }

    pub fn consumer_ids(&self) -> Vec<String> {
        self.consumers.iter().map(|consumer| consumer.id.clone()).collect()
    }

    /// Decodes one text frame and returns the replies for this viewer.
    pub async fn handle_text(&mut self, text: &str) -> Vec<ServerMessage> {
        if self.state == SessionState::Closed {
            debug!(session = %self.id, "ignoring message on closed session");
            return Vec::new();
        }

        match ClientMessage::decode(text) {
            Ok(Decoded::Message(message)) => self.handle(message).await,
            Ok(Decoded::Unrecognized(kind)) => {
                debug!(session = %self.id, kind = %kind, "ignoring unrecognized message type");
                Vec::new()
            }
            Err(err) => {
                warn!(session = %self.id, error = %err, "failed to parse client message");
                vec![ServerMessage::error(ErrorCode::ProtocolError)]
            }
        }
    }

    pub async fn handle(&mut self, message: ClientMessage) -> Vec<ServerMessage> {
        debug!(
            session = %self.id,
            state = self.state.as_str(),
            kind = message.type_name(),
            "handling client message"
        );
        match (self.state, message) {
            (SessionState::Closed, _) => Vec::new(),
            (SessionState::Init, ClientMessage::Join(join)) => self.join(join).await,
            (_, ClientMessage::Join(_)) => {
                warn!(session = %self.id, "duplicate join ignored");
                Vec::new()
            }
            (SessionState::Init, ClientMessage::Connect(_)) => {
                vec![ServerMessage::error(ErrorCode::TransportNotReady)]
            }
            (SessionState::Joined, ClientMessage::Connect(connect)) => self.connect(connect).await,
            (SessionState::Active, ClientMessage::Connect(_)) => {
                warn!(session = %self.id, "connect on active session ignored");
                Vec::new()
            }
            (SessionState::Active, ClientMessage::Control(payload)) => {
                self.control(payload).await;
                Vec::new()
            }
            (state, ClientMessage::Control(_)) => {
                debug!(session = %self.id, state = state.as_str(), "control before active ignored");
                Vec::new()
            }
        }
    }

    async fn join(&mut self, join: JoinRequest) -> Vec<ServerMessage> {
        let code = join.tenant_code;
        let validation = match tokio::time::timeout(
            self.ctx.call_timeout,
            self.ctx.validator.validate(&join.token, &code),
        )
        .await
        {
            Ok(validation) => validation,
            Err(_) => {
                warn!(session = %self.id, tenant = %code, "token validation timed out");
                Validation::denied()
            }
        };
        if !validation.ok {
            info!(session = %self.id, tenant = %code, "join rejected: auth failed");
            return self.reject_join(&code, ErrorCode::AuthFailed);
        }

        let channel = match self.ctx.registry.lookup(&code) {
            Some(channel) => channel,
            None => {
                info!(session = %self.id, tenant = %code, "join rejected: unknown tenant");
                return self.reject_join(&code, ErrorCode::StreamNotReady);
            }
        };
        if channel.producers().await.is_empty() {
            info!(session = %self.id, tenant = %code, "join rejected: stream not ready");
            return self.reject_join(&code, ErrorCode::StreamNotReady);
        }

        let transport = match self.ctx.bounded(self.ctx.engine().create_egress_transport()).await {
            Ok(transport) => transport,
            Err(err) => {
                warn!(session = %self.id, tenant = %code, error = %err, "egress transport creation failed");
                return self.fail_join(&code);
            }
        };
        let capabilities = match self.ctx.bounded(self.ctx.engine().rtp_capabilities()).await {
            Ok(capabilities) => capabilities,
            Err(err) => {
                warn!(session = %self.id, tenant = %code, error = %err, "router capabilities unavailable");
                release(self.ctx.engine(), &code, MediaHandle::Transport(transport.id)).await;
                return self.fail_join(&code);
            }
        };

        // The tenant may have been torn down while the engine calls were in flight.
        if channel.producers().await.is_empty() {
            info!(session = %self.id, tenant = %code, "join rejected: stream ended during setup");
            release(self.ctx.engine(), &code, MediaHandle::Transport(transport.id)).await;
            return self.reject_join(&code, ErrorCode::StreamNotReady);
        }

        let viewers = channel.viewer_joined();
        let offer = TransportOffer {
            id: transport.id.clone(),
            ice_parameters: transport.ice_parameters.clone(),
            ice_candidates: transport.ice_candidates.clone(),
            dtls_parameters: transport.dtls_parameters.clone(),
            rtp_capabilities: capabilities.clone(),
        };

        self.tenant = Some(channel);
        self.subject_id = validation.subject_id;
        self.recv_transport = Some(transport);
        self.router_capabilities = Some(capabilities);
        self.state = SessionState::Joined;

        counter!("vitrine_joins_total", "outcome" => "ok").increment(1);
        info!(
            session = %self.id,
            tenant = %code,
            subject = self.subject_id.as_deref().unwrap_or("-"),
            viewers,
            "viewer joined"
        );
        vec![ServerMessage::WebRtcTransport(offer)]
    }

    fn reject_join(&mut self, code: &str, reason: ErrorCode) -> Vec<ServerMessage> {
        self.state = SessionState::Closed;
        counter!("vitrine_joins_total", "outcome" => reason.as_str()).increment(1);
        debug!(session = %self.id, tenant = code, "session closed after rejected join");
        vec![ServerMessage::error(reason)]
    }

    fn fail_join(&mut self, code: &str) -> Vec<ServerMessage> {
        let reason = ErrorCode::ResourceCreationFailed;
        counter!("vitrine_joins_total", "outcome" => reason.as_str()).increment(1);
        debug!(session = %self.id, tenant = code, "join failed; session stays in init");
        vec![ServerMessage::error(reason)]
    }

    async fn connect(&mut self, connect: ConnectRequest) -> Vec<ServerMessage> {
        let (Some(transport_id), Some(channel)) = (
            self.recv_transport_id().map(str::to_string),
            self.tenant.clone(),
        ) else {
            return vec![ServerMessage::error(ErrorCode::TransportNotReady)];
        };
        let code = channel.code().to_string();

        // A retry after a failed consumer attachment reuses the connected transport.
        let mut replies = Vec::new();
        if !self.transport_connected {
            if let Err(err) = self
                .ctx
                .bounded(
                    self.ctx
                        .engine()
                        .connect_egress_transport(&transport_id, connect.dtls_parameters),
                )
                .await
            {
                warn!(session = %self.id, tenant = %code, error = %err, "egress transport connect failed");
                return vec![ServerMessage::error(ErrorCode::ResourceCreationFailed)];
            }
            self.transport_connected = true;
            replies.push(ServerMessage::Connected(true));
        }

        let capabilities = connect
            .rtp_capabilities
            .or_else(|| self.router_capabilities.clone())
            .unwrap_or(Value::Null);

        let producers = channel.producers().await;
        let mut attached: Vec<Consumer> = Vec::new();
        let mut descriptions = Vec::new();
        for producer in producers.ordered() {
            let consumer = match self
                .ctx
                .bounded(self.ctx.engine().create_consumer(
                    &transport_id,
                    &producer,
                    capabilities.clone(),
                ))
                .await
            {
                Ok(consumer) => consumer,
                Err(err) => {
                    warn!(
                        session = %self.id,
                        tenant = %code,
                        kind = %producer.kind,
                        error = %err,
                        "consumer creation failed"
                    );
                    for consumer in attached {
                        release(self.ctx.engine(), &code, MediaHandle::Consumer(consumer.id)).await;
                    }
                    replies.push(ServerMessage::error(ErrorCode::ResourceCreationFailed));
                    return replies;
                }
            };
            counter!("vitrine_consumers_created_total", "kind" => producer.kind.as_str()).increment(1);
            descriptions.push(ConsumerDescription {
                kind: producer.kind,
                id: consumer.id.clone(),
                producer_id: producer.id.clone(),
                rtp_parameters: consumer.rtp_parameters.clone(),
            });
            attached.push(consumer);
        }

        info!(
            session = %self.id,
            tenant = %code,
            consumers = descriptions.len(),
            "viewer active"
        );
        self.consumers = attached;
        self.state = SessionState::Active;
        replies.push(ServerMessage::Consumers(descriptions));
        replies
    }

    async fn control(&self, payload: Value) {
        if let Some(code) = self.tenant_code() {
            self.ctx.relay.forward(code, &payload).await;
        }
    }

    /// Ends the session and releases every handle it owns.
    ///
    /// Each release is attempted even if an earlier one failed. Calling this
    /// again releases nothing.
    pub async fn close(&mut self) -> ReleaseReport {
        self.state = SessionState::Closed;

        let code = self.tenant_code().unwrap_or("-").to_string();
        let mut handles: Vec<MediaHandle> = self
            .consumers
            .drain(..)
            .map(|consumer| MediaHandle::Consumer(consumer.id))
            .collect();
        if let Some(transport) = self.recv_transport.take() {
            handles.push(MediaHandle::Transport(transport.id));
        }

        let mut report = ReleaseReport::default();
        for handle in handles {
            if release(self.ctx.engine(), &code, handle).await {
                report.released += 1;
            } else {
                report.failed += 1;
            }
        }

        if let Some(channel) = self.tenant.take() {
            let remaining = channel.viewer_left();
            debug!(session = %self.id, tenant = %code, remaining, "viewer left tenant");
        }

        debug!(
            session = %self.id,
            released = report.released,
            failed = report.failed,
            "session closed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{InMemoryMediaEngine, IngressTransport, MediaKind, Producer};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    struct Always(bool);

    #[async_trait]
    impl TokenValidator for Always {
        async fn validate(&self, _token: &str, _tenant_code: &str) -> Validation {
            if self.0 {
                Validation::granted("viewer-1")
            } else {
                Validation::denied()
            }
        }
    }

    struct Stalled;

    #[async_trait]
    impl TokenValidator for Stalled {
        async fn validate(&self, _token: &str, _tenant_code: &str) -> Validation {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Validation::granted("late")
        }
    }

    /// Tears the tenant down while a viewer's egress transport is being created.
    #[derive(Default)]
    struct TeardownDuringJoin {
        inner: InMemoryMediaEngine,
        registry: std::sync::OnceLock<TenantRegistry>,
    }

    #[async_trait]
    impl MediaEngine for TeardownDuringJoin {
        async fn create_ingress_transport(&self, ip: Option<&str>) -> MediaResult<IngressTransport> {
            self.inner.create_ingress_transport(ip).await
        }

        async fn create_producer(
            &self,
            transport_id: &str,
            kind: MediaKind,
            rtp_parameters: Value,
        ) -> MediaResult<Producer> {
            self.inner.create_producer(transport_id, kind, rtp_parameters).await
        }

        async fn create_egress_transport(&self) -> MediaResult<EgressTransport> {
            if let Some(registry) = self.registry.get() {
                registry.teardown("acme").await;
            }
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

    async fn context(validator: Arc<dyn TokenValidator>, engine: InMemoryMediaEngine) -> SignalingContext {
        let registry = TenantRegistry::new(Arc::new(engine), None);
        registry.get_or_create_ingress("acme").await.unwrap();
        registry.get_or_create_producers("acme").await.unwrap();
        let relay = AgentRelay::new(registry.clone(), HashMap::new(), Duration::from_secs(1));
        SignalingContext {
            registry,
            validator,
            relay,
            call_timeout: Duration::from_millis(200),
        }
    }

    fn join(code: &str) -> String {
        json!({"type": "join", "data": {"tenantCode": code, "token": "T1"}}).to_string()
    }

    fn connect() -> String {
        json!({"type": "connect", "data": {"dtlsParameters": {"role": "client"}}}).to_string()
    }

    #[test_timeout::tokio_timeout_test]
    async fn connect_before_join_is_rejected_without_state_change() {
        let ctx = context(Arc::new(Always(true)), InMemoryMediaEngine::new()).await;
        let mut session = ViewerSession::new(ctx);

        let replies = session.handle_text(&connect()).await;
        assert_eq!(replies, vec![ServerMessage::error(ErrorCode::TransportNotReady)]);
        assert_eq!(session.state(), SessionState::Init);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stalled_validator_counts_as_auth_failure() {
        let ctx = context(Arc::new(Stalled), InMemoryMediaEngine::new()).await;
        let mut session = ViewerSession::new(ctx);

        let replies = session.handle_text(&join("acme")).await;
        assert_eq!(replies, vec![ServerMessage::error(ErrorCode::AuthFailed)]);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_session_sends_nothing_more() {
        let ctx = context(Arc::new(Always(false)), InMemoryMediaEngine::new()).await;
        let mut session = ViewerSession::new(ctx);

        session.handle_text(&join("acme")).await;
        assert!(session.handle_text(&join("acme")).await.is_empty());
        assert!(session.handle_text(&connect()).await.is_empty());
        assert!(session.handle_text("{broken").await.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn parse_failure_reports_protocol_error_and_keeps_state() {
        let ctx = context(Arc::new(Always(true)), InMemoryMediaEngine::new()).await;
        let mut session = ViewerSession::new(ctx);

        let replies = session.handle_text("not json at all").await;
        assert_eq!(replies, vec![ServerMessage::error(ErrorCode::ProtocolError)]);
        assert_eq!(session.state(), SessionState::Init);

        assert!(session
            .handle_text(r#"{"type":"subscribe","data":{}}"#)
            .await
            .is_empty());
        assert_eq!(session.state(), SessionState::Init);
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_releases_each_handle_once_and_tracks_viewers() {
        let engine = InMemoryMediaEngine::new();
        let ctx = context(Arc::new(Always(true)), engine.clone()).await;
        let registry = ctx.registry.clone();
        let mut session = ViewerSession::new(ctx);

        session.handle_text(&join("acme")).await;
        session.handle_text(&connect()).await;
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(registry.lookup("acme").unwrap().viewer_count(), 1);

        let transport_id = session.recv_transport_id().unwrap().to_string();
        let consumer_ids = session.consumer_ids();
        assert_eq!(consumer_ids.len(), 2);

        let report = session.close().await;
        assert_eq!(report, ReleaseReport { released: 3, failed: 0 });
        assert_eq!(engine.close_count(&transport_id), 1);
        for id in &consumer_ids {
            assert_eq!(engine.close_count(id), 1);
        }
        assert_eq!(registry.lookup("acme").unwrap().viewer_count(), 0);

        assert_eq!(session.close().await, ReleaseReport::default());
        // Only the tenant's ingress transports and producers remain.
        assert_eq!(engine.counts().live_handles, 4);
    }

    #[test_timeout::tokio_timeout_test]
    async fn teardown_during_join_rejects_the_viewer() {
        let engine = Arc::new(TeardownDuringJoin::default());
        let registry = TenantRegistry::new(engine.clone(), None);
        registry.get_or_create_ingress("acme").await.unwrap();
        registry.get_or_create_producers("acme").await.unwrap();
        assert!(engine.registry.set(registry.clone()).is_ok());
        let relay = AgentRelay::new(registry.clone(), HashMap::new(), Duration::from_secs(1));
        let mut session = ViewerSession::new(SignalingContext {
            registry: registry.clone(),
            validator: Arc::new(Always(true)),
            relay,
            call_timeout: Duration::from_millis(200),
        });

        let replies = session.handle_text(&join("acme")).await;
        assert_eq!(replies, vec![ServerMessage::error(ErrorCode::StreamNotReady)]);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.lookup("acme").is_none());
        assert_eq!(engine.inner.counts().live_handles, 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn duplicate_join_does_not_replace_tenant() {
        let ctx = context(Arc::new(Always(true)), InMemoryMediaEngine::new()).await;
        ctx.registry.get_or_create_ingress("globex").await.unwrap();
        ctx.registry.get_or_create_producers("globex").await.unwrap();
        let mut session = ViewerSession::new(ctx);

        session.handle_text(&join("acme")).await;
        assert!(session.handle_text(&join("globex")).await.is_empty());
        assert_eq!(session.tenant_code(), Some("acme"));
        assert_eq!(session.subject_id(), Some("viewer-1"));
    }
}

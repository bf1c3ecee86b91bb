use std::sync::{
    atomic::{AtomicU16, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    router_media_codecs, Consumer, EgressTransport, IngressTransport, MediaEngine, MediaError,
    MediaHandle, MediaKind, MediaResult, Producer,
};

const FIRST_INGRESS_PORT: u16 = 40_000;

/// Loopback engine that hands out handles without moving any media.
///
/// Used when no media worker is configured, and by tests to count how many
/// handles were created and released.
#[derive(Clone, Default)]
pub struct InMemoryMediaEngine {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    live: DashMap<String, &'static str>,
    next_port: AtomicU16,
    ingress_created: AtomicUsize,
    producers_created: AtomicUsize,
    egress_created: AtomicUsize,
    consumers_created: AtomicUsize,
    closed: DashMap<String, usize>,
}

/// Creation and release counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounts {
    pub ingress_created: usize,
    pub producers_created: usize,
    pub egress_created: usize,
    pub consumers_created: usize,
    pub live_handles: usize,
}

impl InMemoryMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> EngineCounts {
        EngineCounts {
            ingress_created: self.inner.ingress_created.load(Ordering::SeqCst),
            producers_created: self.inner.producers_created.load(Ordering::SeqCst),
            egress_created: self.inner.egress_created.load(Ordering::SeqCst),
            consumers_created: self.inner.consumers_created.load(Ordering::SeqCst),
            live_handles: self.inner.live.len(),
        }
    }

    /// How many times `close` succeeded for the given handle id.
    pub fn close_count(&self, id: &str) -> usize {
        self.inner.closed.get(id).map(|entry| *entry).unwrap_or(0)
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.inner.live.contains_key(id)
    }

    fn mint(&self, label: &'static str) -> String {
        let id = Uuid::new_v4().to_string();
        self.inner.live.insert(id.clone(), label);
        id
    }

    fn require(&self, id: &str, kind: &'static str) -> MediaResult<()> {
        match self.inner.live.get(id) {
            Some(entry) if *entry == kind => Ok(()),
            _ => Err(MediaError::UnknownHandle {
                kind,
                id: id.to_string(),
            }),
        }
    }
}

#[async_trait]
impl MediaEngine for InMemoryMediaEngine {
    async fn create_ingress_transport(&self, announced_ip: Option<&str>) -> MediaResult<IngressTransport> {
        let offset = self.inner.next_port.fetch_add(2, Ordering::SeqCst);
        self.inner.ingress_created.fetch_add(1, Ordering::SeqCst);
        Ok(IngressTransport {
            id: self.mint("transport"),
            ip: announced_ip.unwrap_or("127.0.0.1").to_string(),
            port: FIRST_INGRESS_PORT.wrapping_add(offset),
        })
    }

    async fn create_producer(
        &self,
        transport_id: &str,
        kind: MediaKind,
        _rtp_parameters: Value,
    ) -> MediaResult<Producer> {
        self.require(transport_id, "transport")?;
        self.inner.producers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Producer {
            id: self.mint("producer"),
            kind,
        })
    }

    async fn create_egress_transport(&self) -> MediaResult<EgressTransport> {
        self.inner.egress_created.fetch_add(1, Ordering::SeqCst);
        Ok(EgressTransport {
            id: self.mint("transport"),
            ice_parameters: json!({ "usernameFragment": "loopback", "password": "loopback" }),
            ice_candidates: json!([]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
        })
    }

    async fn connect_egress_transport(&self, transport_id: &str, _dtls_parameters: Value) -> MediaResult<()> {
        self.require(transport_id, "transport")
    }

    async fn create_consumer(
        &self,
        transport_id: &str,
        producer: &Producer,
        _rtp_capabilities: Value,
    ) -> MediaResult<Consumer> {
        self.require(transport_id, "transport")?;
        self.require(&producer.id, "producer")?;
        self.inner.consumers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Consumer {
            id: self.mint("consumer"),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            rtp_parameters: json!({ "codecs": [], "encodings": [] }),
        })
    }

    async fn rtp_capabilities(&self) -> MediaResult<Value> {
        Ok(json!({ "codecs": router_media_codecs(), "headerExtensions": [] }))
    }

    async fn close(&self, handle: MediaHandle) -> MediaResult<()> {
        let kind = handle.label();
        match self.inner.live.remove(handle.id()) {
            Some(_) => {
                *self.inner.closed.entry(handle.id().to_string()).or_insert(0) += 1;
                Ok(())
            }
            None => Err(MediaError::UnknownHandle {
                kind,
                id: handle.id().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn consumer_requires_live_transport_and_producer() {
        let engine = InMemoryMediaEngine::new();
        let ingress = engine.create_ingress_transport(Some("203.0.113.7")).await.unwrap();
        assert_eq!(ingress.ip, "203.0.113.7");

        let producer = engine
            .create_producer(&ingress.id, MediaKind::Video, json!({}))
            .await
            .unwrap();
        let egress = engine.create_egress_transport().await.unwrap();
        let consumer = engine
            .create_consumer(&egress.id, &producer, json!({}))
            .await
            .unwrap();
        assert_eq!(consumer.producer_id, producer.id);
        assert_eq!(consumer.kind, MediaKind::Video);

        engine.close(MediaHandle::Transport(egress.id.clone())).await.unwrap();
        let err = engine
            .create_consumer(&egress.id, &producer, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::UnknownHandle { kind: "transport", .. }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn double_close_is_rejected_and_counted_once() {
        let engine = InMemoryMediaEngine::new();
        let egress = engine.create_egress_transport().await.unwrap();

        engine.close(MediaHandle::Transport(egress.id.clone())).await.unwrap();
        assert!(engine.close(MediaHandle::Transport(egress.id.clone())).await.is_err());
        assert_eq!(engine.close_count(&egress.id), 1);
        assert_eq!(engine.counts().live_handles, 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn ingress_ports_are_distinct() {
        let engine = InMemoryMediaEngine::new();
        let first = engine.create_ingress_transport(None).await.unwrap();
        let second = engine.create_ingress_transport(None).await.unwrap();
        assert_ne!(first.port, second.port);
        assert_eq!(engine.counts().ingress_created, 2);
    }
}

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::media::{
    ingress_rtp_parameters, IngressTransport, MediaEngine, MediaError, MediaHandle, MediaKind,
    Producer,
};
use crate::relay::AgentLink;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("resource creation failed: {0}")]
    ResourceCreation(#[from] MediaError),
    #[error("tenant {0} has no ingress transport")]
    NoIngress(String),
}

/// Video and audio ingress transports of one tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct IngressPair {
    pub video: IngressTransport,
    pub audio: IngressTransport,
}

impl IngressPair {
    pub fn transport(&self, kind: MediaKind) -> &IngressTransport {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }
}

/// Snapshot of a tenant's producers, at most one per kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProducerSet {
    pub video: Option<Producer>,
    pub audio: Option<Producer>,
}

impl ProducerSet {
    pub fn get(&self, kind: MediaKind) -> Option<&Producer> {
        match kind {
            MediaKind::Video => self.video.as_ref(),
            MediaKind::Audio => self.audio.as_ref(),
        }
    }

    /// Producers in attachment order: video first, then audio.
    pub fn ordered(&self) -> Vec<Producer> {
        MediaKind::ORDERED
            .iter()
            .filter_map(|kind| self.get(*kind).cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

#[derive(Default)]
struct TenantResources {
    ingress: Option<IngressPair>,
    producers: ProducerSet,
}

impl TenantResources {
    fn slot(&mut self, kind: MediaKind) -> &mut Option<Producer> {
        match kind {
            MediaKind::Video => &mut self.producers.video,
            MediaKind::Audio => &mut self.producers.audio,
        }
    }
}

pub struct TenantChannel {
    code: String,
    created_at: Instant,
    resources: Mutex<TenantResources>,
    pub(crate) agent: Mutex<Option<AgentLink>>,
    viewers: AtomicUsize,
}

impl TenantChannel {
    fn new(code: String) -> Self {
        Self {
            code,
            created_at: Instant::now(),
            resources: Mutex::new(TenantResources::default()),
            agent: Mutex::new(None),
            viewers: AtomicUsize::new(0),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub async fn producers(&self) -> ProducerSet {
        self.resources.lock().await.producers.clone()
    }

    pub async fn ingress(&self) -> Option<IngressPair> {
        self.resources.lock().await.ingress.clone()
    }

    pub fn viewer_joined(&self) -> usize {
        self.viewers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn viewer_left(&self) -> usize {
        let previous = self
            .viewers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantSnapshot {
    pub code: String,
    pub has_ingress: bool,
    pub producers: Vec<MediaKind>,
    pub viewers: usize,
    pub agent_connected: bool,
    pub age_seconds: u64,
}

#[derive(Clone)]
pub struct TenantRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    tenants: DashMap<String, Arc<TenantChannel>>,
    engine: Arc<dyn MediaEngine>,
    announced_ip: Option<String>,
}

impl TenantRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>, announced_ip: Option<String>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tenants: DashMap::new(),
                engine,
                announced_ip,
            }),
        }
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.inner.engine
    }

    pub fn lookup(&self, code: &str) -> Option<Arc<TenantChannel>> {
        self.inner
            .tenants
            .get(code)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the tenant's channel, creating an empty one on first reference.
    pub fn channel(&self, code: &str) -> Arc<TenantChannel> {
        if let Some(existing) = self.lookup(code) {
            return existing;
        }
        match self.inner.tenants.entry(code.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                debug!(tenant = code, "registering tenant channel");
                Arc::clone(entry.insert(Arc::new(TenantChannel::new(code.to_string()))).value())
            }
        }
    }

    pub async fn get_or_create_ingress(&self, code: &str) -> Result<IngressPair, RegistryError> {
        let channel = self.channel(code);
        let mut resources = channel.resources.lock().await;
        if let Some(existing) = &resources.ingress {
            return Ok(existing.clone());
        }

        let engine = &self.inner.engine;
        let announced = self.inner.announced_ip.as_deref();
        let video = engine
            .create_ingress_transport(announced)
            .await
            .map_err(|err| creation_failed(code, "ingress", err))?;
        let audio = match engine.create_ingress_transport(announced).await {
            Ok(audio) => audio,
            Err(err) => {
                release(engine.as_ref(), code, MediaHandle::Transport(video.id)).await;
                return Err(creation_failed(code, "ingress", err));
            }
        };

        let pair = IngressPair { video, audio };
        resources.ingress = Some(pair.clone());
        counter!("vitrine_ingress_created_total").increment(1);
        info!(
            tenant = code,
            video_port = pair.video.port,
            audio_port = pair.audio.port,
            "ingress transports ready"
        );
        Ok(pair)
    }

    pub async fn get_or_create_producers(&self, code: &str) -> Result<ProducerSet, RegistryError> {
        let channel = self
            .lookup(code)
            .ok_or_else(|| RegistryError::NoIngress(code.to_string()))?;
        let mut resources = channel.resources.lock().await;
        let ingress = resources
            .ingress
            .clone()
            .ok_or_else(|| RegistryError::NoIngress(code.to_string()))?;

        for kind in MediaKind::ORDERED {
            if resources.slot(kind).is_some() {
                continue;
            }
            let producer = self
                .inner
                .engine
                .create_producer(&ingress.transport(kind).id, kind, ingress_rtp_parameters(kind))
                .await
                .map_err(|err| creation_failed(code, "producer", err))?;
            info!(tenant = code, kind = %kind, producer_id = %producer.id, "producer ready");
            counter!("vitrine_producers_created_total", "kind" => kind.as_str()).increment(1);
            *resources.slot(kind) = Some(producer);
        }

        Ok(resources.producers.clone())
    }

    /// Current producers of a tenant; empty for unknown tenants.
    pub async fn producers(&self, code: &str) -> ProducerSet {
        match self.lookup(code) {
            Some(channel) => channel.producers().await,
            None => ProducerSet::default(),
        }
    }

    /// Releases every resource of a tenant and forgets it.
    ///
    /// Viewer sessions keep their own egress transports and consumers; the
    /// engine closes consumers whose producer goes away.
    pub async fn teardown(&self, code: &str) -> bool {
        let Some((_, channel)) = self.inner.tenants.remove(code) else {
            return false;
        };

        let resources = std::mem::take(&mut *channel.resources.lock().await);
        let engine = self.inner.engine.as_ref();
        for producer in resources.producers.ordered() {
            release(engine, code, MediaHandle::Producer(producer.id)).await;
        }
        if let Some(ingress) = resources.ingress {
            release(engine, code, MediaHandle::Transport(ingress.video.id)).await;
            release(engine, code, MediaHandle::Transport(ingress.audio.id)).await;
        }
        channel.agent.lock().await.take();

        info!(tenant = code, viewers = channel.viewer_count(), "tenant torn down");
        true
    }

    pub async fn teardown_all(&self) -> usize {
        let codes: Vec<String> = self
            .inner
            .tenants
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for code in codes {
            if self.teardown(&code).await {
                removed += 1;
            }
        }
        removed
    }

    pub async fn snapshot(&self) -> Vec<TenantSnapshot> {
        let channels: Vec<Arc<TenantChannel>> = self
            .inner
            .tenants
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut snapshots = Vec::with_capacity(channels.len());
        for channel in channels {
            let (has_ingress, producers) = {
                let resources = channel.resources.lock().await;
                let kinds = resources
                    .producers
                    .ordered()
                    .into_iter()
                    .map(|producer| producer.kind)
                    .collect();
                (resources.ingress.is_some(), kinds)
            };
            let agent_connected = channel
                .agent
                .lock()
                .await
                .as_ref()
                .map(AgentLink::is_open)
                .unwrap_or(false);
            snapshots.push(TenantSnapshot {
                code: channel.code.clone(),
                has_ingress,
                producers,
                viewers: channel.viewer_count(),
                agent_connected,
                age_seconds: channel.created_at.elapsed().as_secs(),
            });
        }
        snapshots.sort_by(|a, b| a.code.cmp(&b.code));
        snapshots
    }
}

fn creation_failed(code: &str, resource: &'static str, err: MediaError) -> RegistryError {
    warn!(tenant = code, resource, error = %err, "media resource creation failed");
    counter!(
        "vitrine_resource_creation_failures_total",
        "resource" => resource,
        "reason" => err.metric_label()
    )
    .increment(1);
    RegistryError::ResourceCreation(err)
}

/// Best-effort close; failures are logged and counted, never propagated.
pub(crate) async fn release(engine: &dyn MediaEngine, tenant: &str, handle: MediaHandle) -> bool {
    let label = handle.label();
    let id = handle.id().to_string();
    match engine.close(handle).await {
        Ok(()) => {
            counter!("vitrine_media_releases_total", "handle" => label).increment(1);
            true
        }
        Err(err) => {
            warn!(tenant, handle = label, id = %id, error = %err, "failed to release media handle");
            counter!("vitrine_media_release_failures_total", "handle" => label).increment(1);
            false
        }
    }
}

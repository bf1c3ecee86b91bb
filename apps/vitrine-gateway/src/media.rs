use std::fmt;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub mod http;
pub mod memory;

pub use http::HttpMediaEngine;
pub use memory::InMemoryMediaEngine;

pub const VIDEO_PAYLOAD_TYPE: u8 = 102;
pub const AUDIO_PAYLOAD_TYPE: u8 = 111;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Consumer attachment order for a viewer.
    pub const ORDERED: [MediaKind; 2] = [MediaKind::Video, MediaKind::Audio];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receive-only transport carrying a tenant's media into the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressTransport {
    pub id: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Producer {
    pub id: String,
    pub kind: MediaKind,
}

/// Viewer-facing transport plus the parameters the browser needs to connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressTransport {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumer {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// Anything the engine can be asked to close.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaHandle {
    Transport(String),
    Producer(String),
    Consumer(String),
}

impl MediaHandle {
    pub fn id(&self) -> &str {
        match self {
            MediaHandle::Transport(id) | MediaHandle::Producer(id) | MediaHandle::Consumer(id) => id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MediaHandle::Transport(_) => "transport",
            MediaHandle::Producer(_) => "producer",
            MediaHandle::Consumer(_) => "consumer",
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media engine unreachable: {0}")]
    Unavailable(String),
    #[error("media engine timed out")]
    Timeout,
    #[error("media engine rejected request: {status} body={body}")]
    Rejected { status: u16, body: String },
    #[error("unexpected media engine response: {0}")]
    Decode(String),
    #[error("unknown {kind} {id}")]
    UnknownHandle { kind: &'static str, id: String },
}

impl MediaError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            MediaError::Unavailable(_) => "unavailable",
            MediaError::Timeout => "timeout",
            MediaError::Rejected { .. } => "rejected",
            MediaError::Decode(_) => "decode",
            MediaError::UnknownHandle { .. } => "unknown_handle",
        }
    }
}

pub type MediaResult<T> = Result<T, MediaError>;

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_ingress_transport(&self, announced_ip: Option<&str>) -> MediaResult<IngressTransport>;

    async fn create_producer(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Producer>;

    async fn create_egress_transport(&self) -> MediaResult<EgressTransport>;

    async fn connect_egress_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()>;

    async fn create_consumer(
        &self,
        transport_id: &str,
        producer: &Producer,
        rtp_capabilities: Value,
    ) -> MediaResult<Consumer>;

    async fn rtp_capabilities(&self) -> MediaResult<Value>;

    async fn close(&self, handle: MediaHandle) -> MediaResult<()>;
}

/// Codec set the engine's router is created with.
pub fn router_media_codecs() -> Value {
    json!([
        {
            "kind": "audio",
            "mimeType": "audio/opus",
            "clockRate": 48000,
            "channels": 2,
            "preferredPayloadType": AUDIO_PAYLOAD_TYPE,
            "rtcpFeedback": [{ "type": "transport-cc" }]
        },
        {
            "kind": "video",
            "mimeType": "video/H264",
            "clockRate": 90000,
            "preferredPayloadType": VIDEO_PAYLOAD_TYPE,
            "parameters": {
                "packetization-mode": 1,
                "level-asymmetry-allowed": 1,
                "profile-level-id": "42e01f"
            },
            "rtcpFeedback": [
                { "type": "nack" },
                { "type": "nack", "parameter": "pli" },
                { "type": "ccm", "parameter": "fir" },
                { "type": "goog-remb" },
                { "type": "transport-cc" }
            ]
        }
    ])
}

/// RTP parameters for a producer fed by a tenant's plain RTP sender.
pub fn ingress_rtp_parameters(kind: MediaKind) -> Value {
    let ssrc: u32 = rand::thread_rng().gen_range(1..1_000_000_000);
    let codec = match kind {
        MediaKind::Video => json!({
            "mimeType": "video/H264",
            "clockRate": 90000,
            "payloadType": VIDEO_PAYLOAD_TYPE,
            "parameters": { "packetization-mode": 1 }
        }),
        MediaKind::Audio => json!({
            "mimeType": "audio/opus",
            "clockRate": 48000,
            "channels": 2,
            "payloadType": AUDIO_PAYLOAD_TYPE
        }),
    };
    json!({ "codecs": [codec], "encodings": [{ "ssrc": ssrc }] })
}

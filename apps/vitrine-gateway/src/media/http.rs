use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    Consumer, EgressTransport, IngressTransport, MediaEngine, MediaError, MediaHandle, MediaKind,
    MediaResult, Producer,
};

/// Client for an out-of-process media worker exposing a small REST surface.
#[derive(Clone)]
pub struct HttpMediaEngine {
    http: Client,
    base_url: String,
}

impl HttpMediaEngine {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> MediaResult<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| MediaError::Unavailable(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> MediaResult<T> {
        debug!(path, "media worker request");
        let response = self
            .http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        decode(check(response).await?).await
    }
}

fn transport_error(err: reqwest::Error) -> MediaError {
    if err.is_timeout() {
        MediaError::Timeout
    } else {
        MediaError::Unavailable(err.to_string())
    }
}

async fn check(response: Response) -> MediaResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(MediaError::Rejected { status, body })
}

async fn decode<T: DeserializeOwned>(response: Response) -> MediaResult<T> {
    let bytes = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&bytes).map_err(|err| MediaError::Decode(err.to_string()))
}

#[async_trait]
impl MediaEngine for HttpMediaEngine {
    async fn create_ingress_transport(&self, announced_ip: Option<&str>) -> MediaResult<IngressTransport> {
        self.post(
            "/transports/plain",
            json!({
                "listenIp": "0.0.0.0",
                "announcedIp": announced_ip,
                "rtcpMux": true,
                "comedia": true,
            }),
        )
        .await
    }

    async fn create_producer(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Producer> {
        self.post(
            &format!("/transports/{transport_id}/producers"),
            json!({ "kind": kind, "rtpParameters": rtp_parameters }),
        )
        .await
    }

    async fn create_egress_transport(&self) -> MediaResult<EgressTransport> {
        self.post(
            "/transports/webrtc",
            json!({
                "listenIps": [{ "ip": "0.0.0.0" }],
                "enableUdp": true,
                "enableTcp": true,
                "preferUdp": true,
            }),
        )
        .await
    }

    async fn connect_egress_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        let response = self
            .http
            .post(self.url(&format!("/transports/{transport_id}/connect")))
            .json(&json!({ "dtlsParameters": dtls_parameters }))
            .send()
            .await
            .map_err(transport_error)?;
        check(response).await.map(|_| ())
    }

    async fn create_consumer(
        &self,
        transport_id: &str,
        producer: &Producer,
        rtp_capabilities: Value,
    ) -> MediaResult<Consumer> {
        self.post(
            &format!("/transports/{transport_id}/consumers"),
            json!({ "producerId": producer.id, "rtpCapabilities": rtp_capabilities }),
        )
        .await
    }

    async fn rtp_capabilities(&self) -> MediaResult<Value> {
        let response = self
            .http
            .get(self.url("/rtp-capabilities"))
            .send()
            .await
            .map_err(transport_error)?;
        decode(check(response).await?).await
    }

    async fn close(&self, handle: MediaHandle) -> MediaResult<()> {
        let path = match &handle {
            MediaHandle::Transport(id) => format!("/transports/{id}"),
            MediaHandle::Producer(id) => format!("/producers/{id}"),
            MediaHandle::Consumer(id) => format!("/consumers/{id}"),
        };
        let response = self
            .http
            .delete(self.url(&path))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(MediaError::UnknownHandle {
                kind: handle.label(),
                id: handle.id().to_string(),
            });
        }
        check(response).await.map(|_| ())
    }
}

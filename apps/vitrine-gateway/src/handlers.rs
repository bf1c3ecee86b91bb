use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    connection::ConnectionSnapshot,
    media::{MediaError, AUDIO_PAYLOAD_TYPE, VIDEO_PAYLOAD_TYPE},
    registry::{RegistryError, TenantSnapshot},
    AppState,
};

/// Error reply of the HTTP endpoints: a status plus `{"error": reason}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    reason: &'static str,
}

impl ApiError {
    fn new(status: StatusCode, reason: &'static str) -> Self {
        Self { status, reason }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    fn media(err: MediaError) -> Self {
        warn!(error = %err, "media engine call failed");
        Self::new(StatusCode::BAD_GATEWAY, "media_unavailable")
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.reason }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct RtpAddress {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEndpointResponse {
    pub video: RtpAddress,
    pub audio: RtpAddress,
    pub video_pt: u8,
    pub audio_pt: u8,
    pub rtcp_mux: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active_connections: usize,
    pub tenants: Vec<TenantSnapshot>,
    pub connections: Vec<ConnectionSnapshot>,
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /rtp-capabilities
pub async fn rtp_capabilities(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let engine = state.registry().engine().clone();
    let capabilities = tokio::time::timeout(state.signaling.call_timeout, engine.rtp_capabilities())
        .await
        .unwrap_or(Err(MediaError::Timeout))
        .map_err(ApiError::media)?;
    Ok(Json(capabilities))
}

/// POST /rtp-endpoint/:code - idempotently provision the tenant's ingress
/// transports and tell the encoder where to send RTP.
pub async fn rtp_endpoint(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RtpEndpointResponse>, ApiError> {
    authorize_ingest(&state, &headers, &code).await?;

    let pair = state
        .registry()
        .get_or_create_ingress(&code)
        .await
        .map_err(|err| match err {
            RegistryError::ResourceCreation(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "ingress_failed")
            }
            RegistryError::NoIngress(_) => ApiError::new(StatusCode::NOT_FOUND, "no transport"),
        })?;

    Ok(Json(RtpEndpointResponse {
        video: RtpAddress {
            ip: pair.video.ip,
            port: pair.video.port,
        },
        audio: RtpAddress {
            ip: pair.audio.ip,
            port: pair.audio.port,
        },
        video_pt: VIDEO_PAYLOAD_TYPE,
        audio_pt: AUDIO_PAYLOAD_TYPE,
        rtcp_mux: true,
    }))
}

/// POST /rtp-producers/:code - attach producers once RTP is flowing.
pub async fn rtp_producers(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize_ingest(&state, &headers, &code).await?;

    match state.registry().get_or_create_producers(&code).await {
        Ok(producers) => {
            info!(tenant = %code, kinds = producers.ordered().len(), "producers attached");
            Ok(Json(json!({ "ok": true })))
        }
        Err(RegistryError::NoIngress(_)) => {
            Err(ApiError::new(StatusCode::NOT_FOUND, "no transport"))
        }
        Err(RegistryError::ResourceCreation(_)) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "produce_failed",
        )),
    }
}

/// DELETE /tenants/:code
pub async fn delete_tenant(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    authorize_ingest(&state, &headers, &code).await?;

    if state.registry().teardown(&code).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::new(StatusCode::NOT_FOUND, "unknown tenant"))
    }
}

/// GET /debug/stats
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        active_connections: state.connections.len(),
        tenants: state.registry().snapshot().await,
        connections: state.connections.snapshot(),
    })
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn authorize_ingest(state: &AppState, headers: &HeaderMap, code: &str) -> Result<(), ApiError> {
    let Some(guard) = &state.ingest_guard else {
        return Ok(());
    };
    let key = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(ApiError::unauthorized)?;

    if guard.verify_ingest_key(key, code).await {
        Ok(())
    } else {
        warn!(tenant = code, "ingest key rejected");
        Err(ApiError::unauthorized())
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::media::MediaKind;

/// Raw `{type, data}` envelope as it arrives on the viewer socket.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Messages sent from the viewer to the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Join(JoinRequest),
    Connect(ConnectRequest),
    Control(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "tenantCode", alias = "sellerCode")]
    pub tenant_code: String,
    #[serde(alias = "sid")]
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(rename = "dtlsParameters")]
    pub dtls_parameters: Value,
    /// Receiver capabilities; the router's own are used when absent.
    #[serde(
        rename = "rtpCapabilities",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub rtp_capabilities: Option<Value>,
}

/// Result of decoding one text frame.
#[derive(Debug)]
pub enum Decoded {
    Message(ClientMessage),
    /// Well-formed envelope with a `type` this gateway does not handle.
    Unrecognized(String),
}

#[derive(Debug, thiserror::Error)]
#[error("invalid message: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Decoded, DecodeError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let message = match envelope.kind.as_str() {
            "join" => ClientMessage::Join(serde_json::from_value(envelope.data)?),
            "connect" => ClientMessage::Connect(serde_json::from_value(envelope.data)?),
            "control" => ClientMessage::Control(envelope.data),
            _ => return Ok(Decoded::Unrecognized(envelope.kind)),
        };
        Ok(Decoded::Message(message))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::Connect(_) => "connect",
            ClientMessage::Control(_) => "control",
        }
    }

    pub fn encode(&self) -> String {
        let (kind, data) = match self {
            ClientMessage::Join(join) => ("join", serde_json::to_value(join)),
            ClientMessage::Connect(connect) => ("connect", serde_json::to_value(connect)),
            ClientMessage::Control(payload) => ("control", Ok(payload.clone())),
        };
        serde_json::json!({ "type": kind, "data": data.unwrap_or(Value::Null) }).to_string()
    }
}

/// Messages sent from the gateway to the viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Handshake marker carrying the server time in milliseconds.
    Hello(i64),
    #[serde(rename = "webrtctransport")]
    WebRtcTransport(TransportOffer),
    Connected(bool),
    Consumers(Vec<ConsumerDescription>),
    Error(String),
}

impl ServerMessage {
    pub fn error(code: ErrorCode) -> Self {
        ServerMessage::Error(code.as_str().to_string())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Hello(_) => "hello",
            ServerMessage::WebRtcTransport(_) => "webrtctransport",
            ServerMessage::Connected(_) => "connected",
            ServerMessage::Consumers(_) => "consumers",
            ServerMessage::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOffer {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    pub rtp_capabilities: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescription {
    pub kind: MediaKind,
    pub id: String,
    pub producer_id: String,
    pub rtp_parameters: Value,
}

/// Stable reason codes carried by `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthFailed,
    StreamNotReady,
    TransportNotReady,
    ResourceCreationFailed,
    ProtocolError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::StreamNotReady => "stream_not_ready",
            ErrorCode::TransportNotReady => "transport_not_ready",
            ErrorCode::ResourceCreationFailed => "resource_creation_failed",
            ErrorCode::ProtocolError => "protocol_error",
        }
    }
}

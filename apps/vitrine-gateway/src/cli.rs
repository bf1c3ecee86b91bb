use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::protocol::{ClientMessage, ConnectRequest, JoinRequest, ServerMessage};

#[derive(Debug, Parser)]
#[command(
    name = "vitrine-gateway",
    author,
    version,
    about = "Live-stream signaling gateway and debug client"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "VITRINE_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// Base URL of the auth service (token validation, ingest keys).
    #[arg(long, env = "AUTH_BASE", default_value = "http://127.0.0.1:4000")]
    pub auth_base: String,

    /// Base URL of the media worker. Without it an in-memory loopback engine is used.
    #[arg(long, env = "VITRINE_MEDIA_URL")]
    pub media_url: Option<String>,

    /// Public IP announced on ingress transports.
    #[arg(long, env = "RTP_ANNOUNCED_IP")]
    pub announced_ip: Option<String>,

    /// JSON object mapping tenant codes to agent WebSocket URLs.
    #[arg(long, env = "AGENTS_JSON", default_value = "{}")]
    pub agents_json: String,

    /// Upper bound for one auth or media call.
    #[arg(long, env = "VITRINE_CALL_TIMEOUT_SECS", default_value_t = 10)]
    pub call_timeout_secs: u64,

    /// Upper bound for opening an agent connection.
    #[arg(long, env = "VITRINE_AGENT_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub agent_connect_timeout_secs: u64,

    /// Interval between server pings on viewer connections.
    #[arg(long, env = "VITRINE_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Send a `hello` message when a viewer connects.
    #[arg(
        long,
        env = "VITRINE_SEND_HELLO",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub send_hello: bool,

    /// Require a verified bearer key on the ingest endpoints.
    #[arg(long, env = "VITRINE_REQUIRE_INGEST_AUTH", default_value_t = false)]
    pub require_ingest_auth: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "VITRINE_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Join a tenant's stream as a viewer and print every server message
    Watch {
        /// Gateway WebSocket URL
        #[arg(short, long, default_value = "ws://localhost:3000/ws")]
        url: String,

        /// Tenant code to join
        #[arg(short, long)]
        tenant: String,

        /// Viewer token
        #[arg(long)]
        token: String,

        /// Stop after this many seconds
        #[arg(long, default_value_t = 30)]
        duration: u64,
    },
}

pub async fn run_watch(url: String, tenant: String, token: String, duration: u64) -> Result<()> {
    debug!(url = %url, tenant = %tenant, "connecting watch client");

    let (stream, _) = timeout(Duration::from_secs(5), connect_async(&url))
        .await
        .map_err(|_| anyhow!("connection timeout; is the gateway running?"))?
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut write, mut read) = stream.split();

    let join = ClientMessage::Join(JoinRequest {
        tenant_code: tenant,
        token,
    });
    write.send(Message::text(join.encode())).await?;

    let deadline = Instant::now() + Duration::from_secs(duration);
    loop {
        let frame = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => break,
            Err(_) => {
                println!("watch finished after {duration}s");
                break;
            }
        };
        let Message::Text(text) = frame else {
            continue;
        };
        println!("{}", text.as_str());

        match serde_json::from_str::<ServerMessage>(text.as_str()) {
            Ok(ServerMessage::WebRtcTransport(offer)) => {
                debug!(transport = %offer.id, "transport offered; connecting");
                let connect = ClientMessage::Connect(ConnectRequest {
                    dtls_parameters: json!({"role": "client", "fingerprints": []}),
                    rtp_capabilities: None,
                });
                write.send(Message::text(connect.encode())).await?;
            }
            Ok(ServerMessage::Error(reason)) => {
                println!("gateway reported error: {reason}");
            }
            Ok(_) => {}
            Err(err) => debug!(error = %err, "unparsed server message"),
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

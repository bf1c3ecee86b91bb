use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::mpsc, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{TenantChannel, TenantRegistry};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no agent address configured for tenant {0}")]
    NoAddress(String),
    #[error("agent connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("agent connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("agent link closed")]
    Closed,
}

/// Handle to a tenant's open agent connection.
///
/// Cloning is cheap; all clones feed the same writer task. Once that task
/// ends the link reports itself closed and is replaced on next use.
#[derive(Clone, Debug)]
pub struct AgentLink {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

impl AgentLink {
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send(&self, text: String) -> Result<(), RelayError> {
        self.tx.send(text).map_err(|_| RelayError::Closed)
    }
}

/// Lazily connects tenants' control agents and forwards viewer `control`
/// payloads to them. Delivery is best-effort.
#[derive(Clone)]
pub struct AgentRelay {
    registry: TenantRegistry,
    addresses: Arc<HashMap<String, String>>,
    connect_timeout: Duration,
}

impl AgentRelay {
    pub fn new(
        registry: TenantRegistry,
        addresses: HashMap<String, String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            addresses: Arc::new(addresses),
            connect_timeout,
        }
    }

    pub fn address(&self, code: &str) -> Option<&str> {
        self.addresses.get(code).map(String::as_str)
    }

    /// Returns an open link to the tenant's agent, connecting if needed.
    pub async fn get_agent_connection(&self, code: &str) -> Option<AgentLink> {
        let channel = self.registry.lookup(code)?;
        let mut slot = channel.agent.lock().await;
        if let Some(link) = slot.as_ref() {
            if link.is_open() {
                return Some(link.clone());
            }
            debug!(tenant = code, "agent link closed; reconnecting");
            *slot = None;
        }

        match self.open(code, Arc::downgrade(&channel)).await {
            Ok(link) => {
                *slot = Some(link.clone());
                Some(link)
            }
            Err(RelayError::NoAddress(_)) => {
                debug!(tenant = code, "no agent address configured");
                None
            }
            Err(err) => {
                warn!(tenant = code, error = %err, "agent connection failed");
                counter!("vitrine_agent_connect_failures_total").increment(1);
                None
            }
        }
    }

    /// Sends a control payload to the tenant's agent, JSON-encoded.
    /// Returns whether the payload was handed to an open link.
    pub async fn forward(&self, code: &str, payload: &Value) -> bool {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(err) => {
                warn!(tenant = code, error = %err, "control payload not encodable");
                return false;
            }
        };

        let delivered = match self.get_agent_connection(code).await {
            Some(link) => link.send(text).is_ok(),
            None => false,
        };

        if delivered {
            counter!("vitrine_control_forwarded_total").increment(1);
        } else {
            debug!(tenant = code, "control message dropped; agent unreachable");
            counter!("vitrine_control_dropped_total").increment(1);
        }
        delivered
    }

    async fn open(&self, code: &str, channel: Weak<TenantChannel>) -> Result<AgentLink, RelayError> {
        let url = self
            .address(code)
            .ok_or_else(|| RelayError::NoAddress(code.to_string()))?;

        let (stream, _) = timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| RelayError::ConnectTimeout(self.connect_timeout))??;
        let (mut sink, mut incoming) = stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let link = AgentLink {
            id: Uuid::new_v4(),
            tx,
        };
        let link_id = link.id;
        let tenant = code.to_string();
        info!(tenant = %tenant, url, "agent connected");
        counter!("vitrine_agent_connects_total").increment(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = rx.recv() => {
                        let Some(text) = outbound else { break };
                        if let Err(err) = sink.send(Message::text(text)).await {
                            warn!(tenant = %tenant, error = %err, "agent write failed");
                            break;
                        }
                    }
                    inbound = incoming.next() => match inbound {
                        Some(Ok(Message::Close(frame))) => {
                            debug!(tenant = %tenant, ?frame, "agent closed connection");
                            break;
                        }
                        Some(Ok(message)) => {
                            debug!(tenant = %tenant, len = message.len(), "ignoring agent message");
                        }
                        Some(Err(err)) => {
                            warn!(tenant = %tenant, error = %err, "agent connection error");
                            break;
                        }
                        None => break,
                    }
                }
            }
            rx.close();
            clear_link(channel, link_id).await;
            info!(tenant = %tenant, "agent link closed");
        });

        Ok(link)
    }
}

async fn clear_link(channel: Weak<TenantChannel>, link_id: Uuid) {
    let Some(channel) = channel.upgrade() else {
        return;
    };
    let mut slot = channel.agent.lock().await;
    if slot.as_ref().map(|link| link.id == link_id).unwrap_or(false) {
        *slot = None;
    }
}

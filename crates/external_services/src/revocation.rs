//! Redis pub/sub listener for session revocation events.
//!
//! The control plane publishes on `stream:revoke:{session_id}`. The
//! listener extracts the session id from the channel name and calls
//! into the session manager through [`RevocationSink`]. Revoking a
//! session the edge never saw is normal: the control plane is the
//! authority and may revoke before this edge validated the session.

use crate::error::Result;
use async_trait::async_trait;
use futures::StreamExt;
use metrics::counter;
use serde::Deserialize;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Channel pattern carrying revocation events.
pub const REVOCATION_PATTERN: &str = "stream:revoke:*";

/// Delay before re-subscribing after a lost connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Payload published on a revocation channel.
#[derive(Debug, Clone, Deserialize)]
pub struct RevocationEvent {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub timestamp: String,
}

/// Receiver of revocation events. Implementations must not block; a
/// revocation only fires a close signal.
#[async_trait]
pub trait RevocationSink: Send + Sync + 'static {
    /// Revoke the session. Returns false when the session is unknown
    /// locally.
    async fn revoke(&self, session_id: &str) -> bool;
}

/// Subscribes to the revocation pattern and survives connection loss.
pub struct RevocationListener {
    client: redis::Client,
}

impl RevocationListener {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    /// Build from `REDIS_HOST`/`REDIS_PORT`, falling back to
    /// `REDIS_URL`, falling back to localhost.
    pub fn from_env() -> Result<Self> {
        let url = match env::var("REDIS_HOST") {
            Ok(host) => {
                let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                format!("redis://{}:{}/0", host, port)
            }
            Err(_) => env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
        };
        info!(%url, "revocation listener using Redis");
        Ok(Self::new(redis::Client::open(url)?))
    }

    /// Run until the process exits, re-subscribing with a fixed delay
    /// whenever the subscription drops.
    pub async fn run<S: RevocationSink>(self, sink: Arc<S>) {
        loop {
            match self.subscribe_once(&sink).await {
                Ok(()) => warn!("revocation subscription ended, reconnecting"),
                Err(e) => warn!("revocation subscription failed: {e}, reconnecting"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn subscribe_once<S: RevocationSink>(&self, sink: &Arc<S>) -> Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(REVOCATION_PATTERN).await?;
        info!(pattern = REVOCATION_PATTERN, "subscribed to revocation events");

        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let channel = msg.get_channel_name().to_string();
            let Some(session_id) = extract_session_id(&channel) else {
                warn!(%channel, "revocation message on malformed channel");
                continue;
            };

            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(%channel, "unreadable revocation payload: {e}");
                    continue;
                }
            };
            let event: RevocationEvent = match serde_json::from_str(&payload) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(%channel, "unparseable revocation payload: {e}");
                    continue;
                }
            };

            counter!("gateway_revocation_events_total").increment(1);
            info!(
                session_id,
                user_id = %event.user_id,
                action = %event.action,
                "revocation event"
            );

            if sink.revoke(session_id).await {
                info!(session_id, "session revoked");
            } else {
                debug!(session_id, "revocation for session unknown locally");
            }
        }

        Ok(())
    }
}

/// Session id is the suffix after `stream:revoke:`.
pub fn extract_session_id(channel: &str) -> Option<&str> {
    channel
        .strip_prefix("stream:revoke:")
        .filter(|id| !id.is_empty())
}

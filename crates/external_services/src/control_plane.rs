//! Control-plane client for session validation and edge heartbeats.
//!
//! The control plane is the authority on sessions. The gateway only
//! caches what it returns; on a cache miss with the control plane
//! down, validation fails closed.

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use metrics::counter;
use reqwest::StatusCode;
use serde::Deserialize;
use std::env;
use std::time::Duration;
use tracing::{info, warn};

/// Request timeout for control-plane calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fallback session lifetime when the control plane sends an expiry
/// we cannot parse.
const DEFAULT_EXPIRY_MINUTES: i64 = 15;

/// Raw validation response from the control plane.
#[derive(Debug, Clone, Deserialize)]
struct SessionInfo {
    valid: bool,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    user_id: String,
    #[serde(default, rename = "cuenta_id")]
    tenant_id: String,
    #[serde(default)]
    edge_id: String,
    #[serde(default)]
    dataset: String,
    #[serde(default)]
    expires_at: String,
}

/// A session the control plane vouched for, with a resolved expiry.
#[derive(Debug, Clone)]
pub struct ValidatedSession {
    pub session_id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub edge_id: String,
    pub dataset: String,
    pub expires_at: DateTime<Utc>,
}

/// HTTP client for the control plane.
#[derive(Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            http,
        })
    }

    /// Build from `CONTROL_PLANE_URL` and `INTERNAL_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let base_url = env::var("CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://localhost:8000/api/v2/control".to_string());
        let api_key = env::var("INTERNAL_API_KEY")
            .unwrap_or_else(|_| "dev-internal-key-change-in-production".to_string());
        Self::new(base_url, api_key)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Validate a session id. `Ok(None)` means the control plane
    /// answered and the session is not valid; errors mean we could not
    /// get an answer.
    pub async fn validate_session(&self, session_id: &str) -> Result<Option<ValidatedSession>> {
        let url = format!("{}/validate/{}", self.base_url, session_id);

        let resp = self
            .http
            .get(&url)
            .header("X-Internal-API-Key", &self.api_key)
            .send()
            .await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(Error::ApiKeyRejected),
            status if !status.is_success() => return Err(Error::UnexpectedStatus(status.as_u16())),
            _ => {}
        }

        let info: SessionInfo = resp.json().await?;
        if !info.valid {
            return Ok(None);
        }

        let expires_at = match parse_expiry(&info.expires_at) {
            Some(ts) => ts,
            None => {
                warn!(
                    session_id,
                    expires_at = %info.expires_at,
                    "unparseable session expiry, applying {} minute default",
                    DEFAULT_EXPIRY_MINUTES
                );
                counter!("gateway_expiry_parse_failures_total").increment(1);
                Utc::now() + chrono::Duration::minutes(DEFAULT_EXPIRY_MINUTES)
            }
        };

        info!(
            session_id,
            user_id = %info.user_id,
            tenant_id = %info.tenant_id,
            edge_id = %info.edge_id,
            "session validated"
        );

        Ok(Some(ValidatedSession {
            session_id: info.session_id,
            user_id: info.user_id,
            tenant_id: info.tenant_id,
            edge_id: info.edge_id,
            dataset: info.dataset,
            expires_at,
        }))
    }

    /// Report this edge as online.
    pub async fn edge_heartbeat(&self, edge_id: &str) -> Result<()> {
        let url = format!("{}/edge/{}/heartbeat", self.base_url, edge_id);

        let resp = self
            .http
            .post(&url)
            .header("X-Internal-API-Key", &self.api_key)
            .send()
            .await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::ApiKeyRejected),
            status if !status.is_success() => Err(Error::UnexpectedStatus(status.as_u16())),
            _ => Ok(()),
        }
    }
}

/// Parse a control-plane expiry timestamp, strictest format first:
/// RFC 3339 with offset, then the naive microsecond form some
/// backends emit, then bare seconds.
pub fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

//! Session state and the session manager.
//!
//! Sessions are validated by the control plane and cached here. A
//! session owns a close signal that fires exactly once, on revocation
//! or expiry; everything streaming on behalf of the session watches
//! that signal.

use async_trait::async_trait;
use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use external_services::{ControlPlaneClient, ValidatedSession};
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How often the sweeper scans for expired sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// An active streaming session bound to one tenant.
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub edge_id: String,
    /// Default dataset for queries that do not name one.
    pub dataset: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    active: AtomicBool,
    closed: CancellationToken,
    /// Write handle of the connected browser, if any.
    browser: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl Session {
    pub fn from_validated(info: ValidatedSession) -> Self {
        Self {
            id: info.session_id,
            user_id: info.user_id,
            tenant_id: info.tenant_id,
            edge_id: info.edge_id,
            dataset: info.dataset,
            created_at: Utc::now(),
            expires_at: info.expires_at,
            active: AtomicBool::new(true),
            closed: CancellationToken::new(),
            browser: Mutex::new(None),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark inactive and fire the close signal. Returns true only for
    /// the call that performed the transition.
    pub fn close(&self) -> bool {
        if self.active.swap(false, Ordering::AcqRel) {
            self.closed.cancel();
            self.browser.lock().unwrap().take();
            info!(session_id = %self.id, user_id = %self.user_id, "session closed");
            true
        } else {
            false
        }
    }

    /// Resolves when the close signal fires.
    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn bind_browser(&self, tx: mpsc::UnboundedSender<Message>) {
        *self.browser.lock().unwrap() = Some(tx);
    }
}

/// Source of session validity. Implemented by the control-plane
/// client; mocked in tests.
#[async_trait]
pub trait SessionValidator: Send + Sync + 'static {
    async fn validate(
        &self,
        session_id: &str,
    ) -> Result<Option<ValidatedSession>, external_services::Error>;
}

#[async_trait]
impl SessionValidator for ControlPlaneClient {
    async fn validate(
        &self,
        session_id: &str,
    ) -> Result<Option<ValidatedSession>, external_services::Error> {
        self.validate_session(session_id).await
    }
}

/// Cache of validated sessions with a per-user index.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    user_sessions: DashMap<String, Vec<String>>,
    validator: Arc<dyn SessionValidator>,
}

impl SessionManager {
    pub fn new(validator: Arc<dyn SessionValidator>) -> Self {
        Self {
            sessions: DashMap::new(),
            user_sessions: DashMap::new(),
            validator,
        }
    }

    /// Cached session if fresh, otherwise validate with the control
    /// plane. `Ok(None)` means the session is not valid; errors mean
    /// the control plane could not be reached (fail closed).
    pub async fn get_or_create(
        &self,
        session_id: &str,
    ) -> Result<Option<Arc<Session>>, external_services::Error> {
        if let Some(entry) = self.sessions.get(session_id) {
            let session = entry.clone();
            drop(entry);
            if session.is_active() && !session.is_expired() {
                return Ok(Some(session));
            }
            // Stale entry; evict before revalidating.
            self.revoke(session_id);
        }

        let Some(info) = self.validator.validate(session_id).await? else {
            return Ok(None);
        };

        let session = Arc::new(Session::from_validated(info));
        self.sessions.insert(session_id.to_string(), session.clone());
        self.user_sessions
            .entry(session.user_id.clone())
            .or_default()
            .push(session_id.to_string());

        counter!("gateway_sessions_created_total").increment(1);
        self.update_gauges();
        info!(session_id, user_id = %session.user_id, "session created");
        Ok(Some(session))
    }

    /// Cache-only lookup; never consults the control plane.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.get(session_id)?.clone();
        if session.is_active() && !session.is_expired() {
            Some(session)
        } else {
            None
        }
    }

    /// Mark the session inactive, fire its close signal, and drop it
    /// from the cache and user index. Idempotent; returns false when
    /// the session is unknown or already closed.
    pub fn revoke(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        let was_active = session.close();

        if let Some(mut list) = self.user_sessions.get_mut(&session.user_id) {
            list.retain(|sid| sid != session_id);
            let empty = list.is_empty();
            drop(list);
            if empty {
                self.user_sessions
                    .remove_if(&session.user_id, |_, list| list.is_empty());
            }
        }

        if was_active {
            counter!("gateway_sessions_revoked_total").increment(1);
        }
        self.update_gauges();
        was_active
    }

    /// Revoke every active session for a user. Returns the count.
    pub fn revoke_user(&self, user_id: &str) -> usize {
        let ids: Vec<String> = self
            .user_sessions
            .get(user_id)
            .map(|list| list.clone())
            .unwrap_or_default();

        ids.iter().filter(|id| self.revoke(id)).count()
    }

    /// Active session and user counts.
    pub fn stats(&self) -> (usize, usize) {
        let active = self
            .sessions
            .iter()
            .filter(|entry| entry.is_active() && !entry.is_expired())
            .count();
        (active, self.user_sessions.len())
    }

    /// Spawn the background sweeper that revokes expired sessions.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                manager.sweep_expired();
            }
        })
    }

    fn sweep_expired(&self) {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_expired() || !entry.is_active())
            .map(|entry| entry.key().clone())
            .collect();

        if expired.is_empty() {
            return;
        }
        for session_id in &expired {
            self.revoke(session_id);
        }
        info!(count = expired.len(), "swept expired sessions");
    }

    fn update_gauges(&self) {
        gauge!("gateway_active_sessions").set(self.sessions.len() as f64);
        gauge!("gateway_active_users").set(self.user_sessions.len() as f64);
    }
}

#[async_trait]
impl external_services::RevocationSink for SessionManager {
    async fn revoke(&self, session_id: &str) -> bool {
        let revoked = SessionManager::revoke(self, session_id);
        if !revoked {
            debug!(session_id, "revocation no-op");
        }
        revoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn validated(id: &str, user: &str, expires_in_secs: i64) -> ValidatedSession {
        ValidatedSession {
            session_id: id.to_string(),
            user_id: user.to_string(),
            tenant_id: "tenant-1".to_string(),
            edge_id: "edge-1".to_string(),
            dataset: "sales".to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
        }
    }

    /// Validator backed by a fixed map, counting calls.
    struct MapValidator {
        sessions: HashMap<String, ValidatedSession>,
        calls: AtomicUsize,
    }

    impl MapValidator {
        fn new(sessions: Vec<ValidatedSession>) -> Self {
            Self {
                sessions: sessions
                    .into_iter()
                    .map(|s| (s.session_id.clone(), s))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionValidator for MapValidator {
        async fn validate(
            &self,
            session_id: &str,
        ) -> Result<Option<ValidatedSession>, external_services::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.sessions.get(session_id).cloned())
        }
    }

    /// Validator that fails once, then succeeds.
    struct FlakyValidator {
        inner: MapValidator,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl SessionValidator for FlakyValidator {
        async fn validate(
            &self,
            session_id: &str,
        ) -> Result<Option<ValidatedSession>, external_services::Error> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            }).is_ok()
            {
                return Err(external_services::Error::UnexpectedStatus(503));
            }
            self.inner.validate(session_id).await
        }
    }

    #[tokio::test]
    async fn test_get_or_create_caches() {
        let validator = Arc::new(MapValidator::new(vec![validated("s1", "u1", 60)]));
        let manager = SessionManager::new(validator.clone());

        let first = manager.get_or_create("s1").await.unwrap().unwrap();
        let second = manager.get_or_create("s1").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_create_invalid_not_cached() {
        let validator = Arc::new(MapValidator::new(vec![]));
        let manager = SessionManager::new(validator);

        assert!(manager.get_or_create("missing").await.unwrap().is_none());
        assert!(manager.get("missing").is_none());
        assert_eq!(manager.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_transient_control_plane_failure_then_cached() {
        let validator = Arc::new(FlakyValidator {
            inner: MapValidator::new(vec![validated("s1", "u1", 60)]),
            failures_left: AtomicUsize::new(1),
        });
        let manager = SessionManager::new(validator);

        // First attempt: transport error propagates, nothing cached.
        assert!(manager.get_or_create("s1").await.is_err());
        assert!(manager.get("s1").is_none());

        // Second attempt succeeds and is cached.
        assert!(manager.get_or_create("s1").await.unwrap().is_some());
        assert!(manager.get("s1").is_some());
    }

    #[tokio::test]
    async fn test_revoke_fires_close_signal_once() {
        let validator = Arc::new(MapValidator::new(vec![validated("s1", "u1", 60)]));
        let manager = SessionManager::new(validator);

        let session = manager.get_or_create("s1").await.unwrap().unwrap();
        assert!(session.is_active());

        assert!(manager.revoke("s1"));
        assert!(!session.is_active());
        session.closed().await; // resolves immediately

        // Idempotent.
        assert!(!manager.revoke("s1"));
        assert!(manager.get("s1").is_none());
        assert_eq!(manager.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_revoke_user_closes_all_sessions() {
        let validator = Arc::new(MapValidator::new(vec![
            validated("s1", "u1", 60),
            validated("s2", "u1", 60),
            validated("s3", "u2", 60),
        ]));
        let manager = SessionManager::new(validator);
        for id in ["s1", "s2", "s3"] {
            manager.get_or_create(id).await.unwrap().unwrap();
        }

        assert_eq!(manager.revoke_user("u1"), 2);
        assert!(manager.get("s1").is_none());
        assert!(manager.get("s2").is_none());
        assert!(manager.get("s3").is_some());
        assert_eq!(manager.stats(), (1, 1));
    }

    #[tokio::test]
    async fn test_expired_session_not_returned() {
        let validator = Arc::new(MapValidator::new(vec![validated("s1", "u1", -5)]));
        let manager = SessionManager::new(validator.clone());

        // Validation succeeds but the session is already expired, so
        // lookup must not hand it out.
        manager.get_or_create("s1").await.unwrap().unwrap();
        assert!(manager.get("s1").is_none());

        // A fresh get_or_create revalidates instead of serving the
        // stale entry.
        manager.get_or_create("s1").await.unwrap().unwrap();
        assert_eq!(validator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sweeper_revokes_expired() {
        let validator = Arc::new(MapValidator::new(vec![
            validated("fresh", "u1", 60),
            validated("stale", "u2", -5),
        ]));
        let manager = Arc::new(SessionManager::new(validator));
        manager.get_or_create("fresh").await.unwrap().unwrap();
        let stale = manager.get_or_create("stale").await.unwrap().unwrap();

        manager.sweep_expired();

        assert!(!stale.is_active());
        assert_eq!(manager.stats(), (1, 1));
    }
}

use super::store::{SessionStore, StoreError};
use super::{Session, SessionError};
use crate::config::Settings;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Session counters exposed on `/metrics`
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionMetrics {
    /// Sessions in the store, `None` when the store could not be counted
    pub total_sessions: Option<u64>,
    /// Store backend name
    pub backend: &'static str,
    /// Sessions loaded or created
    pub loads: u64,
    /// Sessions created on first access
    pub created: u64,
    /// Successful saves
    pub saves: u64,
    /// Saves rejected because of a newer stored version
    pub version_conflicts: u64,
    /// Store operations that failed or timed out
    pub persistence_failures: u64,
    /// Ephemeral sessions handed out while the store was unavailable
    pub ephemeral_sessions: u64,
}

/// Stored record after the TTL check
enum Loaded {
    Live(Session),
    /// Missing or expired; carries the last known version
    Absent { version: u64 },
}

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicU64,
    created: AtomicU64,
    saves: AtomicU64,
    version_conflicts: AtomicU64,
    persistence_failures: AtomicU64,
    ephemeral_sessions: AtomicU64,
}

/// Loads and persists sessions with deadlines and version checks
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
    op_timeout: Duration,
    batch_concurrency: usize,
    counters: Arc<Counters>,
}

impl SessionManager {
    /// Create a manager over `store`
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        ttl: Duration,
        op_timeout: Duration,
        batch_concurrency: usize,
    ) -> Self {
        Self {
            store,
            ttl,
            op_timeout,
            batch_concurrency: batch_concurrency.max(1),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create a manager using the session settings
    #[must_use]
    pub fn from_settings(store: Arc<dyn SessionStore>, settings: &Settings) -> Self {
        Self::new(
            store,
            settings.session_ttl(),
            settings.session_store_timeout(),
            settings.session_batch_concurrency,
        )
    }

    async fn with_deadline<T>(
        &self,
        user_id: i64,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, SessionError> {
        let result = match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result,
            Err(_elapsed) => Err(StoreError::Timeout(self.op_timeout)),
        };
        result.map_err(|source| {
            self.counters
                .persistence_failures
                .fetch_add(1, Ordering::Relaxed);
            SessionError::Persistence { user_id, source }
        })
    }

    async fn load_live(&self, user_id: i64) -> Result<Loaded, SessionError> {
        let stored = self.with_deadline(user_id, self.store.load(user_id)).await?;
        match stored {
            Some(session) if session.user_id != user_id => Err(SessionError::InvalidState {
                user_id,
                reason: format!("stored record belongs to user {}", session.user_id),
            }),
            Some(session) if session.is_expired(self.ttl, Utc::now()) => {
                debug!(user_id, version = session.version, "Stored session expired");
                Ok(Loaded::Absent {
                    version: session.version,
                })
            }
            Some(session) => Ok(Loaded::Live(session)),
            None => Ok(Loaded::Absent { version: 0 }),
        }
    }

    /// Loads the session of `user_id`, creating it on first access
    ///
    /// An expired session is replaced by an empty one that keeps the stored
    /// version, so versions never go backwards.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Persistence`] when the store fails or times
    /// out, [`SessionError::InvalidState`] when the stored record is corrupt.
    pub async fn try_get_session(&self, user_id: i64) -> Result<Session, SessionError> {
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        match self.load_live(user_id).await? {
            Loaded::Live(session) => Ok(session),
            Loaded::Absent { version } => {
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                Ok(Session {
                    version,
                    ..Session::new(user_id)
                })
            }
        }
    }

    /// Loads the session of `user_id`, never failing
    ///
    /// Store failures degrade to an ephemeral in-memory session for this turn.
    pub async fn get_session(&self, user_id: i64) -> Session {
        match self.try_get_session(user_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(user_id, error = %e, "Using ephemeral session");
                self.counters
                    .ephemeral_sessions
                    .fetch_add(1, Ordering::Relaxed);
                Session::ephemeral(user_id)
            }
        }
    }

    /// Persists `session` if nobody saved a newer version in the meantime
    ///
    /// On success the session's `version` and `last_activity_at` are updated
    /// to the stored values.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::VersionConflict`] when the store holds a
    /// different version, [`SessionError::InvalidState`] for ephemeral
    /// sessions, [`SessionError::Persistence`] on store failure.
    pub async fn try_save_session(&self, session: &mut Session) -> Result<(), SessionError> {
        let user_id = session.user_id;
        if session.is_ephemeral() {
            return Err(SessionError::InvalidState {
                user_id,
                reason: "ephemeral sessions are not persisted".to_string(),
            });
        }

        let found = match self.load_live(user_id).await? {
            Loaded::Live(stored) => stored.version,
            Loaded::Absent { version } => version,
        };
        if found != session.version {
            self.counters
                .version_conflicts
                .fetch_add(1, Ordering::Relaxed);
            return Err(SessionError::VersionConflict {
                user_id,
                expected: session.version,
                found,
            });
        }

        let mut next = session.clone();
        next.version = session.version + 1;
        next.last_activity_at = Utc::now();
        self.with_deadline(user_id, self.store.store(&next)).await?;

        *session = next;
        self.counters.saves.fetch_add(1, Ordering::Relaxed);
        debug!(user_id, version = session.version, "Session saved");
        Ok(())
    }

    /// Persists `session`, returning whether it was written
    pub async fn save_session(&self, session: &mut Session) -> bool {
        match self.try_save_session(session).await {
            Ok(()) => true,
            Err(e) => {
                warn!(user_id = session.user_id, error = %e, "Session not saved");
                false
            }
        }
    }

    /// Sessions of all distinct `user_ids`, fetched with bounded concurrency
    pub async fn get_batch_sessions(&self, user_ids: &[i64]) -> HashMap<i64, Session> {
        let unique: BTreeSet<i64> = user_ids.iter().copied().collect();
        stream::iter(unique)
            .map(|user_id| async move { (user_id, self.get_session(user_id).await) })
            .buffer_unordered(self.batch_concurrency)
            .collect()
            .await
    }

    /// Whether the store answers within the deadline
    pub async fn is_store_available(&self) -> bool {
        match tokio::time::timeout(self.op_timeout, self.store.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Session store ping failed");
                false
            }
            Err(_elapsed) => {
                warn!(timeout_ms = self.op_timeout.as_millis(), "Session store ping timed out");
                false
            }
        }
    }

    /// Store backend name
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Session counters and the stored session count
    pub async fn get_session_metrics(&self) -> SessionMetrics {
        let total_sessions = match tokio::time::timeout(self.op_timeout, self.store.count()).await {
            Ok(Ok(total)) => Some(total),
            Ok(Err(e)) => {
                warn!(error = %e, "Could not count sessions");
                None
            }
            Err(_elapsed) => None,
        };
        let c = &self.counters;
        SessionMetrics {
            total_sessions,
            backend: self.store.backend(),
            loads: c.loads.load(Ordering::Relaxed),
            created: c.created.load(Ordering::Relaxed),
            saves: c.saves.load(Ordering::Relaxed),
            version_conflicts: c.version_conflicts.load(Ordering::Relaxed),
            persistence_failures: c.persistence_failures.load(Ordering::Relaxed),
            ephemeral_sessions: c.ephemeral_sessions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemorySessionStore, MockSessionStore};
    use async_trait::async_trait;

    fn manager(store: Arc<dyn SessionStore>) -> SessionManager {
        SessionManager::new(
            store,
            Duration::from_secs(86_400),
            Duration::from_millis(200),
            4,
        )
    }

    #[tokio::test]
    async fn test_save_then_get_from_other_instance() {
        let store = MemorySessionStore::default();
        let first = manager(Arc::new(store.clone()));
        let second = manager(Arc::new(store));

        let mut session = first.get_session(77).await;
        session.add_state_data("fuel", "diesel");
        session.add_state_data("alert", serde_json::json!({"max_price": 1.45}));
        assert!(first.save_session(&mut session).await);
        assert_eq!(session.version, 1);

        let loaded = second.get_session(77).await;
        assert_eq!(loaded.state_data, session.state_data);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_stale_save_is_rejected() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::default());
        let manager = manager(store);

        let mut a = manager.get_session(1).await;
        let mut b = manager.get_session(1).await;
        a.add_state_data("step", "fuel");
        assert!(manager.save_session(&mut a).await);

        b.add_state_data("step", "radius");
        let err = manager.try_save_session(&mut b).await.err();
        assert!(matches!(
            err,
            Some(SessionError::VersionConflict { expected: 0, found: 1, .. })
        ));
        assert_eq!(manager.get_session_metrics().await.version_conflicts, 1);
    }

    #[tokio::test]
    async fn test_store_failure_yields_ephemeral_session() {
        let mut mock = MockSessionStore::new();
        mock.expect_load()
            .returning(|_| Err(StoreError::Backend("connection refused".to_string())));
        mock.expect_count()
            .returning(|| Err(StoreError::Backend("connection refused".to_string())));
        mock.expect_backend().return_const("mock");
        let manager = manager(Arc::new(mock));

        let mut session = manager.get_session(3).await;
        assert!(session.is_ephemeral());
        assert!(!manager.save_session(&mut session).await);
        let metrics = manager.get_session_metrics().await;
        assert_eq!(metrics.ephemeral_sessions, 1);
        assert_eq!(metrics.total_sessions, None);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_invalid_state() {
        let mut mock = MockSessionStore::new();
        mock.expect_load().returning(|_| Ok(Some(Session::new(999))));
        let manager = manager(Arc::new(mock));

        let err = manager.try_get_session(1).await.err();
        assert!(matches!(err, Some(SessionError::InvalidState { user_id: 1, .. })));
    }

    #[tokio::test]
    async fn test_expired_session_restarts_with_same_version() {
        let mut stale = Session::new(5);
        stale.version = 4;
        stale.add_state_data("fuel", "gasolina98");
        stale.last_activity_at = Utc::now() - chrono::Duration::days(2);

        let mut mock = MockSessionStore::new();
        mock.expect_load().returning(move |_| Ok(Some(stale.clone())));
        let manager = manager(Arc::new(mock));

        let session = manager.try_get_session(5).await.expect("loads");
        assert!(session.state_data.is_empty());
        assert_eq!(session.version, 4);
    }

    struct HangingStore;

    #[async_trait]
    impl SessionStore for HangingStore {
        async fn load(&self, _user_id: i64) -> Result<Option<Session>, StoreError> {
            std::future::pending().await
        }
        async fn store(&self, _session: &Session) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn count(&self) -> Result<u64, StoreError> {
            std::future::pending().await
        }
        async fn ping(&self) -> Result<(), StoreError> {
            std::future::pending().await
        }
        fn backend(&self) -> &'static str {
            "hanging"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let manager = manager(Arc::new(HangingStore));
        let err = manager.try_get_session(8).await.err();
        assert!(matches!(
            err,
            Some(SessionError::Persistence {
                source: StoreError::Timeout(_),
                ..
            })
        ));
        assert!(!manager.is_store_available().await);
        assert_eq!(manager.get_session_metrics().await.total_sessions, None);
    }

    #[tokio::test]
    async fn test_batch_returns_each_distinct_user_once() {
        let manager = manager(Arc::new(MemorySessionStore::default()));
        let ids: Vec<i64> = (1..=50).chain(1..=10).collect();
        let sessions = manager.get_batch_sessions(&ids).await;
        assert_eq!(sessions.len(), 50);
        assert!(sessions.iter().all(|(id, s)| *id == s.user_id));
    }
}

use super::Session;
use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use moka::future::Cache;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// The operation did not finish within the store deadline
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    /// Error retrieving object from S3
    #[error("S3 get error: {0}")]
    S3Get(Box<SdkError<GetObjectError>>),
    /// Any other backend failure
    #[error("store backend error: {0}")]
    Backend(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Configuration error (missing credentials, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Key/value store shared by all gateway instances
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the stored session of `user_id`
    async fn load(&self, user_id: i64) -> Result<Option<Session>, StoreError>;
    /// Write `session`, replacing the stored copy
    async fn store(&self, session: &Session) -> Result<(), StoreError>;
    /// Number of stored sessions
    async fn count(&self) -> Result<u64, StoreError>;
    /// Check connection to the store
    async fn ping(&self) -> Result<(), StoreError>;
    /// Short backend name for health output
    fn backend(&self) -> &'static str;
}

/// In-process store backed by a moka cache
///
/// Clones share the same cache, so two managers built from clones of one
/// store behave like two processes sharing an external store.
#[derive(Clone)]
pub struct MemorySessionStore {
    cache: Cache<i64, Session>,
}

impl MemorySessionStore {
    /// Create a store whose entries expire `ttl` after their last write
    #[must_use]
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60), 100_000)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, user_id: i64) -> Result<Option<Session>, StoreError> {
        Ok(self.cache.get(&user_id).await)
    }

    async fn store(&self, session: &Session) -> Result<(), StoreError> {
        self.cache.insert(session.user_id, session.clone()).await;
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.cache.run_pending_tasks().await;
        Ok(self.cache.entry_count())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

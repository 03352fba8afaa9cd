//! Per-user conversation state persisted in an external store
//!
//! The gateway only holds transient copies of a [`Session`]; the store is the
//! owner and may be shared by several gateway processes. Writes are guarded
//! by a monotonically increasing `version`.

mod manager;
mod r2;
mod store;

pub use manager::{SessionManager, SessionMetrics};
pub use r2::R2SessionStore;
pub use store::{MemorySessionStore, SessionStore, StoreError};

#[cfg(test)]
pub use store::MockSessionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by [`SessionManager`]
#[derive(Debug, Error)]
pub enum SessionError {
    /// The store could not be reached or answered with an error
    #[error("session store unavailable for user {user_id}: {source}")]
    Persistence {
        /// Owner of the session
        user_id: i64,
        /// Store failure
        #[source]
        source: StoreError,
    },
    /// The stored or supplied session is not usable
    #[error("invalid session state for user {user_id}: {reason}")]
    InvalidState {
        /// Owner of the session
        user_id: i64,
        /// What was wrong
        reason: String,
    },
    /// Another writer saved a newer version first
    #[error("session of user {user_id} changed concurrently (have version {expected}, store has {found})")]
    VersionConflict {
        /// Owner of the session
        user_id: i64,
        /// Version the caller based its changes on
        expected: u64,
        /// Version currently in the store
        found: u64,
    },
}

/// Conversation state of one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Telegram user id
    pub user_id: i64,
    /// Free-form state written by command handlers
    #[serde(default)]
    pub state_data: BTreeMap<String, Value>,
    /// When the session was first created
    pub created_at: DateTime<Utc>,
    /// Last time the session was saved
    pub last_activity_at: DateTime<Utc>,
    /// Optimistic concurrency counter, only ever increases
    #[serde(default)]
    pub version: u64,
    #[serde(skip)]
    ephemeral: bool,
}

impl Session {
    /// Fresh session for `user_id` at version 0
    #[must_use]
    pub fn new(user_id: i64) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            state_data: BTreeMap::new(),
            created_at: now,
            last_activity_at: now,
            version: 0,
            ephemeral: false,
        }
    }

    /// In-memory session used for one turn while the store is unavailable
    #[must_use]
    pub fn ephemeral(user_id: i64) -> Self {
        Self {
            ephemeral: true,
            ..Self::new(user_id)
        }
    }

    /// Whether this session lives only in memory
    #[must_use]
    pub const fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Sets `key` to `value`, replacing any previous value
    pub fn add_state_data(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.state_data.insert(key.into(), value.into());
    }

    /// Value stored under `key`
    #[must_use]
    pub fn get_state_data(&self, key: &str) -> Option<&Value> {
        self.state_data.get(key)
    }

    /// String value stored under `key`
    #[must_use]
    pub fn get_state_str(&self, key: &str) -> Option<&str> {
        self.state_data.get(key).and_then(Value::as_str)
    }

    /// Removes and returns the value under `key`
    pub fn remove_state_data(&mut self, key: &str) -> Option<Value> {
        self.state_data.remove(key)
    }

    /// Whether the last activity is older than `ttl`
    #[must_use]
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_activity_at)
            .to_std()
            .is_ok_and(|age| age > ttl)
    }
}

//! Admission control for active conversations
//!
//! A fixed-capacity table of conversation slots. Registration beyond
//! capacity is rejected immediately, never queued; idle slots are evicted
//! lazily when capacity is needed or stats are read. A slot is shared by all
//! in-flight turns of the same user and only released after the last one.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The admission table is full
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("capacity of {capacity} active conversations reached, try again shortly")]
pub struct CapacityExceededError {
    /// Configured capacity
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy)]
struct ConversationSlot {
    registered_at: Instant,
    last_touched_at: Instant,
    /// Permits currently held for this user
    turns: u32,
}

/// Admission counters exposed on `/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcurrencyStats {
    /// Conversations currently holding a slot
    pub active_conversations: usize,
    /// Configured capacity
    pub capacity: usize,
    /// True when no further conversation can be admitted
    pub under_backpressure: bool,
    /// Registrations accepted since start
    pub total_admitted: u64,
    /// Registrations rejected at capacity since start
    pub total_rejected: u64,
    /// Slots reclaimed by idle eviction since start
    pub total_evicted: u64,
}

/// Bounded table of active conversations
#[derive(Debug)]
pub struct ConcurrencyManager {
    capacity: usize,
    idle_timeout: Duration,
    slots: Mutex<HashMap<i64, ConversationSlot>>,
    admitted: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
}

impl ConcurrencyManager {
    /// Create a manager admitting at most `capacity` conversations
    #[must_use]
    pub fn new(capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            capacity,
            idle_timeout,
            slots: Mutex::new(HashMap::with_capacity(capacity)),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Create a manager from the concurrency settings
    #[must_use]
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self::new(
            settings.max_concurrent_conversations,
            settings.conversation_idle_timeout(),
        )
    }

    /// Configured capacity
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, ConversationSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict_idle(&self, slots: &mut HashMap<i64, ConversationSlot>, now: Instant) {
        let before = slots.len();
        slots.retain(|_, slot| {
            slot.turns > 0 || now.saturating_duration_since(slot.last_touched_at) < self.idle_timeout
        });
        let evicted = before - slots.len();
        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            info!(evicted, remaining = slots.len(), "Evicted idle conversations");
        }
    }

    /// Claims a slot for `user_id`
    ///
    /// Returns `true` when the user already holds a slot (it is touched) or
    /// a free slot was found, `false` at capacity.
    pub fn register_conversation(&self, user_id: i64) -> bool {
        self.claim(user_id, 0)
    }

    fn claim(&self, user_id: i64, turns: u32) -> bool {
        let now = Instant::now();
        let mut slots = self.lock();

        if let Some(slot) = slots.get_mut(&user_id) {
            slot.last_touched_at = now;
            slot.turns += turns;
            return true;
        }

        if slots.len() >= self.capacity {
            self.evict_idle(&mut slots, now);
        }

        if slots.len() >= self.capacity {
            let count = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
            if count == 1 || count.is_multiple_of(100) {
                warn!(
                    user_id,
                    capacity = self.capacity,
                    total_rejected = count,
                    "Conversation rejected at capacity"
                );
            }
            return false;
        }

        slots.insert(
            user_id,
            ConversationSlot {
                registered_at: now,
                last_touched_at: now,
                turns,
            },
        );
        self.admitted.fetch_add(1, Ordering::Relaxed);
        debug!(user_id, active = slots.len(), "Conversation registered");
        true
    }

    /// Releases the slot of `user_id`, if any
    pub fn unregister_conversation(&self, user_id: i64) {
        if let Some(slot) = self.lock().remove(&user_id) {
            debug!(
                user_id,
                held_ms = slot.registered_at.elapsed().as_millis(),
                "Conversation unregistered"
            );
        }
    }

    fn release_turn(&self, user_id: i64) {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(&user_id) else {
            return;
        };
        slot.turns = slot.turns.saturating_sub(1);
        if slot.turns == 0 {
            let held_ms = slot.registered_at.elapsed().as_millis();
            slots.remove(&user_id);
            debug!(user_id, held_ms, "Conversation released");
        }
    }

    /// Marks the conversation of `user_id` as active now
    pub fn touch_conversation(&self, user_id: i64) {
        if let Some(slot) = self.lock().get_mut(&user_id) {
            slot.last_touched_at = Instant::now();
        }
    }

    /// Whether `user_id` currently holds a slot
    #[must_use]
    pub fn is_active(&self, user_id: i64) -> bool {
        self.lock().contains_key(&user_id)
    }

    /// Current counters, after evicting idle conversations
    #[must_use]
    pub fn stats(&self) -> ConcurrencyStats {
        let mut slots = self.lock();
        self.evict_idle(&mut slots, Instant::now());
        let active = slots.len();
        drop(slots);

        ConcurrencyStats {
            active_conversations: active,
            capacity: self.capacity,
            under_backpressure: active >= self.capacity,
            total_admitted: self.admitted.load(Ordering::Relaxed),
            total_rejected: self.rejected.load(Ordering::Relaxed),
            total_evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Registers `user_id` and returns a permit for one turn
    ///
    /// Concurrent turns of the same user share the slot; it is released
    /// when the last of their permits is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityExceededError`] when no slot is free.
    pub fn admit(self: &Arc<Self>, user_id: i64) -> Result<ConversationPermit, CapacityExceededError> {
        if self.claim(user_id, 1) {
            Ok(ConversationPermit {
                manager: Arc::clone(self),
                user_id,
            })
        } else {
            Err(CapacityExceededError {
                capacity: self.capacity,
            })
        }
    }
}

/// Slot held for the duration of one conversation turn
#[derive(Debug)]
#[must_use = "dropping the permit releases the conversation slot"]
pub struct ConversationPermit {
    manager: Arc<ConcurrencyManager>,
    user_id: i64,
}

impl ConversationPermit {
    /// User the slot belongs to
    #[must_use]
    pub const fn user_id(&self) -> i64 {
        self.user_id
    }

    /// Refreshes the idle clock of the slot
    pub fn touch(&self) {
        self.manager.touch_conversation(self.user_id);
    }
}

impl Drop for ConversationPermit {
    fn drop(&mut self) {
        self.manager.release_turn(self.user_id);
    }
}

//! Bounded worker pool: one task per inbound message
//!
//! Messages go through a bounded channel; a semaphore caps how many are
//! processed at once. Each submission gets its reply on a oneshot channel.

use super::{Gateway, InboundMessage, Reply};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Submission failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The queue is full
    #[error("dispatcher queue is full")]
    QueueFull,
    /// The dispatcher was shut down
    #[error("dispatcher is stopped")]
    Closed,
}

struct Job {
    message: InboundMessage,
    reply: oneshot::Sender<Reply>,
}

/// Dispatcher counters for `/metrics`
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    /// Messages accepted into the queue
    pub submitted: u64,
    /// Messages fully processed
    pub completed: u64,
    /// Messages refused because the queue was full
    pub rejected: u64,
    /// Messages currently being processed
    pub in_flight: u64,
}

#[derive(Default)]
struct StatsInner {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
}

/// Handle for submitting messages to the worker pool
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::Sender<Job>,
    stats: Arc<StatsInner>,
}

impl Dispatcher {
    /// Starts the pool; it stops taking messages once `shutdown` fires and
    /// the returned handle completes after queued and in-flight messages finish
    #[must_use]
    pub fn spawn(
        gateway: Arc<Gateway>,
        workers: usize,
        queue_capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let stats = Arc::new(StatsInner::default());
        let handle = tokio::spawn(run(
            receiver,
            gateway,
            workers.max(1),
            shutdown,
            Arc::clone(&stats),
        ));
        (Self { sender, stats }, handle)
    }

    /// Queues `message` without waiting for queue space
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::QueueFull`] or [`DispatchError::Closed`].
    pub fn try_submit(&self, message: InboundMessage) -> Result<oneshot::Receiver<Reply>, DispatchError> {
        let (reply, receiver) = oneshot::channel();
        match self.sender.try_send(Job { message, reply }) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(receiver)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let count = self.stats.rejected.fetch_add(1, Ordering::Relaxed) + 1;
                if count == 1 || count.is_multiple_of(100) {
                    warn!(total_rejected = count, "Dispatcher queue full");
                }
                Err(DispatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    /// Queues `message`, waiting for queue space, and awaits the reply
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Closed`] when the pool stopped first.
    pub async fn submit(&self, message: InboundMessage) -> Result<Reply, DispatchError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(Job { message, reply })
            .await
            .map_err(|_| DispatchError::Closed)?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        receiver.await.map_err(|_| DispatchError::Closed)
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let submitted = self.stats.submitted.load(Ordering::Relaxed);
        let completed = self.stats.completed.load(Ordering::Relaxed);
        DispatcherStats {
            submitted,
            completed,
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            in_flight: submitted.saturating_sub(completed),
        }
    }
}

async fn run(
    mut receiver: mpsc::Receiver<Job>,
    gateway: Arc<Gateway>,
    workers: usize,
    shutdown: CancellationToken,
    stats: Arc<StatsInner>,
) {
    let semaphore = Arc::new(Semaphore::new(workers));
    info!(workers, "Dispatcher started");

    loop {
        let job = tokio::select! {
            () = shutdown.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        start(job, permit, &gateway, &stats);
    }

    // Queued jobs were accepted, so they still get an answer
    receiver.close();
    let mut drained = 0u64;
    while let Some(job) = receiver.recv().await {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        start(job, permit, &gateway, &stats);
        drained += 1;
    }

    let all = u32::try_from(workers).unwrap_or(u32::MAX);
    if semaphore.acquire_many(all).await.is_ok() {
        info!(drained, "Dispatcher drained");
    }
}

fn start(job: Job, permit: OwnedSemaphorePermit, gateway: &Arc<Gateway>, stats: &Arc<StatsInner>) {
    let gateway = Arc::clone(gateway);
    let stats = Arc::clone(stats);
    tokio::spawn(async move {
        let user_id = job.message.user_id;
        let reply = gateway.handle_message(job.message).await;
        if job.reply.send(reply).is_err() {
            debug!(user_id, "Reply receiver dropped");
        }
        stats.completed.fetch_add(1, Ordering::Relaxed);
        drop(permit);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CommandHandler, GatewayError, ReplyKind, SlowModeLimiter};
    use crate::concurrency::ConcurrencyManager;
    use crate::resilience::DegradationManager;
    use crate::session::{MemorySessionStore, Session, SessionManager};
    use crate::testing::test_monitor;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Upper;

    #[async_trait]
    impl CommandHandler for Upper {
        async fn handle(&self, message: &InboundMessage, _session: &mut Session) -> Result<Reply, GatewayError> {
            Ok(Reply::answer(message.user_id, message.text.to_uppercase()))
        }
    }

    struct Slow;

    #[async_trait]
    impl CommandHandler for Slow {
        async fn handle(&self, message: &InboundMessage, _session: &mut Session) -> Result<Reply, GatewayError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Reply::answer(message.user_id, "listo"))
        }
    }

    fn gateway() -> Arc<Gateway> {
        gateway_with(Arc::new(Upper))
    }

    fn gateway_with(handler: Arc<dyn CommandHandler>) -> Arc<Gateway> {
        Arc::new(Gateway::new(
            Arc::new(ConcurrencyManager::new(100, Duration::from_secs(300))),
            SessionManager::new(
                Arc::new(MemorySessionStore::default()),
                Duration::from_secs(3600),
                Duration::from_secs(1),
                4,
            ),
            test_monitor(),
            Arc::new(DegradationManager::default()),
            SlowModeLimiter::new(Duration::from_secs(3)),
            handler,
        ))
    }

    #[tokio::test]
    async fn test_each_submission_gets_its_reply() {
        let shutdown = CancellationToken::new();
        let (dispatcher, handle) = Dispatcher::spawn(gateway(), 4, 64, shutdown.clone());

        let mut pending = Vec::new();
        for user_id in 1..=20 {
            let dispatcher = dispatcher.clone();
            pending.push(tokio::spawn(async move {
                dispatcher
                    .submit(InboundMessage {
                        user_id,
                        command: "/eco".to_string(),
                        text: format!("hola {user_id}"),
                    })
                    .await
            }));
        }
        for (i, task) in pending.into_iter().enumerate() {
            let reply = task.await.expect("task").expect("reply");
            assert_eq!(reply.user_id, i64::try_from(i + 1).expect("fits"));
            assert_eq!(reply.kind, ReplyKind::Answer);
            assert_eq!(reply.text, format!("HOLA {}", i + 1));
        }

        shutdown.cancel();
        handle.await.expect("dispatcher stops");
        assert_eq!(dispatcher.stats().completed, 20);
        let late = dispatcher.try_submit(InboundMessage {
            user_id: 1,
            command: String::new(),
            text: String::new(),
        });
        assert_eq!(late.err(), Some(DispatchError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_answers_queued_messages() {
        let shutdown = CancellationToken::new();
        let (dispatcher, handle) = Dispatcher::spawn(gateway_with(Arc::new(Slow)), 1, 16, shutdown.clone());

        let receivers: Vec<_> = (1..=5)
            .map(|user_id| {
                dispatcher
                    .try_submit(InboundMessage {
                        user_id,
                        command: "/precio".to_string(),
                        text: String::new(),
                    })
                    .expect("queue has room")
            })
            .collect();
        shutdown.cancel();
        handle.await.expect("dispatcher stops");

        for (user_id, receiver) in (1..=5).zip(receivers) {
            let reply = receiver.await.expect("queued message answered");
            assert_eq!(reply.user_id, user_id);
            assert_eq!(reply.text, "listo");
        }
        assert_eq!(dispatcher.stats().completed, 5);
    }
}

//! Message pipeline of the bot gateway
//!
//! For every inbound message: admission → slow-mode check → session load →
//! timer start → command handler → session save → timer end → slot release.
//! Nothing in here aborts the process; every failure becomes a reply.

mod dispatcher;
mod handlers;
mod slow_mode;

pub use dispatcher::{DispatchError, Dispatcher, DispatcherStats};
pub use handlers::{AlertRetry, FuelBotHandler};
pub use slow_mode::SlowModeLimiter;

use crate::clients::ClientError;
use crate::concurrency::{CapacityExceededError, ConcurrencyManager};
use crate::monitor::PerformanceMonitor;
use crate::resilience::{CallError, DegradationManager};
use crate::session::{Session, SessionError, SessionManager};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors a command can end with
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The admission table is full
    #[error(transparent)]
    Capacity(#[from] CapacityExceededError),
    /// Session could not be loaded or saved
    #[error(transparent)]
    Session(#[from] SessionError),
    /// A guarded dependency call failed
    #[error(transparent)]
    Dependency(#[from] CallError<ClientError>),
    /// The command arguments could not be understood
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

/// One message delivered by the command dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Telegram user id
    pub user_id: i64,
    /// Command name such as `/precio`, empty for free text
    #[serde(default)]
    pub command: String,
    /// Command arguments or the free text
    #[serde(default)]
    pub text: String,
}

impl InboundMessage {
    /// Name used for timers and statistics
    #[must_use]
    pub fn command_name(&self) -> &str {
        if self.command.is_empty() {
            "text"
        } else {
            &self.command
        }
    }
}

/// How a reply was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    /// Fully processed
    Answer,
    /// Canned text because a dependency or feature is unavailable
    Fallback,
    /// Throttled by slow mode
    SlowDown,
    /// Rejected at capacity
    Busy,
    /// The command failed
    Error,
}

/// Text sent back to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    /// Recipient
    pub user_id: i64,
    /// Message text
    pub text: String,
    /// How the text was produced
    pub kind: ReplyKind,
}

impl Reply {
    /// Fully processed reply
    #[must_use]
    pub fn answer(user_id: i64, text: impl Into<String>) -> Self {
        Self {
            user_id,
            text: text.into(),
            kind: ReplyKind::Answer,
        }
    }

    /// Canned reply for an unavailable dependency or feature
    #[must_use]
    pub fn fallback(user_id: i64, text: impl Into<String>) -> Self {
        Self {
            user_id,
            text: text.into(),
            kind: ReplyKind::Fallback,
        }
    }

    fn with_kind(user_id: i64, text: &str, kind: ReplyKind) -> Self {
        Self {
            user_id,
            text: text.to_string(),
            kind,
        }
    }
}

pub(crate) const BUSY_TEXT: &str =
    "Hay mucha gente usando el bot ahora mismo. Inténtalo de nuevo en unos segundos.";
pub(crate) const SLOW_DOWN_TEXT: &str =
    "El servicio va algo lento ahora mismo. Espera unos segundos antes de enviar otro mensaje.";
/// Timer key shared by every command the handler does not recognise
const UNKNOWN_COMMAND: &str = "unknown";

pub(crate) const ERROR_TEXT: &str =
    "Algo ha salido mal al procesar tu mensaje. Inténtalo de nuevo más tarde.";

/// Executes one command against a loaded session
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle `message`; changes to `session` are persisted afterwards
    async fn handle(&self, message: &InboundMessage, session: &mut Session) -> Result<Reply, GatewayError>;

    /// Whether `command` is one this handler implements; an empty string is free text
    fn knows_command(&self, _command: &str) -> bool {
        true
    }
}

/// Pipeline wiring admission, sessions, timing and degradation around a handler
pub struct Gateway {
    concurrency: Arc<ConcurrencyManager>,
    sessions: SessionManager,
    monitor: Arc<PerformanceMonitor>,
    degradation: Arc<DegradationManager>,
    slow_mode: SlowModeLimiter,
    handler: Arc<dyn CommandHandler>,
}

impl Gateway {
    /// Wire a gateway from its components
    #[must_use]
    pub fn new(
        concurrency: Arc<ConcurrencyManager>,
        sessions: SessionManager,
        monitor: Arc<PerformanceMonitor>,
        degradation: Arc<DegradationManager>,
        slow_mode: SlowModeLimiter,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            concurrency,
            sessions,
            monitor,
            degradation,
            slow_mode,
            handler,
        }
    }

    /// Processes one message and returns the reply to send
    pub async fn handle_message(&self, message: InboundMessage) -> Reply {
        let user_id = message.user_id;
        let permit = match self.concurrency.admit(user_id) {
            Ok(permit) => permit,
            Err(e) => {
                debug!(user_id, error = %e, "Message rejected");
                return Reply::with_kind(user_id, BUSY_TEXT, ReplyKind::Busy);
            }
        };

        if self.degradation.is_slow_mode_enabled() && !self.slow_mode.allow(user_id).await {
            return Reply::with_kind(user_id, SLOW_DOWN_TEXT, ReplyKind::SlowDown);
        }

        let mut session = self.sessions.get_session(user_id).await;
        let timed_as = if self.handler.knows_command(&message.command) {
            message.command_name()
        } else {
            UNKNOWN_COMMAND
        };
        let timer = self.monitor.start_timer(timed_as, user_id).await;

        let reply = match self.handler.handle(&message, &mut session).await {
            Ok(reply) => reply,
            Err(e) => self.reply_for_error(&message, &e),
        };

        if session.is_ephemeral() {
            debug!(user_id, "Skipping save of ephemeral session");
        } else {
            self.sessions.save_session(&mut session).await;
        }

        if let Some(sample) = self.monitor.end_timer(timer).await {
            debug!(
                user_id,
                command = %sample.command,
                response_time_ms = sample.response_time_ms,
                "Command finished"
            );
        }
        permit.touch();
        reply
    }

    fn reply_for_error(&self, message: &InboundMessage, err: &GatewayError) -> Reply {
        let user_id = message.user_id;
        match err {
            GatewayError::Dependency(call) => {
                warn!(user_id, dependency = call.dependency(), error = %call, "Dependency unavailable");
                let text = self
                    .degradation
                    .get_fallback_response(call.dependency(), &message.text)
                    .unwrap_or_else(|| unavailable_text(call.dependency()));
                Reply::fallback(user_id, text)
            }
            GatewayError::InvalidCommand(usage) => Reply::answer(user_id, usage.clone()),
            GatewayError::Capacity(_) => Reply::with_kind(user_id, BUSY_TEXT, ReplyKind::Busy),
            GatewayError::Session(e) => {
                error!(user_id, error = %e, "Session error during command");
                Reply::with_kind(user_id, ERROR_TEXT, ReplyKind::Error)
            }
        }
    }

    /// Degradation manager used by this gateway
    #[must_use]
    pub const fn degradation(&self) -> &Arc<DegradationManager> {
        &self.degradation
    }
}

/// Apology used when a dependency fails while its features are still enabled
#[must_use]
pub fn unavailable_text(dependency: &str) -> String {
    format!(
        "Lo sentimos, el servicio {dependency} no responde en este momento. Inténtalo de nuevo en unos minutos."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitOpenError, DegradationLevel};
    use crate::session::MemorySessionStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, message: &InboundMessage, session: &mut Session) -> Result<Reply, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if message.command == "/roto" {
                return Err(GatewayError::Dependency(CallError::CircuitOpen(CircuitOpenError {
                    dependency: "deepseek".to_string(),
                    retry_after: Duration::from_secs(30),
                })));
            }
            session.add_state_data("last", message.text.clone());
            Ok(Reply::answer(message.user_id, format!("eco: {}", message.text)))
        }

        fn knows_command(&self, command: &str) -> bool {
            matches!(command, "" | "/eco" | "/roto")
        }
    }

    fn gateway(capacity: usize) -> (Gateway, Arc<EchoHandler>, SessionManager) {
        let sessions = SessionManager::new(
            Arc::new(MemorySessionStore::default()),
            Duration::from_secs(3600),
            Duration::from_secs(1),
            4,
        );
        let handler = Arc::new(EchoHandler {
            calls: AtomicUsize::new(0),
        });
        let gateway = Gateway::new(
            Arc::new(ConcurrencyManager::new(capacity, Duration::from_secs(300))),
            sessions.clone(),
            Arc::new(PerformanceMonitor::new(
                Duration::from_secs(2),
                Duration::from_secs(60),
                100,
            )),
            Arc::new(DegradationManager::default()),
            SlowModeLimiter::new(Duration::from_secs(3)),
            handler.clone(),
        );
        (gateway, handler, sessions)
    }

    fn message(user_id: i64, command: &str, text: &str) -> InboundMessage {
        InboundMessage {
            user_id,
            command: command.to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_message_updates_session_and_releases_slot() {
        let (gateway, _, sessions) = gateway(1);
        let reply = gateway.handle_message(message(1, "/eco", "hola")).await;
        assert_eq!(reply.kind, ReplyKind::Answer);
        assert_eq!(reply.text, "eco: hola");

        let session = sessions.get_session(1).await;
        assert_eq!(session.get_state_str("last"), Some("hola"));
        assert_eq!(session.version, 1);

        let second = gateway.handle_message(message(2, "/eco", "adiós")).await;
        assert_eq!(second.kind, ReplyKind::Answer);
    }

    #[tokio::test]
    async fn test_open_circuit_turns_into_fallback() {
        let (gateway, _, _) = gateway(5);
        let reply = gateway.handle_message(message(1, "/roto", "precio gasolina")).await;
        assert_eq!(reply.kind, ReplyKind::Fallback);
        assert!(reply.text.contains("deepseek"));
    }

    #[tokio::test]
    async fn test_slow_mode_throttles_second_message() {
        let (gateway, handler, _) = gateway(5);
        gateway
            .degradation()
            .force_degradation_level(DegradationLevel::Degraded);

        let first = gateway.handle_message(message(1, "/eco", "uno")).await;
        let second = gateway.handle_message(message(1, "/eco", "dos")).await;
        assert_eq!(first.kind, ReplyKind::Answer);
        assert_eq!(second.kind, ReplyKind::SlowDown);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_store_outage_still_answers_with_ephemeral_session() {
        let handler = Arc::new(EchoHandler {
            calls: AtomicUsize::new(0),
        });
        let gateway = Gateway::new(
            Arc::new(ConcurrencyManager::new(5, Duration::from_secs(300))),
            SessionManager::new(
                Arc::new(crate::testing::mock_store_unavailable()),
                Duration::from_secs(3600),
                Duration::from_secs(1),
                4,
            ),
            crate::testing::test_monitor(),
            Arc::new(DegradationManager::default()),
            SlowModeLimiter::new(Duration::from_secs(3)),
            handler,
        );

        let reply = gateway.handle_message(message(4, "/eco", "sin redis")).await;
        assert_eq!(reply.kind, ReplyKind::Answer);
        assert_eq!(reply.text, "eco: sin redis");
    }

    #[tokio::test]
    async fn test_unrecognised_commands_share_one_timer_key() {
        let (gateway, _, _) = gateway(5);
        for (user, command) in [(1, "/foo1"), (2, "/foo2"), (3, "/eco")] {
            gateway.handle_message(message(user, command, "x")).await;
        }

        let stats = gateway.monitor.all_stats();
        let keys: Vec<&str> = stats.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["/eco", UNKNOWN_COMMAND]);
        assert_eq!(stats[UNKNOWN_COMMAND].total_executions, 2);
    }

    #[test]
    fn test_free_text_is_timed_as_text() {
        assert_eq!(message(1, "", "hola").command_name(), "text");
        assert_eq!(message(1, "/precio", "").command_name(), "/precio");
    }
}

//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and defines
//! the defaults for every resilience tunable.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit/timeout name of the natural-language inference API.
pub const DEEPSEEK: &str = "deepseek";
/// Circuit/timeout name of the internal pricing/alerts API.
pub const LARAVEL_API: &str = "laravel_api";

/// Application settings loaded from config files and environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// DeepSeek API key
    pub deepseek_api_key: Option<String>,
    /// DeepSeek OpenAI-compatible base URL
    #[serde(default = "default_deepseek_api_base")]
    pub deepseek_api_base: String,
    /// DeepSeek model identifier
    #[serde(default = "default_deepseek_model")]
    pub deepseek_model: String,
    /// Per-attempt deadline for inference calls
    #[serde(default = "default_deepseek_timeout_ms")]
    pub deepseek_timeout_ms: u64,
    /// Attempts per inference call before giving up
    #[serde(default = "default_deepseek_max_attempts")]
    pub deepseek_max_attempts: u32,
    /// Consecutive failures that open the inference circuit
    #[serde(default = "default_deepseek_failure_threshold")]
    pub deepseek_failure_threshold: u32,
    /// Seconds the inference circuit stays open before probing
    #[serde(default = "default_deepseek_cooldown_secs")]
    pub deepseek_cooldown_secs: u64,

    /// Base URL of the pricing/alerts API
    pub laravel_api_url: Option<String>,
    /// Bearer token for the pricing/alerts API
    pub laravel_api_token: Option<String>,
    /// Per-attempt deadline for pricing API calls
    #[serde(default = "default_laravel_api_timeout_ms")]
    pub laravel_api_timeout_ms: u64,
    /// Attempts per pricing API call before giving up
    #[serde(default = "default_laravel_api_max_attempts")]
    pub laravel_api_max_attempts: u32,
    /// Consecutive failures that open the pricing API circuit
    #[serde(default = "default_laravel_api_failure_threshold")]
    pub laravel_api_failure_threshold: u32,
    /// Seconds the pricing API circuit stays open before probing
    #[serde(default = "default_laravel_api_cooldown_secs")]
    pub laravel_api_cooldown_secs: u64,

    /// Failures older than this do not count towards a circuit threshold
    #[serde(default = "default_circuit_failure_window_secs")]
    pub circuit_failure_window_secs: u64,
    /// First backoff delay for interactive retries
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,
    /// Upper bound for interactive retry backoff
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
    /// Escalating delays for background-job retries, comma separated seconds
    #[serde(default = "default_background_retry_schedule_secs")]
    pub background_retry_schedule_secs: String,

    /// Maximum concurrently active conversations
    #[serde(default = "default_max_concurrent_conversations")]
    pub max_concurrent_conversations: usize,
    /// Conversations without activity for this long are evicted
    #[serde(default = "default_conversation_idle_timeout_secs")]
    pub conversation_idle_timeout_secs: u64,
    /// Number of messages processed in parallel
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Session time-to-live since last activity
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Deadline for a single session store operation
    #[serde(default = "default_session_store_timeout_ms")]
    pub session_store_timeout_ms: u64,
    /// Parallel store reads during batch session fetches
    #[serde(default = "default_session_batch_concurrency")]
    pub session_batch_concurrency: usize,

    /// R2 Storage access key ID
    pub r2_access_key_id: Option<String>,
    /// R2 Storage secret access key
    pub r2_secret_access_key: Option<String>,
    /// R2 Storage endpoint URL
    pub r2_endpoint_url: Option<String>,
    /// R2 Storage bucket name
    pub r2_bucket_name: Option<String>,

    /// Commands slower than this are logged as slow
    #[serde(default = "default_slow_command_threshold_ms")]
    pub slow_command_threshold_ms: u64,
    /// Unfinished timers are dropped after this long
    #[serde(default = "default_active_timer_ttl_secs")]
    pub active_timer_ttl_secs: u64,
    /// Upper bound on simultaneously running timers
    #[serde(default = "default_max_active_timers")]
    pub max_active_timers: u64,

    /// How long a better health level must hold before recovering
    #[serde(default = "default_degradation_recovery_hold_secs")]
    pub degradation_recovery_hold_secs: u64,
    /// Interval of the background health evaluation
    #[serde(default = "default_degradation_eval_interval_secs")]
    pub degradation_eval_interval_secs: u64,
    /// Minimum spacing between messages of one user in slow mode
    #[serde(default = "default_slow_mode_interval_ms")]
    pub slow_mode_interval_ms: u64,

    /// Bind address of the operational HTTP endpoints
    #[serde(default = "default_http_bind_addr")]
    pub http_bind_addr: String,
}

fn default_deepseek_api_base() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_deepseek_model() -> String {
    "deepseek-chat".to_string()
}

const fn default_deepseek_timeout_ms() -> u64 {
    15_000
}

const fn default_deepseek_max_attempts() -> u32 {
    2
}

const fn default_deepseek_failure_threshold() -> u32 {
    5
}

const fn default_deepseek_cooldown_secs() -> u64 {
    60
}

const fn default_laravel_api_timeout_ms() -> u64 {
    5_000
}

const fn default_laravel_api_max_attempts() -> u32 {
    3
}

const fn default_laravel_api_failure_threshold() -> u32 {
    3
}

const fn default_laravel_api_cooldown_secs() -> u64 {
    30
}

const fn default_circuit_failure_window_secs() -> u64 {
    120
}

const fn default_retry_initial_backoff_ms() -> u64 {
    200
}

const fn default_retry_max_backoff_ms() -> u64 {
    2_000
}

fn default_background_retry_schedule_secs() -> String {
    "60,120,300".to_string()
}

const fn default_max_concurrent_conversations() -> usize {
    100
}

const fn default_conversation_idle_timeout_secs() -> u64 {
    300
}

const fn default_worker_pool_size() -> usize {
    32
}

const fn default_session_ttl_secs() -> u64 {
    86_400
}

const fn default_session_store_timeout_ms() -> u64 {
    2_000
}

const fn default_session_batch_concurrency() -> usize {
    16
}

const fn default_slow_command_threshold_ms() -> u64 {
    2_000
}

const fn default_active_timer_ttl_secs() -> u64 {
    600
}

const fn default_max_active_timers() -> u64 {
    10_000
}

const fn default_degradation_recovery_hold_secs() -> u64 {
    30
}

const fn default_degradation_eval_interval_secs() -> u64 {
    10
}

const fn default_slow_mode_interval_ms() -> u64 {
    3_000
}

fn default_http_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            deepseek_api_key: None,
            deepseek_api_base: default_deepseek_api_base(),
            deepseek_model: default_deepseek_model(),
            deepseek_timeout_ms: default_deepseek_timeout_ms(),
            deepseek_max_attempts: default_deepseek_max_attempts(),
            deepseek_failure_threshold: default_deepseek_failure_threshold(),
            deepseek_cooldown_secs: default_deepseek_cooldown_secs(),
            laravel_api_url: None,
            laravel_api_token: None,
            laravel_api_timeout_ms: default_laravel_api_timeout_ms(),
            laravel_api_max_attempts: default_laravel_api_max_attempts(),
            laravel_api_failure_threshold: default_laravel_api_failure_threshold(),
            laravel_api_cooldown_secs: default_laravel_api_cooldown_secs(),
            circuit_failure_window_secs: default_circuit_failure_window_secs(),
            retry_initial_backoff_ms: default_retry_initial_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
            background_retry_schedule_secs: default_background_retry_schedule_secs(),
            max_concurrent_conversations: default_max_concurrent_conversations(),
            conversation_idle_timeout_secs: default_conversation_idle_timeout_secs(),
            worker_pool_size: default_worker_pool_size(),
            session_ttl_secs: default_session_ttl_secs(),
            session_store_timeout_ms: default_session_store_timeout_ms(),
            session_batch_concurrency: default_session_batch_concurrency(),
            r2_access_key_id: None,
            r2_secret_access_key: None,
            r2_endpoint_url: None,
            r2_bucket_name: None,
            slow_command_threshold_ms: default_slow_command_threshold_ms(),
            active_timer_ttl_secs: default_active_timer_ttl_secs(),
            max_active_timers: default_max_active_timers(),
            degradation_recovery_hold_secs: default_degradation_recovery_hold_secs(),
            degradation_eval_interval_secs: default_degradation_eval_interval_secs(),
            slow_mode_interval_ms: default_slow_mode_interval_ms(),
            http_bind_addr: default_http_bind_addr(),
        }
    }
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Local overrides, not checked into git
            .add_source(File::with_name("config/local").required(false))
            // Eg.. `APP__MAX_CONCURRENT_CONVERSATIONS=50`
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Plain UPPER_SNAKE_CASE variables, empty values treated as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Fallback: read credentials directly if the automatic mapping missed them
        for (slot, var) in [
            (&mut settings.r2_endpoint_url, "R2_ENDPOINT_URL"),
            (&mut settings.r2_access_key_id, "R2_ACCESS_KEY_ID"),
            (&mut settings.r2_secret_access_key, "R2_SECRET_ACCESS_KEY"),
            (&mut settings.r2_bucket_name, "R2_BUCKET_NAME"),
            (&mut settings.deepseek_api_key, "DEEPSEEK_API_KEY"),
        ] {
            if slot.is_none() {
                if let Ok(val) = std::env::var(var) {
                    if !val.is_empty() {
                        *slot = Some(val);
                    }
                }
            }
        }

        Ok(settings)
    }

    /// Returns true when all R2 credentials are present
    #[must_use]
    pub fn has_r2_credentials(&self) -> bool {
        self.r2_endpoint_url.is_some()
            && self.r2_access_key_id.is_some()
            && self.r2_secret_access_key.is_some()
            && self.r2_bucket_name.is_some()
    }

    /// Parses the background retry schedule; invalid entries are skipped
    #[must_use]
    pub fn background_retry_schedule(&self) -> Vec<Duration> {
        self.background_retry_schedule_secs
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .filter_map(|secs| secs.parse::<u64>().ok())
            .map(Duration::from_secs)
            .collect()
    }

    /// Session time-to-live
    #[must_use]
    pub const fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Session store operation deadline
    #[must_use]
    pub const fn session_store_timeout(&self) -> Duration {
        Duration::from_millis(self.session_store_timeout_ms)
    }

    /// Idle window after which a conversation slot is reclaimed
    #[must_use]
    pub const fn conversation_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.conversation_idle_timeout_secs)
    }

    /// Minimum spacing between messages in slow mode
    #[must_use]
    pub const fn slow_mode_interval(&self) -> Duration {
        Duration::from_millis(self.slow_mode_interval_ms)
    }
}

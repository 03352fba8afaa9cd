use anyhow::Context;
use dotenvy::dotenv;
use fuelwatch_gateway::clients::{DeepSeekClient, InferenceApi, PricingApi, PricingApiClient};
use fuelwatch_gateway::concurrency::ConcurrencyManager;
use fuelwatch_gateway::config::Settings;
use fuelwatch_gateway::gateway::{
    AlertRetry, DispatchError, Dispatcher, FuelBotHandler, Gateway, InboundMessage,
    SlowModeLimiter,
};
use fuelwatch_gateway::monitor::PerformanceMonitor;
use fuelwatch_gateway::ops::{self, OpsState};
use fuelwatch_gateway::resilience::{
    CircuitBreaker, CircuitRegistry, DegradationManager, DependencyGuard,
    RetryPolicy, TimeoutManager,
};
use fuelwatch_gateway::session::{
    MemorySessionStore, R2SessionStore, SessionManager, SessionStore,
};
use regex::Regex;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting sensitive data
struct RedactionPatterns {
    api_key: Regex,
    bearer: Regex,
    env_secret: Regex,
    aws_key: Regex,
    aws_secret: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            api_key: Regex::new(r"sk-[A-Za-z0-9_-]{16,}")?,
            bearer: Regex::new(r"(?i)(bearer\s+)[A-Za-z0-9._~+/=-]+")?,
            env_secret: Regex::new(
                r"(DEEPSEEK_API_KEY|LARAVEL_API_TOKEN|R2_ACCESS_KEY_ID|R2_SECRET_ACCESS_KEY)=[^\s&]+",
            )?,
            aws_key: Regex::new(r"'aws_access_key_id': '[^']*'")?,
            aws_secret: Regex::new(r"'aws_secret_access_key': '[^']*'")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = self.api_key.replace_all(input, "[API_KEY]").to_string();
        output = self.bearer.replace_all(&output, "${1}[MASKED]").to_string();
        output = self.env_secret.replace_all(&output, "$1=[MASKED]").to_string();
        output = self
            .aws_key
            .replace_all(&output, "'aws_access_key_id': '[MASKED]'")
            .to_string();
        output = self
            .aws_secret
            .replace_all(&output, "'aws_secret_access_key': '[MASKED]'")
            .to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // Report the full input length even when redaction changed it
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

/// Everything the background tasks need
struct Runtime {
    ops: OpsState,
    dispatcher: Dispatcher,
    dispatcher_task: tokio::task::JoinHandle<()>,
    eval_interval: Duration,
    bind_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Compile redaction patterns before anything can log
    let patterns = Arc::new(RedactionPatterns::new().context("Failed to compile regex patterns")?);
    init_logging(patterns);

    info!("Starting FuelWatch gateway...");

    let settings = Settings::new().context("Failed to load configuration")?;
    info!("Configuration loaded successfully.");

    let shutdown = CancellationToken::new();
    let runtime = build_runtime(&settings, &shutdown).await?;

    let server = tokio::spawn(ops::serve(
        runtime.ops.clone(),
        runtime.bind_addr,
        shutdown.clone(),
    ));
    let evaluator = tokio::spawn(run_evaluator(
        runtime.ops.clone(),
        runtime.eval_interval,
        shutdown.clone(),
    ));
    let reader = tokio::spawn(read_stdin(runtime.dispatcher.clone(), shutdown.clone()));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
        }
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    match server.await {
        Ok(Err(e)) => error!("Ops API failed: {}", e),
        Err(e) => error!("Ops API task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    evaluator.await.context("Evaluator task failed")?;
    reader.abort();
    runtime
        .dispatcher_task
        .await
        .context("Dispatcher task failed")?;

    info!("FuelWatch gateway stopped");
    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let debug_mode = std::env::var("DEBUG_MODE").is_ok_and(|v| v.eq_ignore_ascii_case("true"));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug_mode {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("fuelwatch_gateway=info,hyper=warn,reqwest=warn,aws=warn")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

async fn init_store(settings: &Settings) -> Arc<dyn SessionStore> {
    if !settings.has_r2_credentials() {
        warn!("R2 credentials missing, sessions are kept in memory and not shared between instances");
        return Arc::new(MemorySessionStore::new(settings.session_ttl(), 100_000));
    }
    match R2SessionStore::new(settings).await {
        Ok(store) => {
            info!("R2 session store initialized.");
            if let Err(e) = store.ping().await {
                error!("R2 session store connection check failed: {}", e);
            }
            Arc::new(store)
        }
        Err(e) => {
            error!("Failed to initialize R2 session store, using memory: {}", e);
            Arc::new(MemorySessionStore::new(settings.session_ttl(), 100_000))
        }
    }
}

fn init_pricing(settings: &Settings) -> Option<Arc<dyn PricingApi>> {
    match PricingApiClient::from_settings(settings) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!("Pricing API disabled: {}", e);
            None
        }
    }
}

fn init_inference(settings: &Settings) -> Option<Arc<dyn InferenceApi>> {
    match DeepSeekClient::from_settings(settings) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!("Inference API disabled: {}", e);
            None
        }
    }
}

async fn build_runtime(settings: &Settings, shutdown: &CancellationToken) -> anyhow::Result<Runtime> {
    let bind_addr: SocketAddr = settings
        .http_bind_addr
        .parse()
        .with_context(|| format!("Invalid http_bind_addr {}", settings.http_bind_addr))?;

    let registry = Arc::new(CircuitRegistry::new());
    let deepseek = registry.register(CircuitBreaker::deepseek(settings));
    let laravel = registry.register(CircuitBreaker::laravel_api(settings));
    let timeouts = Arc::new(TimeoutManager::from_settings(settings));

    let degradation = Arc::new(DegradationManager::from_settings(settings));
    let concurrency = Arc::new(ConcurrencyManager::from_settings(settings));
    let monitor = Arc::new(PerformanceMonitor::from_settings(settings));
    let sessions = SessionManager::from_settings(init_store(settings).await, settings);
    let pricing = init_pricing(settings);

    let alert_retry = AlertRetry::new(
        RetryPolicy::background(
            Duration::from_millis(settings.laravel_api_timeout_ms),
            settings.background_retry_schedule(),
        ),
        u32::try_from(settings.background_retry_schedule().len() + 1).unwrap_or(u32::MAX),
        shutdown.clone(),
    );
    let mut handler = FuelBotHandler::new(
        DependencyGuard::new(laravel, Arc::clone(&timeouts), settings.laravel_api_max_attempts),
        DependencyGuard::new(deepseek, Arc::clone(&timeouts), settings.deepseek_max_attempts),
        Arc::clone(&degradation),
        Arc::clone(&monitor),
    )
    .with_alert_retry(alert_retry);
    if let Some(api) = &pricing {
        handler = handler.with_pricing(Arc::clone(api));
    }
    if let Some(api) = init_inference(settings) {
        handler = handler.with_inference(api);
    }
    info!(
        pricing = pricing.is_some(),
        store = sessions.backend(),
        "Command handler initialized"
    );

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&concurrency),
        sessions.clone(),
        Arc::clone(&monitor),
        Arc::clone(&degradation),
        SlowModeLimiter::new(settings.slow_mode_interval()),
        Arc::new(handler),
    ));
    let (dispatcher, dispatcher_task) = Dispatcher::spawn(
        gateway,
        settings.worker_pool_size,
        settings.worker_pool_size.saturating_mul(4),
        shutdown.clone(),
    );

    let ops = OpsState {
        registry,
        degradation,
        concurrency,
        sessions,
        monitor,
        timeouts,
        dispatcher: Some(dispatcher.clone()),
        pricing,
        pricing_timeout: Duration::from_millis(settings.laravel_api_timeout_ms),
        started_at: Instant::now(),
    };
    Ok(Runtime {
        ops,
        dispatcher,
        dispatcher_task,
        eval_interval: Duration::from_secs(settings.degradation_eval_interval_secs.max(1)),
        bind_addr,
    })
}

async fn run_evaluator(ops: OpsState, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = ops.evaluate_health().await;
                debug!(
                    level = %report.level,
                    store_available = report.snapshot.store_available,
                    "Health evaluated"
                );
            }
        }
    }
    info!("Degradation evaluator stopped");
}

/// Reads one JSON message per line and writes one JSON reply per line.
async fn read_stdin(dispatcher: Dispatcher, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Input closed");
                break;
            }
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let message: InboundMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Skipping malformed message: {}", e);
                continue;
            }
        };
        match dispatcher.try_submit(message) {
            Ok(receiver) => {
                tokio::spawn(async move {
                    if let Ok(reply) = receiver.await {
                        write_reply(&reply).await;
                    }
                });
            }
            Err(DispatchError::QueueFull) => warn!("Dropping message, dispatcher queue is full"),
            Err(DispatchError::Closed) => break,
        }
    }
}

async fn write_reply(reply: &fuelwatch_gateway::gateway::Reply) {
    let mut line = match serde_json::to_vec(reply) {
        Ok(line) => line,
        Err(e) => {
            error!("Failed to serialize reply: {}", e);
            return;
        }
    };
    line.push(b'\n');
    let mut stdout = tokio::io::stdout();
    if let Err(e) = stdout.write_all(&line).await {
        error!("Failed to write reply: {}", e);
    }
    if let Err(e) = stdout.flush().await {
        error!("Failed to flush stdout: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_are_masked() {
        let patterns = RedactionPatterns::new().expect("patterns compile");
        let line = "calling https://api.deepseek.com with sk-abcdef0123456789abcdef \
                    Authorization: Bearer eyJhbGciOi.abc-def LARAVEL_API_TOKEN=s3cr3t&x=1";
        let out = patterns.redact(line);
        assert!(!out.contains("sk-abcdef0123456789abcdef"));
        assert!(!out.contains("eyJhbGciOi"));
        assert!(!out.contains("s3cr3t"));
        assert!(out.contains("Bearer [MASKED]"));
        assert!(out.contains("LARAVEL_API_TOKEN=[MASKED]&x=1"));
    }

    #[test]
    fn test_plain_text_is_untouched() {
        let patterns = RedactionPatterns::new().expect("patterns compile");
        let line = "user 42 asked for gasolina95 in 28001";
        assert_eq!(patterns.redact(line), line);
    }
}

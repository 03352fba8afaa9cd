//! Commands of the fuel price bot

use super::{unavailable_text, CommandHandler, GatewayError, InboundMessage, Reply};
use crate::clients::{AlertRequest, InferenceApi, PriceQuery, PricingApi};
use crate::config::{DEEPSEEK, LARAVEL_API};
use crate::monitor::PerformanceMonitor;
use crate::resilience::{DegradationManager, DependencyGuard, Feature, RetryPolicy};
use crate::session::Session;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const FUELS: &[&str] = &["gasolina95", "gasolina98", "diesel", "diesel_plus", "glp"];
const DEFAULT_FUEL: &str = "gasolina95";
const PRICE_LIMIT: u32 = 5;
const COMMANDS: &[&str] = &[
    "",
    "/start",
    "/ayuda",
    "/help",
    "/precio",
    "/combustible",
    "/alerta",
    "/estadisticas",
];

const WELCOME_TEXT: &str = "¡Hola! Soy FuelWatch. Te ayudo a encontrar el combustible más barato.\n\
Usa /ayuda para ver los comandos disponibles.";
const HELP_TEXT: &str = "Comandos:\n\
/precio [combustible] [código postal] - precios más baratos\n\
/combustible <tipo> - guarda tu combustible habitual\n\
/alerta <tipo> <precio> - avísame cuando baje de ese precio\n\
/estadisticas - uso del bot\n\
También puedes escribirme una pregunta en lenguaje natural.";

/// Background retries of alert creation on a slow escalating schedule
#[derive(Debug, Clone)]
pub struct AlertRetry {
    policy: RetryPolicy,
    max_attempts: u32,
    shutdown: CancellationToken,
}

impl AlertRetry {
    /// Retry up to `max_attempts` times with `policy`, until `shutdown` fires
    #[must_use]
    pub const fn new(policy: RetryPolicy, max_attempts: u32, shutdown: CancellationToken) -> Self {
        Self {
            policy,
            max_attempts,
            shutdown,
        }
    }
}

/// Handler for the fuel price bot commands
pub struct FuelBotHandler {
    pricing: Option<Arc<dyn PricingApi>>,
    inference: Option<Arc<dyn InferenceApi>>,
    pricing_guard: DependencyGuard,
    inference_guard: DependencyGuard,
    degradation: Arc<DegradationManager>,
    monitor: Arc<PerformanceMonitor>,
    alert_retry: Option<AlertRetry>,
}

impl FuelBotHandler {
    /// Create a handler without clients; add them with the `with_*` methods
    #[must_use]
    pub const fn new(
        pricing_guard: DependencyGuard,
        inference_guard: DependencyGuard,
        degradation: Arc<DegradationManager>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            pricing: None,
            inference: None,
            pricing_guard,
            inference_guard,
            degradation,
            monitor,
            alert_retry: None,
        }
    }

    /// Use `api` for prices and alerts
    #[must_use]
    pub fn with_pricing(mut self, api: Arc<dyn PricingApi>) -> Self {
        self.pricing = Some(api);
        self
    }

    /// Use `api` for free-text questions
    #[must_use]
    pub fn with_inference(mut self, api: Arc<dyn InferenceApi>) -> Self {
        self.inference = Some(api);
        self
    }

    /// Retry failed alert creation in the background
    #[must_use]
    pub fn with_alert_retry(mut self, retry: AlertRetry) -> Self {
        self.alert_retry = Some(retry);
        self
    }

    fn fallback(&self, user_id: i64, service: &str, query: &str) -> Reply {
        let text = self
            .degradation
            .get_fallback_response(service, query)
            .unwrap_or_else(|| unavailable_text(service));
        Reply::fallback(user_id, text)
    }

    async fn prices(&self, message: &InboundMessage, session: &mut Session) -> Result<Reply, GatewayError> {
        let Some(api) = self.pricing.as_deref() else {
            return Ok(self.fallback(message.user_id, LARAVEL_API, &message.text));
        };
        let mut args = message.text.split_whitespace();
        let fuel = match args.next() {
            Some(arg) => parse_fuel(arg)?,
            None => session
                .get_state_str("fuel")
                .unwrap_or(DEFAULT_FUEL)
                .to_string(),
        };
        let query = PriceQuery {
            fuel,
            postal_code: args.next().map(str::to_string),
            limit: PRICE_LIMIT,
        };

        let query = &query;
        let outcome = self
            .pricing_guard
            .call(move || api.fetch_prices(query))
            .await?;
        let prices = outcome.value;
        session.add_state_data("last_price_query", message.text.trim());

        if prices.is_empty() {
            return Ok(Reply::answer(
                message.user_id,
                "No hay precios disponibles para esa búsqueda.",
            ));
        }
        let mut text = format!("⛽ Precios de {}:\n", prices[0].fuel);
        for (i, price) in prices.iter().enumerate() {
            let _ = writeln!(
                text,
                "{}. {} ({}): {:.3} €/l",
                i + 1,
                price.station,
                price.municipality,
                price.price_eur
            );
        }
        Ok(Reply::answer(message.user_id, text.trim_end()))
    }

    fn set_fuel(&self, message: &InboundMessage, session: &mut Session) -> Result<Reply, GatewayError> {
        if self.degradation.is_read_only_mode() {
            return Ok(self.fallback(message.user_id, LARAVEL_API, &message.text));
        }
        let fuel = parse_fuel(message.text.trim())?;
        session.add_state_data("fuel", fuel.as_str());
        Ok(Reply::answer(
            message.user_id,
            format!("Guardado: tu combustible habitual es {fuel}."),
        ))
    }

    async fn create_alert(&self, message: &InboundMessage, session: &mut Session) -> Result<Reply, GatewayError> {
        if self.degradation.is_read_only_mode() {
            return Ok(self.fallback(message.user_id, LARAVEL_API, &message.text));
        }
        let Some(api) = self.pricing.as_ref() else {
            return Ok(self.fallback(message.user_id, LARAVEL_API, &message.text));
        };
        let request = parse_alert(message.user_id, &message.text)?;

        let (api_ref, request_ref) = (api.as_ref(), &request);
        let attempt = self
            .pricing_guard
            .call(move || api_ref.create_alert(request_ref))
            .await;
        match attempt {
            Ok(outcome) => {
                session.add_state_data("last_alert_id", outcome.value.id);
                Ok(Reply::answer(
                    message.user_id,
                    format!(
                        "🔔 Alerta creada: te avisaré cuando {} baje de {:.3} €/l.",
                        request.fuel, request.max_price_eur
                    ),
                ))
            }
            Err(e) if e.is_circuit_open() => Err(e.into()),
            Err(e) => match &self.alert_retry {
                Some(retry) => {
                    warn!(user_id = message.user_id, error = %e, "Alert creation failed, retrying in background");
                    self.spawn_alert_retry(Arc::clone(api), request, retry.clone());
                    Ok(Reply::answer(
                        message.user_id,
                        "No hemos podido crear la alerta ahora mismo. Lo seguiremos intentando y quedará activa en unos minutos.",
                    ))
                }
                None => Err(e.into()),
            },
        }
    }

    fn spawn_alert_retry(&self, api: Arc<dyn PricingApi>, request: AlertRequest, retry: AlertRetry) {
        let guard = self.pricing_guard.clone();
        tokio::spawn(async move {
            let work = guard.call_with_policy(&retry.policy, retry.max_attempts, || {
                let api = Arc::clone(&api);
                let request = request.clone();
                async move { api.create_alert(&request).await }
            });
            tokio::select! {
                () = retry.shutdown.cancelled() => {
                    info!(user_id = request.user_id, "Background alert retry cancelled by shutdown");
                }
                result = work => match result {
                    Ok(outcome) => info!(
                        user_id = request.user_id,
                        alert_id = outcome.value.id,
                        attempt = outcome.attempt,
                        "Background alert creation succeeded"
                    ),
                    Err(e) => warn!(user_id = request.user_id, error = %e, "Background alert creation gave up"),
                },
            }
        });
    }

    fn statistics(&self, message: &InboundMessage) -> Reply {
        if !self.degradation.is_feature_enabled(Feature::Analytics) {
            return self.fallback(message.user_id, "analytics", &message.text);
        }
        let stats = self.monitor.all_stats();
        if stats.is_empty() {
            return Reply::answer(message.user_id, "Todavía no hay estadísticas.");
        }
        let mut text = String::from("📊 Estadísticas:\n");
        for (command, s) in &stats {
            let _ = writeln!(
                text,
                "{command}: {} usos, {:.0} ms de media",
                s.total_executions, s.avg_response_time_ms
            );
        }
        Reply::answer(message.user_id, text.trim_end())
    }

    async fn free_text(&self, message: &InboundMessage, session: &mut Session) -> Result<Reply, GatewayError> {
        if !self.degradation.is_feature_enabled(Feature::Nlp) {
            return Ok(self.fallback(message.user_id, DEEPSEEK, &message.text));
        }
        let Some(api) = self.inference.as_deref() else {
            return Ok(self.fallback(message.user_id, DEEPSEEK, &message.text));
        };
        let context = session
            .get_state_str("fuel")
            .map(|fuel| format!("combustible habitual: {fuel}"))
            .unwrap_or_default();
        let (query, context) = (message.text.as_str(), context.as_str());

        let outcome = self
            .inference_guard
            .call(move || api.answer(query, context))
            .await?;
        session.add_state_data("last_question", query);
        Ok(Reply::answer(message.user_id, outcome.value))
    }
}

#[async_trait]
impl CommandHandler for FuelBotHandler {
    async fn handle(&self, message: &InboundMessage, session: &mut Session) -> Result<Reply, GatewayError> {
        match message.command.as_str() {
            "" => self.free_text(message, session).await,
            "/start" => {
                session.add_state_data("onboarded", true);
                Ok(Reply::answer(message.user_id, WELCOME_TEXT))
            }
            "/ayuda" | "/help" => Ok(Reply::answer(message.user_id, HELP_TEXT)),
            "/precio" => self.prices(message, session).await,
            "/combustible" => self.set_fuel(message, session),
            "/alerta" => self.create_alert(message, session).await,
            "/estadisticas" => Ok(self.statistics(message)),
            other => Err(GatewayError::InvalidCommand(format!(
                "No conozco el comando {other}. Usa /ayuda para ver la lista."
            ))),
        }
    }

    fn knows_command(&self, command: &str) -> bool {
        COMMANDS.contains(&command)
    }
}

fn parse_fuel(raw: &str) -> Result<String, GatewayError> {
    let fuel = raw.trim().to_lowercase().replace(['-', ' '], "_");
    let fuel = match fuel.as_str() {
        "95" | "gasolina" | "sp95" => "gasolina95".to_string(),
        "98" | "sp98" => "gasolina98".to_string(),
        "diésel" | "gasoil" | "gasóleo" => "diesel".to_string(),
        _ => fuel,
    };
    if FUELS.contains(&fuel.as_str()) {
        Ok(fuel)
    } else {
        Err(GatewayError::InvalidCommand(format!(
            "Combustible desconocido '{}'. Opciones: {}",
            raw.trim(),
            FUELS.join(", ")
        )))
    }
}

fn parse_alert(user_id: i64, text: &str) -> Result<AlertRequest, GatewayError> {
    let usage = || GatewayError::InvalidCommand("Uso: /alerta <combustible> <precio>, por ejemplo /alerta diesel 1,45".to_string());
    let mut args = text.split_whitespace();
    let fuel = parse_fuel(args.next().ok_or_else(usage)?)?;
    let max_price_eur: f64 = args
        .next()
        .ok_or_else(usage)?
        .replace(',', ".")
        .parse()
        .map_err(|_| usage())?;
    if !(max_price_eur.is_finite() && max_price_eur > 0.0) {
        return Err(usage());
    }
    Ok(AlertRequest {
        user_id,
        fuel,
        max_price_eur,
        postal_code: args.next().map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{AlertConfirmation, ClientError, FuelPrice, MockInferenceApi, MockPricingApi};
    use crate::resilience::{CallError, CircuitBreaker, DegradationLevel, TimeoutManager};
    use crate::testing::{fast_guard, test_monitor};
    use std::time::Duration;

    fn handler(pricing: MockPricingApi, inference: MockInferenceApi) -> FuelBotHandler {
        FuelBotHandler::new(
            fast_guard(LARAVEL_API, 3),
            fast_guard(DEEPSEEK, 3),
            Arc::new(DegradationManager::default()),
            test_monitor(),
        )
        .with_pricing(Arc::new(pricing))
        .with_inference(Arc::new(inference))
    }

    fn message(command: &str, text: &str) -> InboundMessage {
        InboundMessage {
            user_id: 10,
            command: command.to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_prices_use_saved_fuel() {
        let mut pricing = MockPricingApi::new();
        pricing
            .expect_fetch_prices()
            .withf(|q| q.fuel == "diesel" && q.postal_code.is_none())
            .times(1)
            .returning(|_| {
                Ok(vec![FuelPrice {
                    station: "Repsol Centro".to_string(),
                    municipality: "Madrid".to_string(),
                    fuel: "diesel".to_string(),
                    price_eur: 1.389,
                    updated_at: None,
                }])
            });
        let handler = handler(pricing, MockInferenceApi::new());
        let mut session = Session::new(10);
        session.add_state_data("fuel", "diesel");

        let reply = handler
            .handle(&message("/precio", ""), &mut session)
            .await
            .expect("prices reply");
        assert!(reply.text.contains("Repsol Centro"));
        assert!(reply.text.contains("1.389"));
    }

    #[tokio::test]
    async fn test_degraded_free_text_skips_inference() {
        let mut inference = MockInferenceApi::new();
        inference.expect_answer().never();
        let handler = handler(MockPricingApi::new(), inference);
        handler
            .degradation
            .force_degradation_level(DegradationLevel::Degraded);

        let reply = handler
            .handle(&message("", "precio gasolina"), &mut Session::new(10))
            .await
            .expect("fallback reply");
        assert_eq!(reply.kind, super::super::ReplyKind::Fallback);
        assert!(reply.text.contains("deepseek"));
    }

    #[tokio::test]
    async fn test_read_only_refuses_preference_update() {
        let handler = handler(MockPricingApi::new(), MockInferenceApi::new());
        handler
            .degradation
            .force_degradation_level(DegradationLevel::Unhealthy);
        let mut session = Session::new(10);

        let reply = handler
            .handle(&message("/combustible", "diesel"), &mut session)
            .await
            .expect("fallback reply");
        assert!(reply.text.contains("solo lectura"));
        assert!(session.get_state_data("fuel").is_none());
    }

    #[tokio::test]
    async fn test_alert_created() {
        let mut pricing = MockPricingApi::new();
        pricing
            .expect_create_alert()
            .withf(|r| r.fuel == "diesel" && (r.max_price_eur - 1.45).abs() < 1e-9)
            .returning(|_| Ok(AlertConfirmation { id: 99, active: true }));
        let handler = handler(pricing, MockInferenceApi::new());
        let mut session = Session::new(10);

        let reply = handler
            .handle(&message("/alerta", "gasoil 1,45"), &mut session)
            .await
            .expect("alert reply");
        assert!(reply.text.contains("Alerta creada"));
        assert_eq!(session.get_state_data("last_alert_id"), Some(&serde_json::Value::from(99)));
    }

    #[tokio::test]
    async fn test_inference_failure_surfaces_dependency_error() {
        let mut inference = MockInferenceApi::new();
        inference
            .expect_answer()
            .times(3)
            .returning(|_, _| Err(ClientError::Network("connection reset".to_string())));
        let handler = handler(MockPricingApi::new(), inference);

        let err = handler
            .handle(&message("", "¿dónde repostar?"), &mut Session::new(10))
            .await
            .err();
        assert!(matches!(
            err,
            Some(GatewayError::Dependency(CallError::Failed { attempts: 3, .. }))
        ));
    }

    #[tokio::test]
    async fn test_open_pricing_circuit_is_not_called() {
        let mut pricing = MockPricingApi::new();
        pricing.expect_fetch_prices().never();
        let breaker = Arc::new(CircuitBreaker::for_dependency(LARAVEL_API, 1, Duration::from_secs(60)));
        breaker.try_acquire().expect("closed").fail();
        let guard = DependencyGuard::new(
            breaker,
            Arc::new(TimeoutManager::new(RetryPolicy::default())),
            1,
        );
        let handler = FuelBotHandler::new(
            guard,
            fast_guard(DEEPSEEK, 1),
            Arc::new(DegradationManager::default()),
            test_monitor(),
        )
        .with_pricing(Arc::new(pricing));

        let err = handler
            .handle(&message("/precio", "diesel"), &mut Session::new(10))
            .await
            .err();
        assert!(matches!(err, Some(GatewayError::Dependency(CallError::CircuitOpen(_)))));
    }

    #[test]
    fn test_known_commands() {
        let handler = handler(MockPricingApi::new(), MockInferenceApi::new());
        assert!(handler.knows_command("/precio"));
        assert!(handler.knows_command(""));
        assert!(!handler.knows_command("/foo123"));
    }

    #[test]
    fn test_parse_alert_rejects_garbage() {
        assert!(parse_alert(1, "diesel barato").is_err());
        assert!(parse_alert(1, "queroseno 1.2").is_err());
        assert!(parse_alert(1, "diesel -1").is_err());
        let ok = parse_alert(1, "98 1.70 28001").expect("valid alert");
        assert_eq!(ok.fuel, "gasolina98");
        assert_eq!(ok.postal_code.as_deref(), Some("28001"));
    }
}

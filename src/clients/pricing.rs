use super::{error_from_response, ClientError};
use crate::config::Settings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Price lookup parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceQuery {
    /// Fuel type, e.g. `gasolina95`, `diesel`
    pub fuel: String,
    /// Restrict to one postal code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    /// Maximum number of stations
    pub limit: u32,
}

/// Price of one fuel at one station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuelPrice {
    /// Station name
    pub station: String,
    /// Municipality of the station
    #[serde(default)]
    pub municipality: String,
    /// Fuel type
    pub fuel: String,
    /// Price per litre in euros
    pub price_eur: f64,
    /// Time the price was published
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Price alert to create for a user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRequest {
    /// Telegram user id
    pub user_id: i64,
    /// Fuel type
    pub fuel: String,
    /// Notify when the price drops to or below this value
    pub max_price_eur: f64,
    /// Restrict to one postal code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
}

/// Alert as stored by the pricing API
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AlertConfirmation {
    /// Alert id
    pub id: u64,
    /// Whether the alert is active
    #[serde(default = "default_true")]
    pub active: bool,
}

const fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

/// Internal pricing/alerts API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PricingApi: Send + Sync {
    /// Cheapest current prices matching `query`
    async fn fetch_prices(&self, query: &PriceQuery) -> Result<Vec<FuelPrice>, ClientError>;
    /// Creates a price alert
    async fn create_alert(&self, request: &AlertRequest) -> Result<AlertConfirmation, ClientError>;
    /// Checks that the API answers
    async fn ping(&self) -> Result<(), ClientError>;
}

/// reqwest-based client of the pricing API
pub struct PricingApiClient {
    http: HttpClient,
    base_url: String,
    token: Option<String>,
}

impl PricingApiClient {
    /// Create a client for `base_url`
    #[must_use]
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Create the client from settings
    ///
    /// # Errors
    ///
    /// Returns `ClientError::MissingConfig` if no API URL is configured.
    pub fn from_settings(settings: &Settings) -> Result<Self, ClientError> {
        let url = settings
            .laravel_api_url
            .as_deref()
            .ok_or_else(|| ClientError::MissingConfig("LARAVEL_API_URL is missing".into()))?;
        Ok(Self::new(url, settings.laravel_api_token.clone()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let envelope: DataEnvelope<T> = response
            .json()
            .await
            .map_err(|e| ClientError::Json(e.to_string()))?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl PricingApi for PricingApiClient {
    async fn fetch_prices(&self, query: &PriceQuery) -> Result<Vec<FuelPrice>, ClientError> {
        let prices: Vec<FuelPrice> = self
            .send(self.http.get(self.url("prices")).query(query))
            .await?;
        debug!(fuel = %query.fuel, count = prices.len(), "Fetched prices");
        Ok(prices)
    }

    async fn create_alert(&self, request: &AlertRequest) -> Result<AlertConfirmation, ClientError> {
        self.send(self.http.post(self.url("alerts")).json(request))
            .await
    }

    async fn ping(&self) -> Result<(), ClientError> {
        let response = self
            .authorize(self.http.get(self.url("health")))
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let client = PricingApiClient::new("https://precios.example/", None);
        assert_eq!(client.url("prices"), "https://precios.example/api/prices");
    }

    #[test]
    fn test_price_envelope_parses() {
        let body = r#"{"data":[{"station":"Repsol Centro","municipality":"Madrid","fuel":"diesel","price_eur":1.389}]}"#;
        let parsed: DataEnvelope<Vec<FuelPrice>> = serde_json::from_str(body).expect("parses");
        assert_eq!(parsed.data.len(), 1);
        assert_eq!(parsed.data[0].station, "Repsol Centro");
        assert!(parsed.data[0].updated_at.is_none());
    }

    #[test]
    fn test_missing_url_is_reported() {
        let err = PricingApiClient::from_settings(&Settings::default()).err();
        assert!(matches!(err, Some(ClientError::MissingConfig(_))));
    }
}

//! HTTP clients for the external dependencies
//!
//! [`InferenceApi`] talks to the DeepSeek chat API, [`PricingApi`] to the
//! internal pricing/alerts service. Both are traits so the gateway can be
//! exercised against mocks.

/// DeepSeek inference client
pub mod deepseek;
/// Pricing and alerts API client
pub mod pricing;

pub use deepseek::{DeepSeekClient, InferenceApi};
pub use pricing::{AlertConfirmation, AlertRequest, FuelPrice, PriceQuery, PricingApi, PricingApiClient};

#[cfg(test)]
pub use deepseek::MockInferenceApi;
#[cfg(test)]
pub use pricing::MockPricingApi;

use thiserror::Error;

/// Errors returned by dependency clients
#[derive(Debug, Error)]
pub enum ClientError {
    /// Error returned by the remote API
    #[error("API error: {0}")]
    Api(String),
    /// Error during network communication
    #[error("Network error: {0}")]
    Network(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(String),
    /// Missing endpoint configuration or API key
    #[error("Missing configuration: {0}")]
    MissingConfig(String),
    /// Rate limit exceeded (429), optionally with a wait time
    #[error("Rate limit exceeded: {message} (wait: {wait_secs:?}s)")]
    RateLimit {
        /// Retry-After duration in seconds, if provided by the server
        wait_secs: Option<u64>,
        /// Error message from the server
        message: String,
    },
}

/// Turns a non-success response into a readable [`ClientError`]
pub(crate) async fn error_from_response(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let wait_secs = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let error_text = response.text().await.unwrap_or_default();

    // Proxies answer with HTML error pages
    let trimmed = error_text.trim_start();
    let message = if trimmed.starts_with("<!DOCTYPE") || trimmed.to_ascii_lowercase().starts_with("<html") {
        format!("{status} (Server returned HTML error page)")
    } else if error_text.chars().count() > 500 {
        let head: String = error_text.chars().take(500).collect();
        format!("{status} - {head}... (truncated)")
    } else {
        format!("{status} - {error_text}")
    };

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ClientError::RateLimit { wait_secs, message }
    } else {
        ClientError::Api(message)
    }
}

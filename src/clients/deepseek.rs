use super::ClientError;
use crate::config::Settings;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::{config::OpenAIConfig, Client};
use async_trait::async_trait;
use tracing::debug;

const SYSTEM_PROMPT: &str = "Eres el asistente de FuelWatch. Respondes en español, de forma breve, \
preguntas sobre precios de combustible en gasolineras de España. Si no sabes algo, dilo.";
const MAX_TOKENS: u32 = 400;
const TEMPERATURE: f32 = 0.3;

/// Natural-language answers for free-text messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceApi: Send + Sync {
    /// Answer `query`, with `context` describing what the bot knows about the user
    async fn answer(&self, query: &str, context: &str) -> Result<String, ClientError>;
}

/// DeepSeek chat client (OpenAI-compatible API)
pub struct DeepSeekClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl DeepSeekClient {
    /// Create a new DeepSeek client instance
    #[must_use]
    pub fn new(api_key: &str, api_base: &str, model: impl Into<String>) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base);
        Self {
            client: Client::with_config(config),
            model: model.into(),
        }
    }

    /// Create the client from settings
    ///
    /// # Errors
    ///
    /// Returns `ClientError::MissingConfig` if no API key is configured.
    pub fn from_settings(settings: &Settings) -> Result<Self, ClientError> {
        let api_key = settings
            .deepseek_api_key
            .as_deref()
            .ok_or_else(|| ClientError::MissingConfig("DEEPSEEK_API_KEY is missing".into()))?;
        Ok(Self::new(
            api_key,
            &settings.deepseek_api_base,
            settings.deepseek_model.clone(),
        ))
    }

    fn build_messages(query: &str, context: &str) -> Result<Vec<ChatCompletionRequestMessage>, ClientError> {
        let system = if context.is_empty() {
            SYSTEM_PROMPT.to_string()
        } else {
            format!("{SYSTEM_PROMPT}\n\nContexto del usuario: {context}")
        };
        Ok(vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system)
                .build()
                .map_err(|e| ClientError::Api(e.to_string()))?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(query)
                .build()
                .map_err(|e| ClientError::Api(e.to_string()))?
                .into(),
        ])
    }
}

#[async_trait]
impl InferenceApi for DeepSeekClient {
    async fn answer(&self, query: &str, context: &str) -> Result<String, ClientError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.as_str())
            .messages(Self::build_messages(query, context)?)
            .max_tokens(MAX_TOKENS)
            .temperature(TEMPERATURE)
            .build()
            .map_err(|e| ClientError::Api(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?;

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ClientError::Api("Empty response".to_string()))?;
        debug!(model = %self.model, chars = text.len(), "DeepSeek answered");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_reported() {
        let err = DeepSeekClient::from_settings(&Settings::default()).err();
        assert!(matches!(err, Some(ClientError::MissingConfig(_))));
    }

    #[test]
    fn test_context_is_added_to_system_prompt() {
        let messages = DeepSeekClient::build_messages("¿precio diésel?", "combustible: diesel")
            .expect("messages build");
        assert_eq!(messages.len(), 2);
        let rendered = serde_json::to_string(&messages).expect("serializes");
        assert!(rendered.contains("Contexto del usuario: combustible: diesel"));
    }
}

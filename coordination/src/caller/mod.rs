//! Rate-limited, retrying LLM client.
//!
//! [`ModelCaller`] is the seam every consumer goes through; the chatroom
//! engine and the trading council never touch HTTP directly.
//! [`HttpModelCaller`] speaks the three provider wire formats, spaces
//! requests to the same model at least one second apart and retries
//! transient failures with exponential backoff.

pub mod breaker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use breaker::{CircuitBreaker, CircuitState};

use crate::models::{ModelConfig, ModelRegistry, Provider};

#[derive(Debug, Error)]
pub enum CallError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("API key not configured ({0})")]
    MissingApiKey(String),

    #[error("request timeout after {0} ms")]
    Timeout(u64),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("network error: {0}")]
    Network(String),

    #[error("provider returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("empty response")]
    EmptyResponse,

    #[error("unparseable response: {0}")]
    Parse(String),
}

impl CallError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited | Self::Network(_) | Self::EmptyResponse
        )
    }
}

/// A single completion call against a named model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelCaller: Send + Sync {
    async fn call(
        &self,
        model_id: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, CallError>;
}

pub type SharedCaller = Arc<dyn ModelCaller>;

/// Call and swallow failures, logging them.
pub async fn call_quiet(
    caller: &dyn ModelCaller,
    model_id: &str,
    system: &str,
    user: &str,
    max_tokens: u32,
) -> Option<String> {
    match caller.call(model_id, system, user, max_tokens).await {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(model = model_id, error = %e, "model call failed");
            None
        }
    }
}

/// Retry schedule for transient errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Minimum spacing between two requests to the same model.
pub const MIN_SPACING: Duration = Duration::from_secs(1);

pub struct HttpModelCaller {
    client: reqwest::Client,
    registry: Arc<ModelRegistry>,
    last_request: Mutex<HashMap<String, Instant>>,
    retry: RetryPolicy,
    spacing: Duration,
}

impl HttpModelCaller {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry,
            last_request: Mutex::new(HashMap::new()),
            retry: RetryPolicy::default(),
            spacing: MIN_SPACING,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_spacing(mut self, spacing: Duration) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Reserve the next slot for `model_id` and sleep until it opens.
    async fn wait_turn(&self, model_id: &str) {
        let wait = {
            let mut last = self.last_request.lock().await;
            let now = Instant::now();
            let slot = match last.get(model_id) {
                Some(prev) if *prev + self.spacing > now => *prev + self.spacing,
                _ => now,
            };
            last.insert(model_id.to_string(), slot);
            slot - now
        };
        if !wait.is_zero() {
            debug!(model = model_id, wait_ms = wait.as_millis() as u64, "spacing model request");
            tokio::time::sleep(wait).await;
        }
    }

    async fn send_once(
        &self,
        model: &ModelConfig,
        api_key: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, CallError> {
        let request = match model.provider {
            Provider::OpenAi => self
                .client
                .post(format!("{}/chat/completions", model.base_url))
                .bearer_auth(api_key)
                .json(&serde_json::json!({
                    "model": model.model,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user }
                    ],
                    "temperature": 0.9,
                    "max_tokens": max_tokens
                })),
            Provider::Anthropic => self
                .client
                .post(format!("{}/messages", model.base_url))
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&serde_json::json!({
                    "model": model.model,
                    "system": system,
                    "messages": [{ "role": "user", "content": user }],
                    "max_tokens": max_tokens
                })),
            Provider::Google => self
                .client
                .post(format!(
                    "{}/models/{}:generateContent?key={}",
                    model.base_url, model.model, api_key
                ))
                .json(&serde_json::json!({
                    "contents": [{ "parts": [{ "text": format!("{system}\n\n{user}") }] }],
                    "generationConfig": { "temperature": 0.9, "maxOutputTokens": max_tokens }
                })),
        };

        let response = request
            .timeout(Duration::from_millis(model.timeout_ms))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CallError::Timeout(model.timeout_ms)
                } else {
                    CallError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(CallError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                CallError::Timeout(model.timeout_ms)
            } else {
                CallError::Parse(e.to_string())
            }
        })?;
        extract_text(model.provider, &json)
    }
}

/// Pull the reply text out of a provider response body.
pub fn extract_text(provider: Provider, json: &serde_json::Value) -> Result<String, CallError> {
    let text = match provider {
        Provider::OpenAi => json["choices"][0]["message"]["content"].as_str(),
        Provider::Anthropic => json["content"]
            .as_array()
            .and_then(|blocks| blocks.iter().find_map(|b| b["text"].as_str())),
        Provider::Google => json["candidates"][0]["content"]["parts"][0]["text"].as_str(),
    };
    match text.map(str::trim) {
        Some(t) if !t.is_empty() => Ok(t.to_string()),
        _ => Err(CallError::EmptyResponse),
    }
}

#[async_trait]
impl ModelCaller for HttpModelCaller {
    async fn call(
        &self,
        model_id: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, CallError> {
        let model = self
            .registry
            .get(model_id)
            .ok_or_else(|| CallError::UnknownModel(model_id.to_string()))?;
        let api_key = self.registry.api_key(model_id)?;

        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 0;
        loop {
            self.wait_turn(model_id).await;
            match self.send_once(model, &api_key, system, user, max_tokens).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        model = model_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retrying model call"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retryable_classification() {
        assert!(CallError::Timeout(1).is_retryable());
        assert!(CallError::RateLimited.is_retryable());
        assert!(CallError::Network("reset".into()).is_retryable());
        assert!(CallError::EmptyResponse.is_retryable());
        assert!(!CallError::MissingApiKey("K".into()).is_retryable());
        assert!(!CallError::Http { status: 400, body: String::new() }.is_retryable());
    }

    #[test]
    fn test_extract_text_per_provider() {
        let openai = json!({ "choices": [{ "message": { "content": " gm " } }] });
        assert_eq!(extract_text(Provider::OpenAi, &openai).unwrap(), "gm");

        let anthropic = json!({ "content": [{ "type": "thinking" }, { "type": "text", "text": "hi" }] });
        assert_eq!(extract_text(Provider::Anthropic, &anthropic).unwrap(), "hi");

        let google = json!({ "candidates": [{ "content": { "parts": [{ "text": "yo" }] } }] });
        assert_eq!(extract_text(Provider::Google, &google).unwrap(), "yo");

        let empty = json!({ "choices": [{ "message": { "content": "" } }] });
        assert!(matches!(extract_text(Provider::OpenAi, &empty), Err(CallError::EmptyResponse)));
    }

    #[tokio::test]
    async fn test_call_quiet_swallows_errors() {
        let mut mock = MockModelCaller::new();
        mock.expect_call()
            .returning(|model, _, _, _| match model {
                "deepseek" => Ok("fine".to_string()),
                _ => Err(CallError::RateLimited),
            });
        assert_eq!(call_quiet(&mock, "deepseek", "s", "u", 10).await.as_deref(), Some("fine"));
        assert_eq!(call_quiet(&mock, "kimi", "s", "u", 10).await, None);
    }

    #[tokio::test]
    async fn test_unknown_model_fails_fast() {
        let caller = HttpModelCaller::new(Arc::new(ModelRegistry::default()));
        assert!(matches!(
            caller.call("gpt5", "s", "u", 10).await,
            Err(CallError::UnknownModel(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_between_requests() {
        let caller = HttpModelCaller::new(Arc::new(ModelRegistry::default()));
        let start = Instant::now();
        caller.wait_turn("glm").await;
        caller.wait_turn("glm").await;
        caller.wait_turn("kimi").await;
        assert!(start.elapsed() >= MIN_SPACING);
        assert!(start.elapsed() < MIN_SPACING * 2);
    }
}

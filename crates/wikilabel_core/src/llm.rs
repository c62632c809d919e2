use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::config::GeneratorSettings;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Free-text completion service: prompt in, raw response text out.
pub trait CompletionApi {
    fn complete(&mut self, prompt: &str) -> Result<String>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct AnthropicClientConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl AnthropicClientConfig {
    /// Fails when no usable API key is configured.
    pub fn from_settings(settings: &GeneratorSettings) -> Result<Self> {
        let Some(api_key) = settings.api_key.clone() else {
            bail!("generator API key is missing or a placeholder (set ANTHROPIC_API_KEY)");
        };
        Ok(Self {
            api_url: settings.api_url.clone(),
            api_key,
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            timeout_ms: settings.timeout_ms,
            max_retries: 2,
            retry_delay_ms: 1_000,
        })
    }
}

pub struct AnthropicClient {
    client: Client,
    config: AnthropicClientConfig,
    request_count: usize,
}

impl AnthropicClient {
    pub fn from_settings(settings: &GeneratorSettings) -> Result<Self> {
        Self::new(AnthropicClientConfig::from_settings(settings)?)
    }

    pub fn new(config: AnthropicClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build generator HTTP client")?;
        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    fn request_body<'a>(&'a self, prompt: &'a str) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            messages: vec![MessageParam {
                role: "user",
                content: prompt,
            }],
        }
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl CompletionApi for AnthropicClient {
    fn complete(&mut self, prompt: &str) -> Result<String> {
        let max_retries = self.config.max_retries;
        for attempt in 0..=max_retries {
            self.request_count += 1;
            let response = self
                .client
                .post(&self.config.api_url)
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&self.request_body(prompt))
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            tracing::debug!(%status, attempt, "retrying generator request");
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("generator request failed with HTTP {status}");
                    }
                    let payload: MessagesResponse = response
                        .json()
                        .context("failed to decode generator response")?;
                    return Ok(payload.text());
                }
                Err(error) => {
                    if attempt < max_retries && (error.is_timeout() || error.is_connect()) {
                        tracing::debug!(%error, attempt, "retrying generator request");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call generator service");
                }
            }
        }

        bail!("generator request exhausted retry budget")
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

// Overloaded (529) is Anthropic-specific and retryable.
fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    ) || status.as_u16() == 529
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<MessageParam<'a>>,
}

#[derive(Debug, Serialize)]
struct MessageParam<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

impl MessagesResponse {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::StrategyChoice;

    fn settings(api_key: Option<&str>) -> GeneratorSettings {
        GeneratorSettings {
            strategy: StrategyChoice::Model,
            api_key: api_key.map(ToString::to_string),
            api_url: "https://llm.example/v1/messages".to_string(),
            model: "test-model".to_string(),
            max_tokens: 256,
            temperature: 0.5,
            timeout_ms: 1_000,
            content_budget_chars: 3_000,
            vocabulary_hint_limit: 50,
        }
    }

    #[test]
    fn response_text_concatenates_text_blocks() {
        let payload = json!({
            "content": [
                {"type": "text", "text": "[{\"label\":"},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": "\"a\",\"confidence\":0.9}]"}
            ]
        });
        let response: MessagesResponse = serde_json::from_value(payload).expect("decode");
        assert_eq!(response.text(), "[{\"label\":\"a\",\"confidence\":0.9}]");
    }

    #[test]
    fn request_body_uses_a_single_user_message() {
        let client = AnthropicClient::from_settings(&settings(Some("sk-test-123456789")))
            .expect("client");
        let body = serde_json::to_value(client.request_body("hello")).expect("encode");
        assert_eq!(
            body,
            json!({
                "model": "test-model",
                "max_tokens": 256,
                "temperature": 0.5,
                "messages": [{"role": "user", "content": "hello"}]
            })
        );
    }

    #[test]
    fn missing_key_is_rejected_before_any_request() {
        assert!(AnthropicClientConfig::from_settings(&settings(None)).is_err());
    }

    #[test]
    fn overloaded_status_is_retryable() {
        assert!(is_retryable_status(
            StatusCode::from_u16(529).expect("status")
        ));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }
}

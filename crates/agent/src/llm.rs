use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use returndesk_core::config::{LlmConfig, LlmProvider};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Whether a prompt asks for a short label or for free text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionMode {
    Classify,
    Generate,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str, mode: CompletionMode) -> Result<String>;
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
    #[error("network failure: {0}")]
    Network(String),
    #[error("authentication rejected by completion endpoint")]
    AuthenticationFailed,
    #[error("rate limited by completion endpoint")]
    RateLimited,
    #[error("completion endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not parse completion response: {0}")]
    Parse(String),
    #[error("could not build http client: {0}")]
    ClientBuild(String),
}

impl LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network(_) | Self::RateLimited => true,
            Self::Status { status, .. } => *status >= 500,
            Self::AuthenticationFailed | Self::Parse(_) | Self::ClientBuild(_) => false,
        }
    }
}

/// Chat-completions client for OpenAI and for servers exposing the same API (Ollama).
pub struct OpenAiCompatibleClient {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    router_model: String,
    temperature: f32,
    timeout: Duration,
    max_retries: u32,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| LlmError::ClientBuild(error.to_string()))?;

        let base_url = match (&config.base_url, config.provider) {
            (Some(base_url), _) => base_url.clone(),
            (None, LlmProvider::OpenAi) => OPENAI_BASE_URL.to_string(),
            (None, LlmProvider::Ollama) => "http://localhost:11434/v1".to_string(),
        };

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            router_model: config.classification_model().to_string(),
            temperature: config.temperature,
            timeout,
            max_retries: config.max_retries,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn model_for(&self, mode: CompletionMode) -> &str {
        match mode {
            CompletionMode::Classify => &self.router_model,
            CompletionMode::Generate => &self.model,
        }
    }

    async fn send_request(&self, prompt: &str, mode: CompletionMode) -> Result<Response, LlmError> {
        let body = ChatRequest {
            model: self.model_for(mode),
            messages: vec![ChatMessage { role: "user", content: prompt }],
            temperature: self.temperature,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        request.send().await.map_err(|error| {
            if error.is_timeout() {
                LlmError::Timeout { timeout_secs: self.timeout.as_secs() }
            } else if error.is_connect() {
                LlmError::Network(format!("connection failed: {error}"))
            } else {
                LlmError::Network(error.to_string())
            }
        })
    }

    async fn parse_response(&self, response: Response) -> Result<String, LlmError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthenticationFailed,
                429 => LlmError::RateLimited,
                code => LlmError::Status { status: code, body },
            });
        }

        let parsed: ChatResponse =
            response.json().await.map_err(|error| LlmError::Parse(error.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Parse("no choices in response".to_string()))
    }

    async fn complete_once(&self, prompt: &str, mode: CompletionMode) -> Result<String, LlmError> {
        let response = self.send_request(prompt, mode).await?;
        self.parse_response(response).await
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, prompt: &str, mode: CompletionMode) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.complete_once(prompt, mode).await {
                Ok(text) => return Ok(text),
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    warn!(
                        event_name = "agent.llm.retry",
                        attempt,
                        error = %error,
                        "completion request failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(250 << attempt.min(4))).await;
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Offline completion service: answers by matching a marker in the prompt.
///
/// Rules are checked in insertion order; the first whose marker occurs in the
/// prompt supplies the reply. Prompts matching nothing get the fallback, or an
/// error when no fallback is set.
#[derive(Default)]
pub struct ScriptedLlm {
    rules: Vec<(String, String)>,
    fallback: Option<String>,
    calls: Mutex<Vec<(CompletionMode, String)>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, marker: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules.push((marker.into(), reply.into()));
        self
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    /// Prompts seen so far, in call order.
    pub fn calls(&self) -> Vec<(CompletionMode, String)> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, prompt: &str, mode: CompletionMode) -> Result<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((mode, prompt.to_string()));
        }

        self.rules
            .iter()
            .find(|(marker, _)| prompt.contains(marker.as_str()))
            .map(|(_, reply)| reply.clone())
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| anyhow::anyhow!("no scripted completion for prompt"))
    }
}

#[cfg(test)]
mod tests {
    use returndesk_core::config::{AppConfig, LlmProvider};

    use super::{CompletionMode, LlmClient, OpenAiCompatibleClient, ScriptedLlm};

    #[tokio::test]
    async fn scripted_llm_matches_first_marker() {
        let llm = ScriptedLlm::new()
            .on("### task: route", "policy_only")
            .on("### task", "unused")
            .with_fallback("fallback");

        let routed = llm.complete("### task: route\nhello", CompletionMode::Classify).await;
        let other = llm.complete("plain prompt", CompletionMode::Generate).await;

        assert_eq!(routed.expect("routed"), "policy_only");
        assert_eq!(other.expect("fallback"), "fallback");
        assert_eq!(llm.calls().len(), 2);
        assert_eq!(llm.calls()[0].0, CompletionMode::Classify);
    }

    #[tokio::test]
    async fn scripted_llm_without_fallback_errors() {
        let llm = ScriptedLlm::new();
        assert!(llm.complete("anything", CompletionMode::Generate).await.is_err());
    }

    #[test]
    fn client_targets_chat_completions_endpoint() {
        let mut config = AppConfig::default().llm;
        config.base_url = Some("http://localhost:11434/v1/".to_string());
        let client = OpenAiCompatibleClient::from_config(&config).expect("client");
        assert_eq!(client.endpoint(), "http://localhost:11434/v1/chat/completions");

        config.provider = LlmProvider::OpenAi;
        config.base_url = None;
        let client = OpenAiCompatibleClient::from_config(&config).expect("client");
        assert_eq!(client.endpoint(), "https://api.openai.com/v1/chat/completions");
    }
}

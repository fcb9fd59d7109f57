//! LLM provider seam.
//!
//! The engine only ever talks to `LanguageModel`, so tests inject scripted
//! models and the HTTP client below stays swappable. The concrete client
//! speaks the OpenAI-compatible chat completions dialect, which most hosted
//! and local gateways accept.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use zeroize::Zeroize;

/// One short completion request. The honeypot only ever wants a single brief
/// persona utterance, so the knobs default accordingly.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl CompletionRequest {
    pub fn new(prompt: String) -> Self {
        Self {
            prompt,
            max_tokens: 200,
            temperature: 0.65,
            top_p: 0.95,
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError>;
}

/// Classified upstream failure; tells the safety fabric what happened without
/// the fabric needing to understand HTTP.
#[derive(Debug)]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 401/403 — bad credential.
    Auth,
    /// 429 — shed load upstream.
    RateLimit,
    /// Transport-level timeout (the fabric timeout usually fires first).
    Timeout,
    /// DNS, refused connection, reset.
    Network,
    /// 5xx from the provider.
    Server,
    /// The provider answered but refused or filtered the content.
    Policy,
    Unknown,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => LlmErrorKind::Auth,
            408 => LlmErrorKind::Timeout,
            429 => LlmErrorKind::RateLimit,
            500..=599 => LlmErrorKind::Server,
            _ => LlmErrorKind::Unknown,
        };
        let mut message = body.to_string();
        if message.len() > 300 {
            message.truncate(300);
            message.push_str("...");
        }
        Self {
            kind,
            status: Some(status),
            message,
        }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            LlmErrorKind::Timeout
        } else {
            LlmErrorKind::Network
        };
        Self {
            kind,
            status: None,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "llm error ({status}, {:?}): {}", self.kind, self.message),
            None => write!(f, "llm error ({:?}): {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Minimal OpenAI-compatible chat client.
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl Drop for OpenAiCompatibleClient {
    fn drop(&mut self) {
        self.api_key.zeroize();
    }
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> anyhow::Result<Self> {
        // Generous transport timeout; the safety fabric enforces the real
        // per-call budget.
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "top_p": request.top_p,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::network(&e))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::network(&e))?;
        if status != 200 {
            return Err(LlmError::from_status(status, &text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::new(LlmErrorKind::Unknown, e.to_string()))?;
        let choice = &parsed["choices"][0];
        if choice["finish_reason"].as_str() == Some("content_filter") {
            return Err(LlmError::new(
                LlmErrorKind::Policy,
                "completion rejected by provider content filter",
            ));
        }
        match choice["message"]["content"].as_str() {
            Some(content) if !content.trim().is_empty() => Ok(content.trim().to_string()),
            _ => Err(LlmError::new(
                LlmErrorKind::Policy,
                "provider returned an empty completion",
            )),
        }
    }
}

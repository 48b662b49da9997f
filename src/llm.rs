//! LLM backend abstraction and implementations.
//!
//! Defines the [`LlmBackend`] trait the dispatcher calls, plus:
//! - **[`DisabledBackend`]**: reports the backend as unavailable; used when
//!   `llm.provider = "disabled"`.
//! - **[`OllamaBackend`]**: calls a local Ollama instance's `/api/generate`
//!   and `/api/chat` endpoints with `stream: false`.
//!
//! Use [`create_backend`] to build the configured backend.
//!
//! # Error Mapping
//!
//! | Condition | Error |
//! |-----------|-------|
//! | connection refused, DNS, reset | `BackendUnavailable` |
//! | HTTP 429 / 5xx | `BackendUnavailable` |
//! | client-side timeout | `BackendTimeout` |
//! | other HTTP 4xx (bad model, bad options) | `InvalidRequest` |
//! | 2xx with an undecodable body | `BackendUnavailable` |
//!
//! # Retry Strategy
//!
//! Off by default. With `llm.max_retries > 0`, only `BackendUnavailable`
//! failures are retried, with exponential backoff: 1s, 2s, 4s, ... capped at
//! 2^5 seconds.

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{DispatchError, DispatchResult};

/// Sampling and model options forwarded to the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Overrides the configured model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Upper bound on generated tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Identity of the vector collection a backend may retrieve from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrievalContext {
    pub context_id: String,
    pub binding_id: String,
    pub vdb: String,
    pub vdb_collection: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A single-prompt generation call as the backend sees it.
#[derive(Debug, Clone)]
pub struct GenerateCall {
    pub prompt: String,
    pub params: ModelParams,
    pub retrieval: Option<RetrievalContext>,
}

/// A chat call as the backend sees it.
#[derive(Debug, Clone)]
pub struct ChatCall {
    pub messages: Vec<ChatMessage>,
    pub params: ModelParams,
    pub retrieval: Option<RetrievalContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub content: String,
    pub model: String,
    pub finish_reason: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatResult {
    pub message: ChatMessage,
    pub model: String,
    pub finish_reason: String,
    pub usage: Usage,
}

/// An LLM the dispatcher can forward requests to.
///
/// Implementations perform one blocking request/response per call. Dropping
/// the returned future must abort any in-flight transport request.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Backend identifier (e.g. `"ollama"`).
    fn name(&self) -> &str;

    async fn generate(&self, call: &GenerateCall) -> DispatchResult<GenerationResult>;

    async fn chat(&self, call: &ChatCall) -> DispatchResult<ChatResult>;
}

// ============ Disabled Backend ============

/// Backend used when no LLM is configured. Every call is unavailable.
pub struct DisabledBackend;

#[async_trait]
impl LlmBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _call: &GenerateCall) -> DispatchResult<GenerationResult> {
        Err(disabled())
    }

    async fn chat(&self, _call: &ChatCall) -> DispatchResult<ChatResult> {
        Err(disabled())
    }
}

fn disabled() -> DispatchError {
    DispatchError::BackendUnavailable(
        "LLM backend is disabled. Set [llm] provider in config.".to_string(),
    )
}

// ============ Ollama Backend ============

/// Backend for a local or remote Ollama server.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_retries: u32,
}

impl OllamaBackend {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for Ollama backend"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url().trim_end_matches('/').to_string(),
            model,
            max_retries: config.max_retries,
        })
    }

    fn model_for<'a>(&'a self, params: &'a ModelParams) -> &'a str {
        params.model.as_deref().unwrap_or(&self.model)
    }

    /// POST a JSON body, retrying transient failures if configured.
    async fn post(&self, path: &str, body: &Value) -> DispatchResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.post_once(&url, body).await {
                Ok(json) => return Ok(json),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    warn!(attempt, url = %url, error = %e, "LLM backend call failed, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            DispatchError::BackendUnavailable("Ollama call failed after retries".to_string())
        }))
    }

    async fn post_once(&self, url: &str, body: &Value) -> DispatchResult<Value> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, e))?;

        let status = response.status();
        if status.is_success() {
            let text = response
                .text()
                .await
                .map_err(|e| transport_error(&self.base_url, e))?;
            return serde_json::from_str(&text).map_err(|e| {
                DispatchError::BackendUnavailable(format!("Invalid Ollama response body: {}", e))
            });
        }

        let body_text = response.text().await.unwrap_or_default();
        let detail = error_detail(&body_text);
        if status.as_u16() == 429 || status.is_server_error() {
            Err(DispatchError::BackendUnavailable(format!(
                "Ollama API error {}: {}",
                status, detail
            )))
        } else {
            Err(DispatchError::InvalidRequest(format!(
                "Ollama API error {}: {}",
                status, detail
            )))
        }
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, call: &GenerateCall) -> DispatchResult<GenerationResult> {
        let model = self.model_for(&call.params);
        let mut body = json!({
            "model": model,
            "prompt": call.prompt,
            "stream": false,
        });
        decorate(&mut body, &call.params, call.retrieval.as_ref());

        debug!(model, prompt_len = call.prompt.len(), "ollama generate");
        let json = self.post("/api/generate", &body).await?;
        parse_generate_response(&json, model)
    }

    async fn chat(&self, call: &ChatCall) -> DispatchResult<ChatResult> {
        let model = self.model_for(&call.params);
        let mut body = json!({
            "model": model,
            "messages": call.messages,
            "stream": false,
        });
        decorate(&mut body, &call.params, call.retrieval.as_ref());

        debug!(model, messages = call.messages.len(), "ollama chat");
        let json = self.post("/api/chat", &body).await?;
        parse_chat_response(&json, model)
    }
}

/// Attach Ollama `options` and the retrieval context to a request body.
fn decorate(body: &mut Value, params: &ModelParams, retrieval: Option<&RetrievalContext>) {
    let options = ollama_options(params);
    if let Some(obj) = body.as_object_mut() {
        if !options.is_empty() {
            obj.insert("options".to_string(), Value::Object(options));
        }
        if let Some(r) = retrieval {
            obj.insert("retrieval".to_string(), json!(r));
        }
    }
}

fn ollama_options(params: &ModelParams) -> Map<String, Value> {
    let mut options = Map::new();
    if let Some(t) = params.temperature {
        options.insert("temperature".into(), json!(t));
    }
    if let Some(p) = params.top_p {
        options.insert("top_p".into(), json!(p));
    }
    if let Some(k) = params.top_k {
        options.insert("top_k".into(), json!(k));
    }
    if let Some(n) = params.max_tokens {
        options.insert("num_predict".into(), json!(n));
    }
    if let Some(s) = params.seed {
        options.insert("seed".into(), json!(s));
    }
    if !params.stop.is_empty() {
        options.insert("stop".into(), json!(params.stop));
    }
    options
}

fn transport_error(base_url: &str, e: reqwest::Error) -> DispatchError {
    if e.is_timeout() {
        DispatchError::BackendTimeout(format!(
            "Ollama at {} did not answer in time: {}",
            base_url, e
        ))
    } else {
        DispatchError::BackendUnavailable(format!(
            "Ollama connection error (is Ollama running at {}?): {}",
            base_url, e
        ))
    }
}

/// Ollama errors come back as `{"error": "..."}`; fall back to the raw body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

fn usage_from(json: &Value) -> Usage {
    Usage {
        prompt_tokens: json
            .get("prompt_eval_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        completion_tokens: json.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
    }
}

fn finish_reason_from(json: &Value) -> String {
    json.get("done_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string()
}

fn model_from(json: &Value, fallback: &str) -> String {
    json.get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(fallback)
        .to_string()
}

fn parse_generate_response(
    json: &Value,
    requested_model: &str,
) -> DispatchResult<GenerationResult> {
    let content = json
        .get("response")
        .and_then(|r| r.as_str())
        .ok_or_else(|| {
            DispatchError::BackendUnavailable(
                "Invalid Ollama response: missing response field".to_string(),
            )
        })?;

    Ok(GenerationResult {
        content: content.to_string(),
        model: model_from(json, requested_model),
        finish_reason: finish_reason_from(json),
        usage: usage_from(json),
    })
}

fn parse_chat_response(json: &Value, requested_model: &str) -> DispatchResult<ChatResult> {
    let message = json
        .get("message")
        .cloned()
        .and_then(|m| serde_json::from_value::<ChatMessage>(m).ok())
        .ok_or_else(|| {
            DispatchError::BackendUnavailable(
                "Invalid Ollama response: missing or malformed message".to_string(),
            )
        })?;

    Ok(ChatResult {
        message,
        model: model_from(json, requested_model),
        finish_reason: finish_reason_from(json),
        usage: usage_from(json),
    })
}

/// Create the [`LlmBackend`] named by `llm.provider`.
///
/// | Config Value | Backend |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledBackend`] |
/// | `"ollama"` | [`OllamaBackend`] |
pub fn create_backend(config: &LlmConfig) -> anyhow::Result<Arc<dyn LlmBackend>> {
    if !config.is_enabled() {
        return Ok(Arc::new(DisabledBackend));
    }
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaBackend::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generate_response() {
        let json = json!({
            "model": "llama3",
            "response": "Hello there",
            "done": true,
            "done_reason": "length",
            "prompt_eval_count": 12,
            "eval_count": 30
        });
        let result = parse_generate_response(&json, "fallback").unwrap();
        assert_eq!(result.content, "Hello there");
        assert_eq!(result.model, "llama3");
        assert_eq!(result.finish_reason, "length");
        assert_eq!(result.usage.total_tokens(), 42);
    }

    #[test]
    fn test_parse_generate_defaults() {
        let json = json!({ "response": "" });
        let result = parse_generate_response(&json, "mistral").unwrap();
        assert_eq!(result.model, "mistral");
        assert_eq!(result.finish_reason, "stop");
        assert_eq!(result.usage, Usage::default());
    }

    #[test]
    fn test_parse_generate_missing_response() {
        let err = parse_generate_response(&json!({ "done": true }), "m").unwrap_err();
        assert!(matches!(err, DispatchError::BackendUnavailable(_)));
    }

    #[test]
    fn test_parse_chat_response() {
        let json = json!({
            "model": "llama3",
            "message": { "role": "assistant", "content": "Hi" },
            "done_reason": "stop",
            "eval_count": 3
        });
        let result = parse_chat_response(&json, "m").unwrap();
        assert_eq!(result.message, ChatMessage::new(ChatRole::Assistant, "Hi"));
        assert_eq!(result.usage.completion_tokens, 3);
    }

    #[test]
    fn test_options_only_include_set_params() {
        assert!(ollama_options(&ModelParams::default()).is_empty());

        let params = ModelParams {
            temperature: Some(0.5),
            max_tokens: Some(64),
            stop: vec!["\n\n".to_string()],
            ..Default::default()
        };
        let options = ollama_options(&params);
        assert_eq!(options.len(), 3);
        assert_eq!(options["num_predict"], json!(64));
    }

    #[test]
    fn test_decorate_adds_retrieval() {
        let mut body = json!({ "model": "m" });
        let retrieval = RetrievalContext {
            context_id: "c1".into(),
            binding_id: "b1".into(),
            vdb: "qdrant".into(),
            vdb_collection: "docs".into(),
        };
        decorate(&mut body, &ModelParams::default(), Some(&retrieval));
        assert_eq!(body["retrieval"]["vdb_collection"], json!("docs"));
        assert!(body.get("options").is_none());
    }

    #[test]
    fn test_error_detail_extracts_ollama_error() {
        assert_eq!(
            error_detail(r#"{"error":"model 'x' not found"}"#),
            "model 'x' not found"
        );
        assert_eq!(error_detail("plain failure"), "plain failure");
    }

    #[tokio::test]
    async fn test_disabled_backend_is_unavailable() {
        let call = GenerateCall {
            prompt: "hello".into(),
            params: ModelParams::default(),
            retrieval: None,
        };
        let err = DisabledBackend.generate(&call).await.unwrap_err();
        assert_eq!(err.code(), "backend_unavailable");
    }

    #[test]
    fn test_create_backend() {
        let backend = create_backend(&LlmConfig::default()).unwrap();
        assert_eq!(backend.name(), "disabled");

        let cfg = LlmConfig {
            provider: "ollama".into(),
            model: Some("llama3".into()),
            ..Default::default()
        };
        assert_eq!(create_backend(&cfg).unwrap().name(), "ollama");
    }
}

//! Local model server adapter (Ollama-style `/api/chat`).
//!
//! Talks to a model runner on the local network. Text-only; no credential
//! is involved, so nothing in these settings is vault-encrypted. Model
//! discovery queries `/api/tags` and falls back to a static list when the
//! server is unreachable, so the configuration surface stays usable while
//! the runner is down.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::chat::{to_text_only, ChatMessage, TextMessage};
use crate::error::GatewayError;
use crate::providers::{ProviderResponse, ProviderUsage, RequestOptions, TextStream};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Offered when `/api/tags` cannot be reached.
const FALLBACK_MODELS: &[&str] = &["llama3.2", "llama3.1", "mistral", "qwen2.5", "gemma2"];

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Settings {
    model: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

// ── Adapter ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LocalProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: Option<f32>,
}

impl LocalProvider {
    pub fn from_settings(settings: &Value) -> Result<Self, GatewayError> {
        let s: Settings = serde_json::from_value(settings.clone())
            .map_err(|e| GatewayError::InvalidSettings(format!("local settings: {e}")))?;
        Ok(Self {
            client: super::http_client(s.timeout_seconds)?,
            base_url: s
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: s.model,
            temperature: s.temperature,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Installed models from the runner, or the static fallback list when
    /// the runner does not answer. Never fails.
    pub async fn list_models(&self) -> Vec<String> {
        let url = format!("{}/api/tags", self.base_url);
        let fetched = async {
            let response = self.client.get(&url).send().await.ok()?;
            if !response.status().is_success() {
                return None;
            }
            let tags: TagsResponse = response.json().await.ok()?;
            Some(tags.models.into_iter().map(|m| m.name).collect::<Vec<_>>())
        }
        .await;
        match fetched {
            Some(models) if !models.is_empty() => models,
            _ => {
                warn!(%url, "model runner did not answer; using fallback model list");
                FALLBACK_MODELS.iter().map(|m| m.to_string()).collect()
            }
        }
    }

    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        opts: &RequestOptions,
    ) -> Result<ProviderResponse, GatewayError> {
        let payload = self.payload(messages, opts);
        let url = format!("{}/api/chat", self.base_url);
        debug!(model = %self.model, %url, "sending local chat request");

        let response = self.client.post(&url).json(&payload).send().await.map_err(|e| {
            error!(%url, error = %e, "local chat request failed (transport)");
            GatewayError::Provider { status: None, message: e.to_string() }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read error body>".to_string());
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_string))
                .unwrap_or(body);
            error!(%status, %message, "model runner returned HTTP error");
            return Err(GatewayError::Provider { status: Some(status.as_u16()), message });
        }

        let parsed: LocalChatResponse = response.json().await.map_err(|e| {
            GatewayError::Provider {
                status: None,
                message: format!("failed to parse response body: {e}"),
            }
        })?;

        let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
            (None, None) => None,
            (p, c) => {
                let prompt = p.unwrap_or(0);
                let completion = c.unwrap_or(0);
                Some(ProviderUsage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: prompt + completion,
                })
            }
        };

        Ok(ProviderResponse {
            text: parsed.message.map(|m| m.content).unwrap_or_default(),
            finish_reason: parsed.done_reason.unwrap_or_else(|| "stop".into()),
            usage,
            reasoning: None,
        })
    }

    /// One-shot degradation: the full answer as a single chunk.
    pub async fn stream(
        &self,
        messages: &[ChatMessage],
        opts: &RequestOptions,
    ) -> Result<TextStream, GatewayError> {
        let provider = self.clone();
        let messages = messages.to_vec();
        let opts = opts.clone();
        let out = async_stream::try_stream! {
            let response = provider.generate(&messages, &opts).await?;
            yield response.text;
        };
        Ok(Box::pin(out))
    }

    fn payload(&self, messages: &[ChatMessage], opts: &RequestOptions) -> LocalChatRequest {
        LocalChatRequest {
            model: self.model.clone(),
            messages: to_text_only(messages),
            stream: false,
            options: LocalOptions {
                temperature: opts.temperature.or(self.temperature),
                num_predict: opts.max_tokens,
            },
        }
    }
}

// ── Private wire types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct LocalChatRequest {
    model: String,
    messages: Vec<TextMessage>,
    stream: bool,
    options: LocalOptions,
}

#[derive(Debug, Serialize)]
struct LocalOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LocalChatResponse {
    #[serde(default)]
    message: Option<LocalMessage>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LocalMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

//! OpenAI-compatible chat completion adapter (`/v1/chat/completions`).
//!
//! Covers OpenAI itself, OpenAI-compatible local servers (LM Studio,
//! llama.cpp server…) and hosted alternatives. Text-only: messages are
//! flattened and image parts dropped. All wire types are private to this
//! module — callers never see them.
//!
//! No model-discovery endpoint is assumed: `list_models` is just the one
//! configured model name.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::chat::{to_text_only, ChatMessage, TextMessage};
use crate::error::GatewayError;
use crate::providers::{http_client, ProviderResponse, ProviderUsage, RequestOptions, TextStream};

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Settings {
    model: String,
    base_url: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    headers: Option<std::collections::BTreeMap<String, String>>,
}

// ── Adapter ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: Option<f32>,
    api_key: Option<String>,
    extra_headers: HeaderMap,
}

impl OpenAiCompatibleProvider {
    pub fn from_settings(settings: &Value) -> Result<Self, GatewayError> {
        let s: Settings = serde_json::from_value(settings.clone())
            .map_err(|e| GatewayError::InvalidSettings(format!("http-compatible settings: {e}")))?;

        let mut extra_headers = HeaderMap::new();
        if let Some(headers) = &s.headers {
            for (name, value) in headers {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                    GatewayError::InvalidSettings(format!("invalid header name '{name}'"))
                })?;
                let value = HeaderValue::from_str(value).map_err(|_| {
                    GatewayError::InvalidSettings(format!("invalid value for header '{name}'"))
                })?;
                extra_headers.insert(name, value);
            }
        }

        Ok(Self {
            client: http_client(s.timeout_seconds)?,
            endpoint: chat_completions_endpoint(&s.base_url),
            model: s.model,
            temperature: s.temperature,
            api_key: s.api_key,
            extra_headers,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// No discovery endpoint is assumed for this family.
    pub fn list_models(&self) -> Vec<String> {
        vec![self.model.clone()]
    }

    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        opts: &RequestOptions,
    ) -> Result<ProviderResponse, GatewayError> {
        let payload = self.payload(messages, opts, false);
        debug!(model = %self.model, endpoint = %self.endpoint, "sending chat completion request");

        let response = self.request(&payload).await?;
        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            error!(error = %e, "failed to deserialize chat completion response");
            GatewayError::Provider {
                status: None,
                message: format!("failed to parse response body: {e}"),
            }
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| GatewayError::Provider {
            status: None,
            message: "response contained no choices".into(),
        })?;

        let text = choice.message.content.unwrap_or_default();
        Ok(ProviderResponse {
            text,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".into()),
            usage: parsed.usage.map(|u| ProviderUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens.unwrap_or(u.prompt_tokens + u.completion_tokens),
            }),
            reasoning: choice.message.reasoning_content,
        })
    }

    /// SSE stream of content deltas, terminated by the `[DONE]` sentinel.
    pub async fn stream(
        &self,
        messages: &[ChatMessage],
        opts: &RequestOptions,
    ) -> Result<TextStream, GatewayError> {
        let payload = self.payload(messages, opts, true);
        debug!(model = %self.model, endpoint = %self.endpoint, "opening chat completion stream");

        let response = self.request(&payload).await?;
        let mut bytes = response.bytes_stream();
        let mut buf = Vec::<u8>::new();

        let out = async_stream::try_stream! {
            use futures_util::StreamExt;
            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| GatewayError::Provider {
                    status: None,
                    message: format!("stream transport error: {e}"),
                })?;
                buf.extend_from_slice(&chunk);
                while let Some(pos) = find_event_boundary(&buf) {
                    let block: Vec<u8> = buf.drain(..pos + 2).collect();
                    if let Some(line) = extract_data_line(&block) {
                        if line.trim() == "[DONE]" {
                            break 'outer;
                        }
                        if let Some(delta) = parse_delta(&line) {
                            yield delta;
                        }
                    }
                }
            }
            // Flush a trailing event without a final blank line.
            if let Some(line) = extract_data_line(&buf) {
                if line.trim() != "[DONE]" {
                    if let Some(delta) = parse_delta(&line) {
                        yield delta;
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }

    fn payload(&self, messages: &[ChatMessage], opts: &RequestOptions, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: to_text_only(messages),
            temperature: opts.temperature.or(self.temperature),
            max_tokens: opts.max_tokens,
            stream,
        }
    }

    async fn request(&self, payload: &ChatCompletionRequest) -> Result<reqwest::Response, GatewayError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .headers(self.extra_headers.clone())
            .json(payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.map_err(|e| {
            error!(endpoint = %self.endpoint, error = %e, "chat completion request failed (transport)");
            GatewayError::Provider { status: None, message: e.to_string() }
        })?;
        check_status(response).await
    }
}

/// Derive the chat-completions URL from a configured base. Bases that
/// already point at the endpoint are used as-is.
fn chat_completions_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else if trimmed.ends_with("/v1") {
        format!("{trimmed}/chat/completions")
    } else {
        format!("{trimmed}/v1/chat/completions")
    }
}

// ── Private wire types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<TextMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageData>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageData {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}

// Error envelope used by OpenAI and compatible APIs.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Consume the response and return it if successful, or a structured error
/// carrying the upstream status.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());
    let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(env) => env.error.message,
        Err(_) => body,
    };
    error!(%status, %message, "upstream returned HTTP error");
    Err(GatewayError::Provider { status: Some(status.as_u16()), message })
}

// ── SSE parsing ───────────────────────────────────────────────────────────────

fn find_event_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn extract_data_line(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    for line in text.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix("data:") {
            return Some(rest.trim().to_string());
        }
    }
    None
}

fn parse_delta(line: &str) -> Option<String> {
    let v: Value = serde_json::from_str(line).ok()?;
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Role;
    use serde_json::json;

    #[test]
    fn endpoint_derivation() {
        assert_eq!(
            chat_completions_endpoint("https://api.openai.com"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_endpoint("http://localhost:1234/v1/"),
            "http://localhost:1234/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_endpoint("http://host/v1/chat/completions"),
            "http://host/v1/chat/completions"
        );
    }

    #[test]
    fn settings_require_model_and_base_url() {
        assert!(OpenAiCompatibleProvider::from_settings(&json!({ "model": "m" })).is_err());
        assert!(OpenAiCompatibleProvider::from_settings(&json!({ "baseUrl": "http://x" })).is_err());
        let p = OpenAiCompatibleProvider::from_settings(
            &json!({ "model": "m", "baseUrl": "http://x", "headers": { "X-Org": "acme" } }),
        )
        .unwrap();
        assert_eq!(p.list_models(), vec!["m".to_string()]);
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let err = OpenAiCompatibleProvider::from_settings(
            &json!({ "model": "m", "baseUrl": "http://x", "headers": { "bad header": "v" } }),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidSettings(_)));
    }

    #[test]
    fn payload_flattens_messages_and_applies_overrides() {
        let p = OpenAiCompatibleProvider::from_settings(
            &json!({ "model": "m", "baseUrl": "http://x", "temperature": 0.7 }),
        )
        .unwrap();
        let messages = vec![ChatMessage::text(Role::User, "hi")];
        let body = p.payload(&messages, &RequestOptions { temperature: Some(0.1), ..Default::default() }, false);
        assert_eq!(body.temperature, Some(0.1));
        assert_eq!(body.messages[0].content, "hi");

        let body = p.payload(&messages, &RequestOptions::default(), true);
        assert_eq!(body.temperature, Some(0.7));
        assert!(body.stream);
    }

    #[test]
    fn delta_parsing() {
        let line = r#"{"choices":[{"delta":{"content":"hel"}}]}"#;
        assert_eq!(parse_delta(line).as_deref(), Some("hel"));
        assert_eq!(parse_delta(r#"{"choices":[{"delta":{}}]}"#), None);
        assert_eq!(parse_delta("not json"), None);
    }

    #[test]
    fn data_line_extraction() {
        let block = b"event: message\ndata: {\"x\":1}\n\n";
        assert_eq!(extract_data_line(block).as_deref(), Some("{\"x\":1}"));
        assert_eq!(extract_data_line(b": keepalive\n\n"), None);
    }
}

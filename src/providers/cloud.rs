//! Cloud multimodal adapter (Gemini-style `generateContent` API).
//!
//! The only backend that receives decoded image parts: messages go through
//! the multimodal conversion and attachment batches are folded in before
//! building the wire payload. System-role messages have no slot in the
//! `contents` array and are lifted into `system_instruction`.
//!
//! The API has no server-side streaming here; `stream` degrades to a
//! single-chunk stream over the complete answer.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::chat::{
    to_multimodal, AttachmentBatch, ChatMessage, MultimodalContent, MultimodalPart, Role,
};
use crate::error::GatewayError;
use crate::providers::{ProviderResponse, ProviderUsage, RequestOptions, TextStream};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Models offered when the backend exposes no discovery endpoint we use.
const KNOWN_MODELS: &[&str] = &[
    "gemini-2.0-flash",
    "gemini-2.0-flash-lite",
    "gemini-1.5-pro",
    "gemini-1.5-flash",
];

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Settings {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

// ── Adapter ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CloudMultimodalProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: Option<f32>,
}

impl CloudMultimodalProvider {
    pub fn from_settings(settings: &Value) -> Result<Self, GatewayError> {
        let s: Settings = serde_json::from_value(settings.clone())
            .map_err(|e| GatewayError::InvalidSettings(format!("cloud-multimodal settings: {e}")))?;
        let api_key = match s.api_key {
            Some(k) if !k.is_empty() => k,
            _ => {
                return Err(GatewayError::InvalidSettings(
                    "cloud-multimodal requires an apiKey".into(),
                ))
            }
        };
        Ok(Self {
            client: super::http_client(s.timeout_seconds)?,
            base_url: s
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: s.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key,
            temperature: s.temperature,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn list_models(&self) -> Vec<String> {
        KNOWN_MODELS.iter().map(|m| m.to_string()).collect()
    }

    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        attachments: &[AttachmentBatch],
        opts: &RequestOptions,
    ) -> Result<ProviderResponse, GatewayError> {
        let payload = self.payload(messages, attachments, opts)?;
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        debug!(model = %self.model, "sending generateContent request");

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(model = %self.model, error = %e, "generateContent request failed (transport)");
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
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(body);
            error!(%status, %message, "upstream returned HTTP error");
            return Err(GatewayError::Provider { status: Some(status.as_u16()), message });
        }

        let parsed: GenerateContentResponse = response.json().await.map_err(|e| {
            GatewayError::Provider {
                status: None,
                message: format!("failed to parse response body: {e}"),
            }
        })?;

        let candidate = parsed.candidates.into_iter().next().ok_or_else(|| {
            GatewayError::Provider { status: None, message: "response contained no candidates".into() }
        })?;
        let text = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect::<Vec<_>>().join(""))
            .unwrap_or_default();

        Ok(ProviderResponse {
            text,
            finish_reason: candidate
                .finish_reason
                .map(|r| r.to_ascii_lowercase())
                .unwrap_or_else(|| "stop".into()),
            usage: parsed.usage_metadata.map(|u| ProviderUsage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            }),
            reasoning: None,
        })
    }

    /// One-shot degradation: the full answer as a single chunk.
    pub async fn stream(
        &self,
        messages: &[ChatMessage],
        attachments: &[AttachmentBatch],
        opts: &RequestOptions,
    ) -> Result<TextStream, GatewayError> {
        let provider = self.clone();
        let messages = messages.to_vec();
        let attachments = attachments.to_vec();
        let opts = opts.clone();
        let out = async_stream::try_stream! {
            let response = provider.generate(&messages, &attachments, &opts).await?;
            yield response.text;
        };
        Ok(Box::pin(out))
    }

    fn payload(
        &self,
        messages: &[ChatMessage],
        attachments: &[AttachmentBatch],
        opts: &RequestOptions,
    ) -> Result<GenerateContentRequest, GatewayError> {
        let multimodal = to_multimodal(messages, attachments)?;

        let mut system_texts = Vec::new();
        let mut contents = Vec::new();
        for message in multimodal {
            let parts = wire_parts(message.content);
            if message.role == Role::System {
                system_texts.extend(parts.into_iter().filter_map(|p| p.text));
                continue;
            }
            let role = match message.role {
                Role::Assistant => "model",
                _ => "user",
            };
            contents.push(WireContent { role, parts });
        }

        let system_instruction = if system_texts.is_empty() {
            None
        } else {
            Some(SystemInstruction {
                parts: vec![WirePart { text: Some(system_texts.join("\n\n")), inline_data: None }],
            })
        };

        Ok(GenerateContentRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                temperature: opts.temperature.or(self.temperature),
                max_output_tokens: opts.max_tokens,
                response_mime_type: opts
                    .response_schema
                    .as_ref()
                    .map(|_| "application/json".to_string()),
                response_schema: opts.response_schema.clone(),
            },
        })
    }
}

fn wire_parts(content: MultimodalContent) -> Vec<WirePart> {
    let parts = match content {
        MultimodalContent::Text(s) => vec![MultimodalPart::Text(s)],
        MultimodalContent::Parts(parts) => parts,
    };
    parts
        .into_iter()
        .map(|p| match p {
            MultimodalPart::Text(text) => WirePart { text: Some(text), inline_data: None },
            MultimodalPart::Image { data, media_type } => WirePart {
                text: None,
                inline_data: Some(InlineData { mime_type: media_type, data: BASE64.encode(data) }),
            },
        })
        .collect()
}

// ── Private wire types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct WireContent {
    role: &'static str,
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inline_data", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize)]
struct InlineData {
    #[serde(rename = "mime_type")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

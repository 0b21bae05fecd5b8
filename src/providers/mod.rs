//! Provider adapters.
//!
//! [`Provider`] is an enum over concrete backend implementations — enum
//! dispatch avoids `dyn` trait objects and the `async-trait` dependency.
//! Adding a backend = new module + new [`ProviderKind`] variant + new match
//! arms, enforced exhaustively by the compiler.
//!
//! Provider instances are shared immutable capabilities — clone them freely
//! (`reqwest::Client` is an `Arc` internally). Adapters never retry: an
//! upstream failure is terminal for the current request.

pub mod cloud;
pub mod local;
pub mod openai_compatible;

use std::pin::Pin;
use std::str::FromStr;

use futures_util::Stream;
use serde_json::Value;

use crate::chat::{AttachmentBatch, ChatMessage};
use crate::error::GatewayError;

/// Per-request HTTP timeout applied when settings do not override it.
const DEFAULT_TIMEOUT_SECONDS: u64 = 120;

// ── Provider kind ─────────────────────────────────────────────────────────────

/// The closed set of backend families this gateway can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    CloudMultimodal,
    Local,
    OpenAiCompatible,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::CloudMultimodal => "cloud-multimodal",
            ProviderKind::Local => "local",
            ProviderKind::OpenAiCompatible => "http-compatible",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloud-multimodal" => Ok(ProviderKind::CloudMultimodal),
            "local" => Ok(ProviderKind::Local),
            "http-compatible" => Ok(ProviderKind::OpenAiCompatible),
            other => Err(GatewayError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Shared request/response types ─────────────────────────────────────────────

/// Per-call generation options, resolved by the dispatch facade.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub max_tokens: Option<u32>,
    /// Overrides the configuration's temperature (lowered for structured
    /// generation).
    pub temperature: Option<f32>,
    /// Response schema for backends with a native constrained-output slot.
    /// Text-only backends receive the constraint as an instruction message
    /// instead; they ignore this field.
    pub response_schema: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub finish_reason: String,
    pub usage: Option<ProviderUsage>,
    /// Reasoning trace, for backends that emit one alongside the answer.
    pub reasoning: Option<String>,
}

/// Forward-only chunk stream. Not restartable; dropping it cancels nothing
/// upstream (see DESIGN.md on disconnect propagation).
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

// ── Provider enum ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Provider {
    CloudMultimodal(cloud::CloudMultimodalProvider),
    Local(local::LocalProvider),
    OpenAiCompatible(openai_compatible::OpenAiCompatibleProvider),
}

impl Provider {
    /// One complete answer. `attachments` only reach the multimodal backend;
    /// text-only backends flatten messages and drop images.
    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        attachments: &[AttachmentBatch],
        opts: &RequestOptions,
    ) -> Result<ProviderResponse, GatewayError> {
        match self {
            Provider::CloudMultimodal(p) => p.generate(messages, attachments, opts).await,
            Provider::Local(p) => p.generate(messages, opts).await,
            Provider::OpenAiCompatible(p) => p.generate(messages, opts).await,
        }
    }

    /// Lazy sequence of text chunks. Backends without native streaming
    /// degrade to a single-chunk stream over the complete answer.
    pub async fn stream(
        &self,
        messages: &[ChatMessage],
        attachments: &[AttachmentBatch],
        opts: &RequestOptions,
    ) -> Result<TextStream, GatewayError> {
        match self {
            Provider::CloudMultimodal(p) => p.stream(messages, attachments, opts).await,
            Provider::Local(p) => p.stream(messages, opts).await,
            Provider::OpenAiCompatible(p) => p.stream(messages, opts).await,
        }
    }

    pub async fn list_models(&self) -> Result<Vec<String>, GatewayError> {
        match self {
            Provider::CloudMultimodal(p) => Ok(p.list_models()),
            Provider::Local(p) => Ok(p.list_models().await),
            Provider::OpenAiCompatible(p) => Ok(p.list_models()),
        }
    }

    pub fn model_name(&self) -> &str {
        match self {
            Provider::CloudMultimodal(p) => p.model_name(),
            Provider::Local(p) => p.model_name(),
            Provider::OpenAiCompatible(p) => p.model_name(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::CloudMultimodal(_) => ProviderKind::CloudMultimodal,
            Provider::Local(_) => ProviderKind::Local,
            Provider::OpenAiCompatible(_) => ProviderKind::OpenAiCompatible,
        }
    }
}

/// Construct a [`Provider`] from decrypted configuration settings.
///
/// Settings are the provider-specific JSON record from the configuration
/// surface; each adapter deserializes the fields it understands and fails
/// with `InvalidSettings` on a shape it cannot use.
pub fn build(kind: ProviderKind, settings: &Value) -> Result<Provider, GatewayError> {
    match kind {
        ProviderKind::CloudMultimodal => {
            Ok(Provider::CloudMultimodal(cloud::CloudMultimodalProvider::from_settings(settings)?))
        }
        ProviderKind::Local => Ok(Provider::Local(local::LocalProvider::from_settings(settings)?)),
        ProviderKind::OpenAiCompatible => Ok(Provider::OpenAiCompatible(
            openai_compatible::OpenAiCompatibleProvider::from_settings(settings)?,
        )),
    }
}

/// Build a reqwest client with the per-request timeout adapters use.
pub(crate) fn http_client(timeout_seconds: Option<u64>) -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(
            timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        ))
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in [ProviderKind::CloudMultimodal, ProviderKind::Local, ProviderKind::OpenAiCompatible] {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_unsupported() {
        let err = "bedrock".parse::<ProviderKind>().unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedProvider(_)));
        assert!(err.to_string().contains("bedrock"));
    }

    #[test]
    fn build_selects_adapter_by_kind() {
        let p = build(
            ProviderKind::OpenAiCompatible,
            &json!({ "model": "m1", "baseUrl": "http://localhost:9999" }),
        )
        .unwrap();
        assert_eq!(p.kind(), ProviderKind::OpenAiCompatible);
        assert_eq!(p.model_name(), "m1");
    }

    #[test]
    fn build_rejects_unusable_settings() {
        // cloud requires an apiKey
        assert!(build(ProviderKind::CloudMultimodal, &json!({ "model": "g" })).is_err());
    }
}

//! Dispatch facade: one entry point from "authenticated registration +
//! messages" to a provider response.
//!
//! Responsibilities, in order: resolve the registration's configuration,
//! build the provider, fold the registration's system prompt in, arm the
//! structured-output plan when the prompt calls for it, call the backend,
//! post-process. Structured post-processing is lenient end to end: a reply
//! that is not valid JSON passes through untouched, and validation
//! discrepancies are logged, never rejected.
//!
//! Streaming skips post-processing — chunks are forwarded as they arrive,
//! so there is no complete object to validate or reformat.

use std::sync::Arc;

use tracing::{info, warn};

use crate::chat::{AttachmentBatch, ChatMessage, Role};
use crate::error::GatewayError;
use crate::providers::{self, ProviderKind, ProviderResponse, RequestOptions, TextStream};
use crate::resolver;
use crate::schema::{self, FieldSpec, ValidationReport, STRUCTURED_OUTPUT_CATEGORY};
use crate::store::{ApiRegistration, DbPool, SystemPrompt};
use crate::vault::Vault;

/// Temperature applied to structured generation unless the caller set one.
const STRUCTURED_TEMPERATURE: f32 = 0.2;

#[derive(Clone)]
pub struct Dispatcher {
    pool: DbPool,
    vault: Arc<Vault>,
}

/// A completed dispatch: the provider's answer plus the public model label
/// (the configuration name, never the provider-internal model id).
#[derive(Debug)]
pub struct DispatchOutcome {
    pub response: ProviderResponse,
    pub model: String,
    pub structured_report: Option<ValidationReport>,
}

/// Constrained-generation plan derived from a structured-output prompt.
struct StructuredPlan {
    fields: Vec<FieldSpec>,
}

impl Dispatcher {
    pub fn new(pool: DbPool, vault: Arc<Vault>) -> Self {
        Self { pool, vault }
    }

    /// One complete answer for an authenticated registration.
    pub async fn respond(
        &self,
        registration: &ApiRegistration,
        messages: &[ChatMessage],
        prompt: Option<&SystemPrompt>,
        attachments: &[AttachmentBatch],
        opts: RequestOptions,
    ) -> Result<DispatchOutcome, GatewayError> {
        let (provider, model, messages, opts, plan) =
            self.prepare(registration, messages, prompt, opts)?;

        let mut response = provider.generate(&messages, attachments, &opts).await?;

        let structured_report = match &plan {
            Some(plan) => postprocess_structured(&mut response, &plan.fields),
            None => None,
        };
        info!(
            model = %model,
            finish_reason = %response.finish_reason,
            structured = plan.is_some(),
            "dispatch complete"
        );
        Ok(DispatchOutcome { response, model, structured_report })
    }

    /// Streamed answer. The structured plan still shapes the request
    /// (instruction message, lowered temperature, native schema slot) but
    /// chunks are forwarded unvalidated and unformatted.
    pub async fn respond_stream(
        &self,
        registration: &ApiRegistration,
        messages: &[ChatMessage],
        prompt: Option<&SystemPrompt>,
        attachments: &[AttachmentBatch],
        opts: RequestOptions,
    ) -> Result<(TextStream, String), GatewayError> {
        let (provider, model, messages, opts, _plan) =
            self.prepare(registration, messages, prompt, opts)?;
        let stream = provider.stream(&messages, attachments, &opts).await?;
        Ok((stream, model))
    }

    fn prepare(
        &self,
        registration: &ApiRegistration,
        messages: &[ChatMessage],
        prompt: Option<&SystemPrompt>,
        opts: RequestOptions,
    ) -> Result<
        (providers::Provider, String, Vec<ChatMessage>, RequestOptions, Option<StructuredPlan>),
        GatewayError,
    > {
        let conn = self.pool.get()?;
        let resolved = resolver::resolve(
            &conn,
            &self.vault,
            &registration.user_id,
            Some(&registration.configuration_id),
        )?;
        let provider = providers::build(resolved.kind, &resolved.settings)?;

        let plan = structured_plan(prompt)?;
        let (messages, opts) = shape_request(messages, prompt, opts, resolved.kind, plan.as_ref());

        Ok((provider, resolved.name, messages, opts, plan))
    }
}

/// Parse the structured plan out of a prompt, if it asks for one. A prompt
/// in the structured category with an unreadable field-tree is a
/// configuration mistake, not something to silently skip.
fn structured_plan(prompt: Option<&SystemPrompt>) -> Result<Option<StructuredPlan>, GatewayError> {
    let Some(prompt) = prompt else { return Ok(None) };
    if prompt.category != STRUCTURED_OUTPUT_CATEGORY {
        return Ok(None);
    }
    let Some(raw) = prompt.schema_fields.as_deref() else {
        return Ok(None);
    };
    let fields: Vec<FieldSpec> = serde_json::from_str(raw).map_err(|e| {
        GatewayError::InvalidSettings(format!("prompt '{}' has an unreadable field tree: {e}", prompt.id))
    })?;
    if fields.is_empty() {
        return Ok(None);
    }
    Ok(Some(StructuredPlan { fields }))
}

/// Build the final message list and options: prompt content first as a
/// system message, then the caller's messages, then (for backends without
/// a native schema slot) the schema instruction as a trailing system
/// message.
fn shape_request(
    messages: &[ChatMessage],
    prompt: Option<&SystemPrompt>,
    mut opts: RequestOptions,
    kind: ProviderKind,
    plan: Option<&StructuredPlan>,
) -> (Vec<ChatMessage>, RequestOptions) {
    let mut shaped = Vec::with_capacity(messages.len() + 2);
    if let Some(prompt) = prompt {
        if !prompt.content.is_empty() {
            shaped.push(ChatMessage::text(Role::System, prompt.content.clone()));
        }
    }
    shaped.extend_from_slice(messages);

    if let Some(plan) = plan {
        opts.temperature = opts.temperature.or(Some(STRUCTURED_TEMPERATURE));
        match kind {
            ProviderKind::CloudMultimodal => {
                opts.response_schema = Some(schema::response_schema(&plan.fields));
            }
            ProviderKind::Local | ProviderKind::OpenAiCompatible => {
                shaped.push(ChatMessage::text(
                    Role::System,
                    schema::schema_instruction(&plan.fields),
                ));
            }
        }
    }
    (shaped, opts)
}

/// Parse, validate and reformat a structured reply in place. Returns the
/// validation report when the reply was parseable JSON.
fn postprocess_structured(
    response: &mut ProviderResponse,
    fields: &[FieldSpec],
) -> Option<ValidationReport> {
    let parsed: serde_json::Value = match serde_json::from_str(response.text.trim()) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "structured reply is not valid JSON; passing through verbatim");
            return None;
        }
    };
    let report = schema::validate(&parsed, fields);
    if !report.is_clean() {
        warn!(
            missing = ?report.missing_required_fields,
            unexpected = ?report.unexpected_fields,
            "structured reply deviates from the field tree"
        );
    }
    response.text = schema::format_output(&parsed);
    Some(report)
}

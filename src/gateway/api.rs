//! Handlers for the `/v1/{registration_id}/*` routes.
//!
//! The chat handler owns the whole request lifecycle: bearer
//! authentication, body validation, dispatch, envelope construction, and
//! the unconditional metric write. Errors map to exactly three statuses
//! (401 / 400 / 500) with the standard `{"error": {...}}` envelope; the
//! metric row is written either way, and a failed write is logged and
//! swallowed rather than failing the request.

use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;
use uuid::Uuid;

use super::GatewayState;
use crate::chat::{AttachmentBatch, ChatMessage, InlineFile};
use crate::error::GatewayError;
use crate::metrics::{self, ApiCallMetric, TimeWindow};
use crate::providers::{ProviderUsage, RequestOptions, TextStream};
use crate::store::{self, ApiRegistration, SystemPrompt};

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatCallRequest {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    files: Option<Vec<WireFile>>,
}

/// One stateless upload in the chat body. `data` is base64 (bare or a
/// data URL); `contentKey` optionally pins the file to a specific message.
#[derive(Deserialize)]
struct WireFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default)]
    media_type: Option<String>,
    data: String,
    #[serde(rename = "contentKey", default)]
    content_key: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct WindowQuery {
    window: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct RecentQuery {
    window: Option<String>,
    limit: Option<u32>,
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn error_response(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "error": {
            "message": err.to_string(),
            "type": err.error_type(),
            "code": err.code(),
        }
    });
    (status, Json(body)).into_response()
}

/// Extract the bearer key from the Authorization header.
fn bearer_key(headers: &HeaderMap) -> Result<String, GatewayError> {
    let value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::Authentication("missing Authorization header".into()))?;
    value
        .strip_prefix("Bearer ")
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| GatewayError::Authentication("expected a bearer key".into()))
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .filter(|v| !v.is_empty())
}

/// Authenticate the call: id and key must both match an active
/// registration. A miss is one indistinguishable 401.
fn authenticate(
    state: &GatewayState,
    registration_id: &str,
    headers: &HeaderMap,
) -> Result<ApiRegistration, GatewayError> {
    let key = bearer_key(headers)?;
    let conn = state.pool.get()?;
    store::find_active_registration(&conn, registration_id, &key)?
        .ok_or_else(|| GatewayError::Authentication("invalid registration id or key".into()))
}

/// Write the metric row for a finished call; never fails the request.
fn record_metric(state: &GatewayState, metric: ApiCallMetric) {
    let result = state.pool.get().map_err(GatewayError::from).and_then(|conn| {
        metrics::record(&conn, &metric)
    });
    if let Err(e) = result {
        warn!(registration = %metric.registration_id, error = %e, "metric write failed");
    }
}

fn load_prompt(
    state: &GatewayState,
    registration: &ApiRegistration,
) -> Result<Option<SystemPrompt>, GatewayError> {
    let Some(prompt_id) = registration.system_prompt_id.as_deref() else {
        return Ok(None);
    };
    let conn = state.pool.get()?;
    store::get_prompt(&conn, prompt_id)
}

/// Group uploads into attachment batches, one per target content-key.
fn attachment_batches(files: Vec<WireFile>) -> Result<Vec<AttachmentBatch>, GatewayError> {
    let mut batches: Vec<AttachmentBatch> = Vec::new();
    for file in files {
        let (data, decoded_media) = crate::chat::decode_data_url(&file.data)?;
        let inline = InlineFile {
            name: file.name.unwrap_or_default(),
            media_type: file.media_type.unwrap_or(decoded_media),
            data,
        };
        match batches.iter_mut().find(|b| b.content_key == file.content_key) {
            Some(batch) => batch.files.push(inline),
            None => batches.push(AttachmentBatch {
                content_key: file.content_key,
                files: vec![inline],
            }),
        }
    }
    Ok(batches)
}

fn completion_envelope(
    id: &str,
    created: i64,
    model: &str,
    text: &str,
    finish_reason: &str,
    usage: Option<ProviderUsage>,
) -> Value {
    let usage = usage.unwrap_or_default();
    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        }
    })
}

fn chunk_envelope(id: &str, created: i64, model: &str, delta: Value, finish: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }]
    })
}

// ── Chat ──────────────────────────────────────────────────────────────────────

/// POST /v1/{registration_id}/chat
pub(super) async fn chat(
    State(state): State<GatewayState>,
    Path(registration_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let request_size = body.len() as u64;
    let client_ip = client_ip(&headers);
    let user_agent = user_agent(&headers);

    let metric = {
        let registration_id = registration_id.clone();
        move |status: u16, response_size: u64, error: Option<String>| ApiCallMetric {
            registration_id: registration_id.clone(),
            timestamp: store::now(),
            method: "POST".into(),
            endpoint: "/chat".into(),
            response_time_ms: started.elapsed().as_millis() as u64,
            status_code: status,
            request_size,
            response_size,
            error_message: error,
            user_agent: user_agent.clone(),
            client_ip: client_ip.clone(),
        }
    };

    match handle_chat(&state, &registration_id, &headers, &body).await {
        Ok(ChatReply::Complete(envelope)) => {
            let text = envelope.to_string();
            record_metric(&state, metric(200, text.len() as u64, None));
            (StatusCode::OK, [(CONTENT_TYPE, "application/json")], text).into_response()
        }
        Ok(ChatReply::Stream { stream, model }) => {
            stream_response(state, stream, model, metric)
        }
        Err(e) => {
            warn!(registration = %registration_id, error = %e, "chat call failed");
            record_metric(&state, metric(e.http_status(), 0, Some(e.to_string())));
            error_response(&e)
        }
    }
}

enum ChatReply {
    Complete(Value),
    Stream { stream: TextStream, model: String },
}

async fn handle_chat(
    state: &GatewayState,
    registration_id: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<ChatReply, GatewayError> {
    let registration = authenticate(state, registration_id, headers)?;

    let request: ChatCallRequest = serde_json::from_slice(body.as_ref())
        .map_err(|e| GatewayError::Validation(format!("request body is not valid JSON: {e}")))?;
    if request.messages.is_empty() {
        return Err(GatewayError::Validation("messages must not be empty".into()));
    }

    let attachments = attachment_batches(request.files.unwrap_or_default())?;
    let prompt = load_prompt(state, &registration)?;
    let opts = RequestOptions {
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        response_schema: None,
    };

    if request.stream {
        let (stream, model) = state
            .dispatcher
            .respond_stream(&registration, &request.messages, prompt.as_ref(), &attachments, opts)
            .await?;
        return Ok(ChatReply::Stream { stream, model });
    }

    let outcome = state
        .dispatcher
        .respond(&registration, &request.messages, prompt.as_ref(), &attachments, opts)
        .await?;
    let envelope = completion_envelope(
        &format!("chatcmpl-{}", Uuid::new_v4().simple()),
        chrono::Utc::now().timestamp(),
        &outcome.model,
        &outcome.response.text,
        &outcome.response.finish_reason,
        outcome.response.usage,
    );
    Ok(ChatReply::Complete(envelope))
}

/// Relay a provider stream as server-sent chunk events. The relay task owns
/// the end-of-stream metric write, so disconnects and upstream failures are
/// still recorded.
fn stream_response(
    state: GatewayState,
    mut stream: TextStream,
    model: String,
    metric: impl Fn(u16, u64, Option<String>) -> ApiCallMetric + Send + 'static,
) -> Response {
    let id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = chrono::Utc::now().timestamp();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<String, std::io::Error>>();

    tokio::spawn(async move {
        use futures_util::StreamExt;
        let mut sent: u64 = 0;
        let mut failure: Option<String> = None;

        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    let event = chunk_envelope(&id, created, &model, json!({ "content": chunk }), None);
                    let frame = format!("data: {event}\n\n");
                    sent += frame.len() as u64;
                    if tx.send(Ok(frame)).is_err() {
                        // client went away; keep draining for the metric
                        failure.get_or_insert_with(|| "client disconnected".into());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "stream failed mid-flight");
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        let finish = chunk_envelope(&id, created, &model, json!({}), Some("stop"));
        let _ = tx.send(Ok(format!("data: {finish}\n\n")));
        let _ = tx.send(Ok("data: [DONE]\n\n".to_string()));

        let status = if failure.is_some() { 500 } else { 200 };
        record_metric(&state, metric(status, sent, failure));
    });

    let body = Body::from_stream(UnboundedReceiverStream::new(rx));
    (StatusCode::OK, [(CONTENT_TYPE, "text/event-stream")], body).into_response()
}

// ── Info ──────────────────────────────────────────────────────────────────────

/// GET /v1/{registration_id}/info
pub(super) async fn info(
    State(state): State<GatewayState>,
    Path(registration_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let result = (|| {
        let registration = authenticate(&state, &registration_id, &headers)?;
        let conn = state.pool.get()?;
        let config = store::get_configuration(&conn, &registration.configuration_id)?;
        let prompt = match registration.system_prompt_id.as_deref() {
            Some(id) => store::get_prompt(&conn, id)?,
            None => None,
        };
        Ok::<_, GatewayError>(json!({
            "id": registration.id,
            "name": registration.name,
            "description": registration.description,
            "active": registration.active,
            "model": config.as_ref().map(|c| c.name.clone()),
            "provider": config.as_ref().map(|c| c.kind.as_str()),
            "systemPrompt": prompt.map(|p| json!({
                "title": p.title,
                "category": p.category,
            })),
            "apiKey": store::masked_api_key(&registration.api_key),
            "createdAt": registration.created_at,
        }))
    })();
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Metrics ───────────────────────────────────────────────────────────────────

/// GET /v1/{registration_id}/metrics/summary
pub(super) async fn metrics_summary(
    State(state): State<GatewayState>,
    Path(registration_id): Path<String>,
    Query(query): Query<WindowQuery>,
    headers: HeaderMap,
) -> Response {
    let result = (|| {
        authenticate(&state, &registration_id, &headers)?;
        let conn = state.pool.get()?;
        let window = TimeWindow::from_query(query.window.as_deref());
        metrics::summarize(&conn, &registration_id, window)
    })();
    match result {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /v1/{registration_id}/metrics/timeseries
pub(super) async fn metrics_timeseries(
    State(state): State<GatewayState>,
    Path(registration_id): Path<String>,
    Query(query): Query<WindowQuery>,
    headers: HeaderMap,
) -> Response {
    let result = (|| {
        authenticate(&state, &registration_id, &headers)?;
        let conn = state.pool.get()?;
        let window = TimeWindow::from_query(query.window.as_deref());
        metrics::time_series(&conn, &registration_id, window)
    })();
    match result {
        Ok(buckets) => (StatusCode::OK, Json(json!({ "buckets": buckets }))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /v1/{registration_id}/metrics/recent
pub(super) async fn metrics_recent(
    State(state): State<GatewayState>,
    Path(registration_id): Path<String>,
    Query(query): Query<RecentQuery>,
    headers: HeaderMap,
) -> Response {
    // window accepted for interface symmetry; recent calls are limit-bound
    let _ = query.window;
    let result = (|| {
        authenticate(&state, &registration_id, &headers)?;
        let conn = state.pool.get()?;
        metrics::recent_calls(&conn, &registration_id, query.limit)
    })();
    match result {
        Ok(calls) => (StatusCode::OK, Json(json!({ "calls": calls }))).into_response(),
        Err(e) => error_response(&e),
    }
}

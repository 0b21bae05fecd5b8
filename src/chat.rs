//! Conversation model and message normalizer.
//!
//! Inbound messages arrive provider-agnostic: `content` is either a plain
//! string or an ordered list of typed parts (text / data-URL image). Two
//! conversions produce provider-ready shapes:
//!
//! - [`to_text_only`] — flatten every message to its concatenated text
//!   parts, dropping images. For providers without multimodal support.
//! - [`to_multimodal`] — decode image parts to binary + media type and
//!   append attachment batches as extra image parts onto the most recent
//!   user-role message.
//!
//! Attachment batches are associated to a message by a derived content-key
//! (SHA-256 of the serialized content) with a last-user-message fallback.
//! There is no message-id correlation in the wire format, so distinct
//! messages with identical content collide on the key. Known limitation of
//! the wire contract, kept as-is.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::GatewayError;

/// Media type used when an image carries no data-URL prefix.
const DEFAULT_IMAGE_MEDIA_TYPE: &str = "image/png";

// ── Inbound model ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Content,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: Content::Text(content.into()) }
    }
}

/// Plain text, or an ordered list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One typed content part, in the common chat-completion wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// Either a `data:<media>;base64,<payload>` URL or bare base64.
    pub url: String,
}

/// A decoded stateless upload (`files` array of the proxy chat call).
#[derive(Debug, Clone)]
pub struct InlineFile {
    pub name: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

/// A batch of attachments bound for one message. `content_key` is the
/// derived key of the target message; `None` targets the most recent
/// user-role message.
#[derive(Debug, Clone, Default)]
pub struct AttachmentBatch {
    pub content_key: Option<String>,
    pub files: Vec<InlineFile>,
}

// ── Provider-ready shapes ─────────────────────────────────────────────────────

/// Text-only provider message. `content` is the concatenation of the
/// message's text parts; images are dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultimodalMessage {
    pub role: Role,
    pub content: MultimodalContent,
}

/// Collapses to a bare string when the message is a single text part.
#[derive(Debug, Clone, PartialEq)]
pub enum MultimodalContent {
    Text(String),
    Parts(Vec<MultimodalPart>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MultimodalPart {
    Text(String),
    Image { data: Vec<u8>, media_type: String },
}

// ── Conversions ───────────────────────────────────────────────────────────────

/// Flatten each message to its text parts. Pure; images are dropped.
pub fn to_text_only(messages: &[ChatMessage]) -> Vec<TextMessage> {
    messages
        .iter()
        .map(|m| TextMessage { role: m.role, content: flatten_text(&m.content) })
        .collect()
}

fn flatten_text(content: &Content) -> String {
    match content {
        Content::Text(s) => s.clone(),
        Content::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .concat(),
    }
}

/// Convert messages to the multimodal provider shape and fold attachment
/// batches in as extra image parts on the targeted user message.
pub fn to_multimodal(
    messages: &[ChatMessage],
    attachments: &[AttachmentBatch],
) -> Result<Vec<MultimodalMessage>, GatewayError> {
    let mut parts_per_message: Vec<(Role, Vec<MultimodalPart>)> = messages
        .iter()
        .map(|m| Ok((m.role, decode_parts(&m.content)?)))
        .collect::<Result<_, GatewayError>>()?;

    for batch in attachments {
        if batch.files.is_empty() {
            continue;
        }
        let target = batch
            .content_key
            .as_deref()
            .and_then(|key| {
                messages
                    .iter()
                    .rposition(|m| m.role == Role::User && content_key(m) == key)
            })
            .or_else(|| messages.iter().rposition(|m| m.role == Role::User));
        let Some(idx) = target else {
            // No user message to attach to; the batch is dropped.
            continue;
        };
        for file in &batch.files {
            parts_per_message[idx].1.push(MultimodalPart::Image {
                data: file.data.clone(),
                media_type: file.media_type.clone(),
            });
        }
    }

    Ok(parts_per_message
        .into_iter()
        .map(|(role, parts)| MultimodalMessage { role, content: collapse(parts) })
        .collect())
}

fn decode_parts(content: &Content) -> Result<Vec<MultimodalPart>, GatewayError> {
    match content {
        Content::Text(s) => Ok(vec![MultimodalPart::Text(s.clone())]),
        Content::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => Ok(MultimodalPart::Text(text.clone())),
                ContentPart::ImageUrl { image_url } => {
                    let (data, media_type) = decode_data_url(&image_url.url)?;
                    Ok(MultimodalPart::Image { data, media_type })
                }
            })
            .collect(),
    }
}

fn collapse(mut parts: Vec<MultimodalPart>) -> MultimodalContent {
    if parts.len() == 1 {
        if let MultimodalPart::Text(_) = parts[0] {
            match parts.remove(0) {
                MultimodalPart::Text(s) => return MultimodalContent::Text(s),
                MultimodalPart::Image { .. } => unreachable!(),
            }
        }
    }
    MultimodalContent::Parts(parts)
}

/// Strip a `data:<media>;base64,` prefix and decode. Bare base64 gets the
/// default image media type.
pub fn decode_data_url(url: &str) -> Result<(Vec<u8>, String), GatewayError> {
    let (media_type, payload) = match url.strip_prefix("data:") {
        Some(rest) => match rest.split_once(";base64,") {
            Some((media, payload)) => {
                let media = if media.is_empty() { DEFAULT_IMAGE_MEDIA_TYPE } else { media };
                (media.to_string(), payload)
            }
            None => {
                return Err(GatewayError::Validation(
                    "data URL is not base64-encoded".into(),
                ))
            }
        },
        None => (DEFAULT_IMAGE_MEDIA_TYPE.to_string(), url),
    };
    let data = BASE64
        .decode(payload.trim())
        .map_err(|e| GatewayError::Validation(format!("invalid base64 image data: {e}")))?;
    Ok((data, media_type))
}

/// Derived association key: lowercase hex SHA-256 of the serialized content.
pub fn content_key(message: &ChatMessage) -> String {
    let serialized = serde_json::to_string(&message.content).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn img_part(url: &str) -> ContentPart {
        ContentPart::ImageUrl { image_url: ImageUrl { url: url.to_string() } }
    }

    #[test]
    fn wire_content_accepts_string_and_parts() {
        let m: ChatMessage = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(m.content, Content::Text("hi".into()));

        let m: ChatMessage = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"text","text":"look"},{"type":"image_url","image_url":{"url":"data:image/png;base64,aGk="}}]}"#,
        )
        .unwrap();
        match &m.content {
            Content::Parts(parts) => assert_eq!(parts.len(), 2),
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[test]
    fn text_only_drops_images_entirely() {
        let msg = ChatMessage {
            role: Role::User,
            content: Content::Parts(vec![
                ContentPart::Text { text: "describe this".into() },
                img_part(&format!("data:image/png;base64,{}", BASE64.encode(vec![0u8; 4096]))),
            ]),
        };
        let flat = to_text_only(&[msg]);
        assert_eq!(flat[0].content, "describe this");
    }

    #[test]
    fn text_only_concatenates_parts() {
        let msg = ChatMessage {
            role: Role::Assistant,
            content: Content::Parts(vec![
                ContentPart::Text { text: "a".into() },
                ContentPart::Text { text: "b".into() },
            ]),
        };
        assert_eq!(to_text_only(&[msg])[0].content, "ab");
    }

    #[test]
    fn data_url_prefix_is_stripped_and_sniffed() {
        let (data, media) = decode_data_url("data:image/jpeg;base64,aGVsbG8=").unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(media, "image/jpeg");
    }

    #[test]
    fn bare_base64_gets_default_media_type() {
        let (data, media) = decode_data_url("aGVsbG8=").unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(media, DEFAULT_IMAGE_MEDIA_TYPE);
    }

    #[test]
    fn bad_base64_is_a_validation_error() {
        assert!(matches!(
            decode_data_url("data:image/png;base64,@@@@"),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn multimodal_collapses_single_text_part() {
        let out = to_multimodal(&[ChatMessage::text(Role::User, "hi")], &[]).unwrap();
        assert_eq!(out[0].content, MultimodalContent::Text("hi".into()));
    }

    #[test]
    fn attachments_land_on_last_user_message() {
        let messages = vec![
            ChatMessage::text(Role::User, "first"),
            ChatMessage::text(Role::Assistant, "reply"),
            ChatMessage::text(Role::User, "second"),
        ];
        let batch = AttachmentBatch {
            content_key: None,
            files: vec![InlineFile {
                name: "pic.png".into(),
                media_type: "image/png".into(),
                data: vec![1, 2, 3],
            }],
        };
        let out = to_multimodal(&messages, &[batch]).unwrap();
        match &out[2].content {
            MultimodalContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[1], MultimodalPart::Image { .. }));
            }
            other => panic!("expected parts on last user message, got {other:?}"),
        }
        // assistant message untouched
        assert_eq!(out[1].content, MultimodalContent::Text("reply".into()));
    }

    #[test]
    fn content_key_routes_batch_to_matching_message() {
        let messages = vec![
            ChatMessage::text(Role::User, "alpha"),
            ChatMessage::text(Role::User, "beta"),
        ];
        let key = content_key(&messages[0]);
        let batch = AttachmentBatch {
            content_key: Some(key),
            files: vec![InlineFile { name: "f".into(), media_type: "image/png".into(), data: vec![9] }],
        };
        let out = to_multimodal(&messages, &[batch]).unwrap();
        assert!(matches!(out[0].content, MultimodalContent::Parts(_)));
        assert_eq!(out[1].content, MultimodalContent::Text("beta".into()));
    }

    #[test]
    fn identical_content_collides_on_last_occurrence() {
        // Known wire-contract limitation: same text, same key — the later
        // message wins.
        let messages = vec![
            ChatMessage::text(Role::User, "same"),
            ChatMessage::text(Role::User, "same"),
        ];
        let batch = AttachmentBatch {
            content_key: Some(content_key(&messages[0])),
            files: vec![InlineFile { name: "f".into(), media_type: "image/png".into(), data: vec![9] }],
        };
        let out = to_multimodal(&messages, &[batch]).unwrap();
        assert_eq!(out[0].content, MultimodalContent::Text("same".into()));
        assert!(matches!(out[1].content, MultimodalContent::Parts(_)));
    }

    #[test]
    fn batch_without_user_message_is_dropped() {
        let messages = vec![ChatMessage::text(Role::System, "rules")];
        let batch = AttachmentBatch {
            content_key: None,
            files: vec![InlineFile { name: "f".into(), media_type: "image/png".into(), data: vec![9] }],
        };
        let out = to_multimodal(&messages, &[batch]).unwrap();
        assert_eq!(out[0].content, MultimodalContent::Text("rules".into()));
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Unique identifier of a single message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Allocates a fresh random identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Author of a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The system prompt supplied by a persona.
    System,

    /// The human side of the conversation.
    User,

    /// The model side of the conversation.
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => f.write_str("system"),
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

/// Location of an image attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// An `https://` URL or a `data:` URL carrying base64 content.
    pub url: String,

    /// Optional fidelity hint forwarded to the provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A document attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    /// Display name of the document.
    pub filename: String,

    /// The document as a base64 `data:` URL.
    pub file_data: String,
}

/// One part of a structured message.
///
/// The wire shape matches the chat-completions content-part format so parts are forwarded to
/// the provider untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },

    /// An image reference.
    ImageUrl {
        /// Where the image lives.
        image_url: ImageUrl,
    },

    /// An attached document.
    File {
        /// The document payload.
        file: FileData,
    },
}

impl ContentPart {
    /// Creates a text part.
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Creates an image part from a URL.
    pub fn image_url(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: None,
            },
        }
    }

    /// Creates an image part by inlining raw bytes as a base64 data URL.
    pub fn image_from_bytes(media_type: &str, bytes: &[u8]) -> Self {
        Self::image_url(data_url(media_type, bytes))
    }

    /// Creates a document part by inlining raw bytes as a base64 data URL.
    pub fn document_from_bytes(filename: impl Into<String>, media_type: &str, bytes: &[u8]) -> Self {
        ContentPart::File {
            file: FileData {
                filename: filename.into(),
                file_data: data_url(media_type, bytes),
            },
        }
    }
}

fn data_url(media_type: &str, bytes: &[u8]) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{media_type};base64,{encoded}")
}

/// The content of a message: a bare string or a list of parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content.
    Text(String),

    /// Structured text/image/document parts.
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Returns the concatenated text of this content, ignoring attachments.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Returns true when there is neither text nor any attachment.
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.trim().is_empty(),
            MessageContent::Parts(parts) => parts.iter().all(|part| match part {
                ContentPart::Text { text } => text.trim().is_empty(),
                _ => false,
            }),
        }
    }

    /// Combines text with attachments, collapsing to plain text when there are none.
    pub fn with_attachments(text: impl Into<String>, attachments: Vec<ContentPart>) -> Self {
        let text = text.into();
        if attachments.is_empty() {
            return MessageContent::Text(text);
        }
        let mut parts = Vec::with_capacity(attachments.len() + 1);
        if !text.is_empty() {
            parts.push(ContentPart::text(text));
        }
        parts.extend(attachments);
        MessageContent::Parts(parts)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<Vec<ContentPart>> for MessageContent {
    fn from(parts: Vec<ContentPart>) -> Self {
        MessageContent::Parts(parts)
    }
}

/// A single immutable entry in a conversation's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    #[serde(default)]
    pub id: MessageId,

    /// Author of the message.
    pub role: Role,

    /// Message body.
    pub content: MessageContent,

    /// When the message was appended.
    #[serde(
        rename = "createdAt",
        with = "crate::utils::time",
        default = "crate::utils::time::now"
    )]
    pub created_at: OffsetDateTime,
}

impl Message {
    /// Creates a message stamped with the current time.
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            created_at: crate::utils::time::now(),
        }
    }

    /// Creates a system message.
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates a user message.
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates an assistant message.
    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

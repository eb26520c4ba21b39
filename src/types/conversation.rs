use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::{Message, Persona, Role};

/// Number of words of the first user message that become the conversation title.
pub const TITLE_WORDS: usize = 4;

/// Unique identifier of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Allocates a fresh random identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything about a conversation except its messages.
///
/// This is what the persisted chat list holds; messages live under a per-conversation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMeta {
    /// Unique conversation id.
    pub id: ConversationId,

    /// Display title.
    pub title: String,

    /// The persona this conversation was started with.
    pub persona: Persona,

    /// When the conversation was created.
    #[serde(rename = "createdAt", with = "crate::utils::time")]
    pub created_at: OffsetDateTime,

    /// When the conversation last changed.
    #[serde(rename = "updatedAt", with = "crate::utils::time")]
    pub updated_at: OffsetDateTime,
}

/// One independent message thread.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    /// Unique conversation id.
    pub id: ConversationId,

    /// Display title; starts as the persona name.
    pub title: String,

    /// The persona this conversation was started with.
    pub persona: Persona,

    /// When the conversation was created.
    pub created_at: OffsetDateTime,

    /// When a message was last appended or the title last changed.
    pub updated_at: OffsetDateTime,

    /// Committed history, oldest first.
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Creates an empty conversation titled after its persona.
    pub fn new(persona: Persona) -> Self {
        let now = crate::utils::time::now();
        Self {
            id: ConversationId::new(),
            title: persona.name.clone(),
            persona,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Reassembles a conversation from its persisted halves.
    pub fn from_parts(meta: ConversationMeta, messages: Vec<Message>) -> Self {
        Self {
            id: meta.id,
            title: meta.title,
            persona: meta.persona,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
            messages,
        }
    }

    /// Returns the persisted metadata for this conversation.
    pub fn meta(&self) -> ConversationMeta {
        ConversationMeta {
            id: self.id.clone(),
            title: self.title.clone(),
            persona: self.persona.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Returns true while the title is still the persona's name.
    pub fn has_default_title(&self) -> bool {
        self.title == self.persona.name
    }

    /// Appends a message to the history.
    ///
    /// When the history goes from empty to non-empty with a user message and the title is
    /// still the default, the title is derived from that message. This happens at most once
    /// per conversation.
    pub fn append(&mut self, message: Message) {
        if self.messages.is_empty()
            && message.role == Role::User
            && self.has_default_title()
            && let Some(title) = derive_title(&message.content.text())
        {
            self.title = title;
        }
        self.messages.push(message);
        self.touch();
    }

    /// Overrides the title.
    pub fn rename(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.touch();
    }

    /// Returns the last message, if any.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    fn touch(&mut self) {
        let now = crate::utils::time::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// Derives a short title from the first words of `text`.
///
/// Returns `None` when the text has no words (e.g. an image-only message).
pub fn derive_title(text: &str) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().take(TITLE_WORDS).collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

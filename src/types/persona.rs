use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the persona every fresh installation starts with.
pub const DEFAULT_PERSONA_NAME: &str = "ChatGPT";

/// System prompt of the default persona.
pub const DEFAULT_PERSONA_PROMPT: &str =
    "You are an AI assistant that helps people find information.";

const DEFAULT_PERSONA_ID: &str = "chatgpt";

/// Unique identifier of a persona.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonaId(String);

impl PersonaId {
    /// Allocates a fresh random identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The identifier of the built-in default persona.
    pub fn default_persona() -> Self {
        Self(DEFAULT_PERSONA_ID.to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PersonaId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for PersonaId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for PersonaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named system-prompt preset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    /// Unique persona id.
    #[serde(default)]
    pub id: PersonaId,

    /// Display name; also the default title of conversations using this persona.
    pub name: String,

    /// The system prompt prepended to every request.
    #[serde(default)]
    pub prompt: String,
}

impl Persona {
    /// Creates a persona with a fresh id.
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: PersonaId::new(),
            name: name.into(),
            prompt: prompt.into(),
        }
    }

    /// Returns true if this is the built-in default persona.
    pub fn is_default(&self) -> bool {
        self.id == PersonaId::default_persona()
    }

    /// Returns true if the persona has a usable system prompt.
    pub fn has_prompt(&self) -> bool {
        !self.prompt.trim().is_empty()
    }
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            id: PersonaId::default_persona(),
            name: DEFAULT_PERSONA_NAME.to_string(),
            prompt: DEFAULT_PERSONA_PROMPT.to_string(),
        }
    }
}

//! Wire types of the OpenAI-compatible chat-completions streaming API.

use serde::{Deserialize, Serialize};

use crate::types::{Message, MessageContent, Role};

/// A message in the provider's request format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionMessage {
    /// Author of the message.
    pub role: Role,

    /// Text or content parts, forwarded as-is.
    pub content: MessageContent,
}

impl From<&Message> for CompletionMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Request body for a streaming chat completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    /// Model name; omitted for Azure, where the deployment selects the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// The full message list including the system prompt.
    pub messages: Vec<CompletionMessage>,

    /// Always `true`.
    pub stream: bool,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Cap on generated tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// One `data:` payload of the streaming response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    /// Candidate deltas; some providers send frames with none.
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,

    /// Present when the provider reports a failure inside the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ChunkError>,
}

impl CompletionChunk {
    /// Builds a chunk carrying a single text delta.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta: ChunkDelta {
                    content: Some(content.into()),
                },
                finish_reason: None,
            }],
            error: None,
        }
    }

    /// Returns the delta text of the first choice, if any.
    pub fn delta_text(&self) -> Option<&str> {
        self.choices.first()?.delta.content.as_deref()
    }
}

/// One choice in a streaming chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Incremental content.
    #[serde(default)]
    pub delta: ChunkDelta,

    /// Why generation stopped, on the final chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Incremental content of a choice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Text to append.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Error object embedded in a stream frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkError {
    /// Provider's error message.
    #[serde(default)]
    pub message: Option<String>,

    /// Provider's error category.
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_extracts_delta() {
        let chunk: CompletionChunk =
            serde_json::from_value(json!({"id": "x", "choices": [{"delta": {"content": "Hi"}}]}))
                .unwrap();
        assert_eq!(chunk.delta_text(), Some("Hi"));
    }

    #[test]
    fn role_only_and_empty_chunks_have_no_text() {
        let role_only: CompletionChunk =
            serde_json::from_value(json!({"choices": [{"delta": {"role": "assistant"}}]}))
                .unwrap();
        assert_eq!(role_only.delta_text(), None);

        let filtered: CompletionChunk =
            serde_json::from_value(json!({"choices": [], "prompt_filter_results": []})).unwrap();
        assert_eq!(filtered.delta_text(), None);
    }

    #[test]
    fn request_omits_unset_fields() {
        let request = CompletionRequest {
            model: None,
            messages: vec![CompletionMessage::from(&Message::system("sys"))],
            stream: true,
            temperature: None,
            max_tokens: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"messages": [{"role": "system", "content": "sys"}], "stream": true})
        );
    }

    #[test]
    fn text_chunk_serializes_compactly() {
        assert_eq!(
            serde_json::to_value(CompletionChunk::text("Hi")).unwrap(),
            json!({"choices": [{"delta": {"content": "Hi"}}]})
        );
    }
}

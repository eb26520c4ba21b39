use serde::{Deserialize, Serialize};

use crate::types::{Message, MessageContent};

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The persona's system prompt.
    pub prompt: String,

    /// Prior history, oldest first, excluding the new input.
    #[serde(default)]
    pub messages: Vec<Message>,

    /// The new user input.
    pub input: MessageContent,
}

impl ChatRequest {
    /// Creates a request from its three parts.
    pub fn new(
        prompt: impl Into<String>,
        messages: Vec<Message>,
        input: impl Into<MessageContent>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            messages,
            input: input.into(),
        }
    }

    /// Builds the message list sent to the provider:
    /// `[system: prompt, ...messages, user: input]`.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() + 2);
        messages.push(Message::system(self.prompt.clone()));
        messages.extend(self.messages.iter().cloned());
        messages.push(Message::user(self.input.clone()));
        messages
    }
}

/// JSON error body returned by the proxy on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Always `false`.
    pub success: bool,

    /// Human-readable error message, suitable for a toast.
    pub error: String,
}

impl ErrorBody {
    /// Creates a failure body.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use serde_json::json;

    #[test]
    fn to_messages_wraps_history() {
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        let request = ChatRequest::new("be brief", history.clone(), "bye");
        let messages = request.to_messages();

        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(messages[0].content.text(), "be brief");
        assert_eq!(messages[3].content.text(), "bye");
        assert_eq!(request.messages, history);
    }

    #[test]
    fn accepts_minimal_browser_payload() {
        let request: ChatRequest = serde_json::from_value(json!({
            "prompt": "You are helpful.",
            "messages": [{"role": "user", "content": "hi"}, {"role": "assistant", "content": "yo"}],
            "input": [{"type": "text", "text": "and now?"}]
        }))
        .unwrap();
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.input.text(), "and now?");
    }

    #[test]
    fn error_body_shape() {
        assert_eq!(
            serde_json::to_value(ErrorBody::new("boom")).unwrap(),
            json!({"success": false, "error": "boom"})
        );
    }
}

// Public modules
pub mod chat_request;
pub mod completion;
pub mod conversation;
pub mod message;
pub mod persona;

// Re-exports
pub use chat_request::{ChatRequest, ErrorBody};
pub use completion::{
    ChunkChoice, ChunkDelta, ChunkError, CompletionChunk, CompletionMessage, CompletionRequest,
};
pub use conversation::{Conversation, ConversationId, ConversationMeta, TITLE_WORDS, derive_title};
pub use message::{ContentPart, FileData, ImageUrl, Message, MessageContent, MessageId, Role};
pub use persona::{DEFAULT_PERSONA_NAME, DEFAULT_PERSONA_PROMPT, Persona, PersonaId};

// Public modules
pub mod assembler;
pub mod chat;
pub mod client;
pub mod error;
pub mod observability;
pub mod personas;
pub mod provider;
pub mod server;
pub mod sse;
pub mod storage;
pub mod store;
pub mod types;
pub mod utf8;
pub mod utils;

// Re-exports
pub use assembler::MessageAssembler;
pub use client::{ChatClient, ChatTransport};
pub use error::{Error, Result};
pub use observability::register_biometrics;
pub use personas::PersonaRegistry;
pub use provider::{Provider, ProviderConfig, ProviderKind};
pub use sse::{DeltaStream, Framing, StreamEvent, StreamParser, process_stream};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use store::{ChatStore, Notice, StoreConfig, StreamHandle, StreamOutcome, VisibleConversation};
pub use types::*;

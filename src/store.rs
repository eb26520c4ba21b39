//! The session store: many conversations, each with its own history and stream state.
//!
//! All mutations go through one async mutex. Every stream runs in its own task keyed by the
//! conversation id it was started for; a driver never consults "the current conversation", so
//! switching, creating or deleting other conversations never redirects its output.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::assembler::{FRAME_INTERVAL, MessageAssembler};
use crate::client::{ChatClient, ChatTransport};
use crate::error::{Error, Result};
use crate::observability::{
    STORE_CANCELLATIONS, STORE_COMMITS, STORE_INTERRUPTIONS, STORE_STREAM_DURATION,
};
use crate::personas::PersonaRegistry;
use crate::sse::StreamEvent;
use crate::storage::{
    CHAT_LIST_KEY, CURRENT_CHAT_KEY, PERSONAS_KEY, Storage, load_json, messages_key, save_json,
};
use crate::types::{
    ChatRequest, Conversation, ConversationId, ConversationMeta, Message, MessageContent, Persona,
    PersonaId, Role,
};

/// Settings of a [`ChatStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How often in-flight text is published to subscribers.
    pub frame_interval: Duration,

    /// Personas added on load unless one with the same name exists.
    pub seed_personas: Vec<Persona>,
}

impl StoreConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            frame_interval: FRAME_INTERVAL,
            seed_personas: Vec::new(),
        }
    }

    /// Sets the publish interval.
    pub fn with_frame_interval(mut self, frame_interval: Duration) -> Self {
        self.frame_interval = frame_interval;
        self
    }

    /// Sets the personas to seed on load.
    pub fn with_seed_personas(mut self, seed_personas: Vec<Persona>) -> Self {
        self.seed_personas = seed_personas;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How a stream ended.
#[derive(Debug, Clone)]
pub enum StreamOutcome {
    /// The reply completed and was appended to its conversation.
    Committed(Message),

    /// The reply completed without any text; nothing was appended.
    Empty,

    /// The stream was stopped, or its conversation deleted, before it completed.
    Cancelled,

    /// The request or the stream failed; a notice was published.
    Errored(Error),
}

impl StreamOutcome {
    /// Returns the committed message, if any.
    pub fn message(&self) -> Option<&Message> {
        match self {
            StreamOutcome::Committed(message) => Some(message),
            _ => None,
        }
    }
}

/// A user-facing notification about a failed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The stream broke after it started; the partial reply was discarded.
    Interrupted {
        /// Conversation the stream belonged to.
        conversation: ConversationId,
        /// What went wrong.
        message: String,
    },

    /// The request was rejected before any reply arrived.
    RequestFailed {
        /// Conversation the request belonged to.
        conversation: ConversationId,
        /// What went wrong.
        message: String,
    },
}

impl Notice {
    /// The conversation this notice is about.
    pub fn conversation(&self) -> &ConversationId {
        match self {
            Notice::Interrupted { conversation, .. } | Notice::RequestFailed { conversation, .. } => {
                conversation
            }
        }
    }

    /// Human-readable description.
    pub fn message(&self) -> &str {
        match self {
            Notice::Interrupted { message, .. } | Notice::RequestFailed { message, .. } => message,
        }
    }

    /// Returns true if offering a retry makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Notice::Interrupted { .. })
    }
}

/// A running send.
#[derive(Debug)]
pub struct StreamHandle {
    conversation: ConversationId,
    updates: watch::Receiver<String>,
    outcome: oneshot::Receiver<StreamOutcome>,
}

impl StreamHandle {
    /// The conversation this stream belongs to.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation
    }

    /// A receiver of the growing reply text, updated at most once per frame.
    pub fn updates(&self) -> watch::Receiver<String> {
        self.updates.clone()
    }

    /// Waits for the stream to end.
    pub async fn outcome(self) -> StreamOutcome {
        self.outcome.await.unwrap_or_else(|_| {
            StreamOutcome::Errored(Error::streaming("stream driver stopped unexpectedly", None))
        })
    }
}

/// What the UI shows for the current conversation.
#[derive(Debug, Clone)]
pub struct VisibleConversation {
    /// The committed conversation.
    pub conversation: Conversation,

    /// The in-flight reply, if this conversation is streaming.
    pub streaming: Option<String>,
}

struct StreamState {
    generation: u64,
    cancel: CancellationToken,
    snapshot: watch::Receiver<String>,
}

enum Ending {
    Done,
    Cancelled,
    RequestFailed(Error),
    Interrupted(Error),
}

struct Inner {
    conversations: Vec<Conversation>,
    current: ConversationId,
    personas: PersonaRegistry,
    streams: HashMap<ConversationId, StreamState>,
    notices: Vec<Notice>,
    next_generation: u64,
}

impl Inner {
    fn conversation(&self, id: &ConversationId) -> Result<&Conversation> {
        self.conversations
            .iter()
            .find(|c| &c.id == id)
            .ok_or_else(|| conversation_not_found(id))
    }

    fn conversation_mut(&mut self, id: &ConversationId) -> Result<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| conversation_not_found(id))
    }

    fn persona(&self, id: Option<&PersonaId>) -> Result<Persona> {
        match id {
            None => Ok(self.personas.default_persona().clone()),
            Some(id) => self.personas.get(id).cloned().ok_or_else(|| {
                Error::not_found(
                    "no such persona",
                    Some("persona".to_string()),
                    Some(id.to_string()),
                )
            }),
        }
    }

    /// The prompt to send for `conversation`: the registry's current version of its persona,
    /// or the copy stored with the conversation if the persona has been removed.
    fn prompt_for(&self, conversation: &Conversation) -> String {
        self.personas
            .get(&conversation.persona.id)
            .map(|p| p.prompt.clone())
            .unwrap_or_else(|| conversation.persona.prompt.clone())
    }

    fn ensure_idle(&self, id: &ConversationId) -> Result<()> {
        if self.streams.contains_key(id) {
            return Err(Error::conflict(format!(
                "conversation {id} is already streaming a reply"
            )));
        }
        Ok(())
    }

    fn push_front(&mut self, conversation: Conversation) -> ConversationId {
        let id = conversation.id.clone();
        self.conversations.insert(0, conversation);
        self.current = id.clone();
        id
    }
}

fn conversation_not_found(id: &ConversationId) -> Error {
    Error::not_found(
        "no such conversation",
        Some("conversation".to_string()),
        Some(id.to_string()),
    )
}

/// Owns every conversation, the persona registry and the per-conversation stream states.
#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<Mutex<Inner>>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn ChatTransport>,
    config: StoreConfig,
}

impl ChatStore {
    /// Restores the store from `storage`, creating a default conversation if there is none.
    pub fn load(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn ChatTransport>,
        config: StoreConfig,
    ) -> Self {
        let mut personas = load_json::<Vec<Persona>>(storage.as_ref(), PERSONAS_KEY)
            .map(PersonaRegistry::from_list)
            .unwrap_or_default();
        let seeded = personas.merge_seed(config.seed_personas.clone());
        if seeded > 0 {
            tracing::info!(count = seeded, "seeded personas");
        }

        let metas =
            load_json::<Vec<ConversationMeta>>(storage.as_ref(), CHAT_LIST_KEY).unwrap_or_default();
        let conversations: Vec<Conversation> = metas
            .into_iter()
            .map(|meta| {
                let messages =
                    load_json::<Vec<Message>>(storage.as_ref(), &messages_key(&meta.id))
                        .unwrap_or_default();
                Conversation::from_parts(meta, messages)
            })
            .collect();

        let stored_current = load_json::<ConversationId>(storage.as_ref(), CURRENT_CHAT_KEY);
        let mut inner = Inner {
            current: ConversationId::from(""),
            conversations,
            personas,
            streams: HashMap::new(),
            notices: Vec::new(),
            next_generation: 0,
        };

        match stored_current.filter(|id| inner.conversation(id).is_ok()) {
            Some(id) => inner.current = id,
            None => match inner.conversations.first() {
                Some(first) => inner.current = first.id.clone(),
                None => {
                    let persona = inner.personas.default_persona().clone();
                    let conversation = Conversation::new(persona);
                    persist_messages(storage.as_ref(), &conversation);
                    inner.push_front(conversation);
                }
            },
        }
        tracing::debug!(
            conversations = inner.conversations.len(),
            current = %inner.current,
            "loaded chat store"
        );

        persist_personas(storage.as_ref(), &inner);
        persist_list(storage.as_ref(), &inner);
        persist_current(storage.as_ref(), &inner);

        Self {
            inner: Arc::new(Mutex::new(inner)),
            storage,
            transport,
            config,
        }
    }

    /// Starts a new empty conversation, puts it first and makes it current.
    ///
    /// `None` uses the default persona.
    pub async fn create_conversation(&self, persona: Option<&PersonaId>) -> Result<ConversationId> {
        let mut inner = self.inner.lock().await;
        let persona = inner.persona(persona)?;
        let conversation = Conversation::new(persona);
        persist_messages(self.storage.as_ref(), &conversation);
        let id = inner.push_front(conversation);
        persist_list(self.storage.as_ref(), &inner);
        persist_current(self.storage.as_ref(), &inner);
        Ok(id)
    }

    /// Makes `id` the visible conversation. Streams keep running in the background.
    pub async fn change_current(&self, id: &ConversationId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.conversation(id)?;
        inner.current = id.clone();
        persist_current(self.storage.as_ref(), &inner);
        Ok(())
    }

    /// Deletes a conversation, cancelling its stream and no other.
    pub async fn delete_conversation(&self, id: &ConversationId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let index = inner
            .conversations
            .iter()
            .position(|c| &c.id == id)
            .ok_or_else(|| conversation_not_found(id))?;
        if let Some(stream) = inner.streams.remove(id) {
            stream.cancel.cancel();
            STORE_CANCELLATIONS.click();
        }
        inner.conversations.remove(index);
        if let Err(err) = self.storage.remove(&messages_key(id)) {
            tracing::error!(conversation = %id, error = %err, "failed to remove stored messages");
        }

        if &inner.current == id {
            match inner.conversations.first().map(|c| c.id.clone()) {
                Some(first) => inner.current = first,
                None => {
                    let persona = inner.personas.default_persona().clone();
                    let conversation = Conversation::new(persona);
                    persist_messages(self.storage.as_ref(), &conversation);
                    inner.push_front(conversation);
                }
            }
        }
        persist_list(self.storage.as_ref(), &inner);
        persist_current(self.storage.as_ref(), &inner);
        tracing::info!(conversation = %id, "deleted conversation");
        Ok(())
    }

    /// Sets the title of a conversation.
    pub async fn rename_conversation(&self, id: &ConversationId, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::validation(
                "title must not be empty",
                Some("title".to_string()),
            ));
        }
        let mut inner = self.inner.lock().await;
        inner.conversation_mut(id)?.rename(title);
        persist_list(self.storage.as_ref(), &inner);
        Ok(())
    }

    /// Sends `input` in conversation `id` and starts streaming the reply.
    ///
    /// The user message is appended before the request goes out and stays in the history even
    /// if the request fails.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if the conversation is already streaming, and a validation
    /// error for empty input or a persona without a prompt. Nothing is appended in those cases.
    pub async fn send(
        &self,
        id: &ConversationId,
        input: impl Into<MessageContent>,
    ) -> Result<StreamHandle> {
        let input = input.into();
        if input.is_empty() {
            return Err(Error::validation(
                "message must not be empty",
                Some("input".to_string()),
            ));
        }

        let mut inner = self.inner.lock().await;
        inner.ensure_idle(id)?;
        let conversation = inner.conversation(id)?;
        let prompt = inner.prompt_for(conversation);
        let request = ChatClient::build_request(&prompt, &conversation.messages, input.clone())?;

        let conversation = inner.conversation_mut(id)?;
        conversation.append(Message::user(input));
        persist_messages(self.storage.as_ref(), conversation);
        persist_list(self.storage.as_ref(), &inner);

        Ok(self.start_stream(&mut inner, id, request))
    }

    /// Re-sends the trailing user message of `id` without appending it again.
    pub async fn retry(&self, id: &ConversationId) -> Result<StreamHandle> {
        let mut inner = self.inner.lock().await;
        inner.ensure_idle(id)?;
        let conversation = inner.conversation(id)?;
        let Some((last, history)) = conversation.messages.split_last() else {
            return Err(Error::validation("nothing to retry", None));
        };
        if last.role != Role::User {
            return Err(Error::validation(
                "the last message already has a reply",
                None,
            ));
        }
        let prompt = inner.prompt_for(conversation);
        let request = ChatClient::build_request(&prompt, history, last.content.clone())?;
        inner.notices.retain(|n| n.conversation() != id);
        Ok(self.start_stream(&mut inner, id, request))
    }

    /// Cancels the stream of `id`, if any. Nothing is appended and no notice is published.
    pub async fn stop(&self, id: &ConversationId) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.streams.remove(id) {
            Some(stream) => {
                stream.cancel.cancel();
                STORE_CANCELLATIONS.click();
                tracing::debug!(conversation = %id, "stopped stream");
                true
            }
            None => false,
        }
    }

    /// The latest published in-flight text of `id`, if it is streaming.
    pub async fn streaming_text(&self, id: &ConversationId) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.streams.get(id).map(|s| s.snapshot.borrow().clone())
    }

    /// Returns true if `id` has a reply in flight.
    pub async fn is_streaming(&self, id: &ConversationId) -> bool {
        self.inner.lock().await.streams.contains_key(id)
    }

    /// Re-attaches to the in-flight text of `id`.
    pub async fn subscribe(&self, id: &ConversationId) -> Option<watch::Receiver<String>> {
        let inner = self.inner.lock().await;
        inner.streams.get(id).map(|s| s.snapshot.clone())
    }

    /// Metadata of every conversation, newest first.
    pub async fn conversations(&self) -> Vec<ConversationMeta> {
        let inner = self.inner.lock().await;
        inner.conversations.iter().map(Conversation::meta).collect()
    }

    /// A snapshot of one conversation.
    pub async fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.inner.lock().await.conversation(id).ok().cloned()
    }

    /// The id of the visible conversation.
    pub async fn current_id(&self) -> ConversationId {
        self.inner.lock().await.current.clone()
    }

    /// The visible conversation together with its in-flight reply, if any.
    pub async fn visible(&self) -> Result<VisibleConversation> {
        let inner = self.inner.lock().await;
        let conversation = inner.conversation(&inner.current)?.clone();
        let streaming = inner
            .streams
            .get(&inner.current)
            .map(|s| s.snapshot.borrow().clone());
        Ok(VisibleConversation {
            conversation,
            streaming,
        })
    }

    /// Takes the notices published since the last call.
    pub async fn notices(&self) -> Vec<Notice> {
        std::mem::take(&mut self.inner.lock().await.notices)
    }

    /// All personas, default first.
    pub async fn personas(&self) -> Vec<Persona> {
        self.inner.lock().await.personas.list().to_vec()
    }

    /// Adds a persona.
    pub async fn add_persona(&self, persona: Persona) -> Result<PersonaId> {
        let mut inner = self.inner.lock().await;
        let id = inner.personas.add(persona)?;
        persist_personas(self.storage.as_ref(), &inner);
        Ok(id)
    }

    /// Replaces a persona. Conversations pick up the new prompt on their next send.
    pub async fn update_persona(&self, persona: Persona) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.personas.update(persona)?;
        persist_personas(self.storage.as_ref(), &inner);
        Ok(())
    }

    /// Removes a persona. Conversations using it keep their stored copy.
    pub async fn remove_persona(&self, id: &PersonaId) -> Result<Persona> {
        let mut inner = self.inner.lock().await;
        let removed = inner.personas.remove(id)?;
        persist_personas(self.storage.as_ref(), &inner);
        Ok(removed)
    }

    /// Personas matching `query` in the list as it is now.
    pub async fn search_personas(&self, query: &str) -> Vec<Persona> {
        self.inner.lock().await.personas.search(query)
    }

    fn start_stream(
        &self,
        inner: &mut Inner,
        id: &ConversationId,
        request: ChatRequest,
    ) -> StreamHandle {
        let assembler = MessageAssembler::new();
        let snapshot = assembler.subscribe();
        let cancel = CancellationToken::new();
        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.streams.insert(
            id.clone(),
            StreamState {
                generation,
                cancel: cancel.clone(),
                snapshot: snapshot.clone(),
            },
        );

        let (tx, rx) = oneshot::channel();
        let store = self.clone();
        let conversation = id.clone();
        tokio::spawn(async move {
            let outcome = store
                .drive(conversation, generation, request, cancel, assembler)
                .await;
            let _ = tx.send(outcome);
        });

        StreamHandle {
            conversation: id.clone(),
            updates: snapshot,
            outcome: rx,
        }
    }

    async fn drive(
        &self,
        id: ConversationId,
        generation: u64,
        request: ChatRequest,
        cancel: CancellationToken,
        mut assembler: MessageAssembler,
    ) -> StreamOutcome {
        let start = Instant::now();
        let ending = self.pump(request, &cancel, &mut assembler).await;
        STORE_STREAM_DURATION.add(start.elapsed().as_secs_f64());
        self.finish(id, generation, ending, assembler).await
    }

    async fn pump(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
        assembler: &mut MessageAssembler,
    ) -> Ending {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ending::Cancelled,
            opened = self.transport.open(request, cancel.clone()) => opened,
        };
        let mut events = match opened {
            Ok(events) => events,
            Err(_) if cancel.is_cancelled() => return Ending::Cancelled,
            Err(err) => return Ending::RequestFailed(err),
        };

        let mut frames = tokio::time::interval(self.config.frame_interval);
        frames.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ending::Cancelled,
                event = events.next() => match event {
                    Some(Ok(StreamEvent::Delta(text))) => assembler.append(&text),
                    Some(Ok(StreamEvent::Done)) => {
                        assembler.flush();
                        return Ending::Done;
                    }
                    Some(Err(err)) => return Ending::Interrupted(err),
                    None => {
                        return Ending::Interrupted(Error::streaming(
                            "the reply ended before it was complete",
                            None,
                        ));
                    }
                },
                _ = frames.tick() => {
                    assembler.flush();
                }
            }
        }
    }

    async fn finish(
        &self,
        id: ConversationId,
        generation: u64,
        ending: Ending,
        mut assembler: MessageAssembler,
    ) -> StreamOutcome {
        let mut inner = self.inner.lock().await;
        let owner = inner
            .streams
            .get(&id)
            .is_some_and(|s| s.generation == generation);
        if !owner {
            assembler.reset();
            return StreamOutcome::Cancelled;
        }
        inner.streams.remove(&id);

        match ending {
            Ending::Done => {
                let Some(message) = assembler.commit() else {
                    tracing::debug!(conversation = %id, "reply completed without text");
                    return StreamOutcome::Empty;
                };
                if let Ok(conversation) = inner.conversation_mut(&id) {
                    conversation.append(message.clone());
                    persist_messages(self.storage.as_ref(), conversation);
                    persist_list(self.storage.as_ref(), &inner);
                }
                STORE_COMMITS.click();
                StreamOutcome::Committed(message)
            }
            Ending::Cancelled => {
                assembler.reset();
                StreamOutcome::Cancelled
            }
            Ending::Interrupted(err) => {
                assembler.reset();
                STORE_INTERRUPTIONS.click();
                tracing::warn!(conversation = %id, error = %err, "stream interrupted");
                inner.notices.push(Notice::Interrupted {
                    conversation: id,
                    message: err.to_string(),
                });
                StreamOutcome::Errored(err)
            }
            Ending::RequestFailed(err) => {
                tracing::warn!(conversation = %id, error = %err, "chat request failed");
                inner.notices.push(Notice::RequestFailed {
                    conversation: id,
                    message: err.message().to_string(),
                });
                StreamOutcome::Errored(err)
            }
        }
    }
}

fn persist_list(storage: &dyn Storage, inner: &Inner) {
    let metas: Vec<ConversationMeta> = inner.conversations.iter().map(Conversation::meta).collect();
    if let Err(err) = save_json(storage, CHAT_LIST_KEY, &metas) {
        tracing::error!(error = %err, "failed to persist conversation list");
    }
}

fn persist_messages(storage: &dyn Storage, conversation: &Conversation) {
    if let Err(err) = save_json(storage, &messages_key(&conversation.id), &conversation.messages) {
        tracing::error!(conversation = %conversation.id, error = %err, "failed to persist messages");
    }
}

fn persist_current(storage: &dyn Storage, inner: &Inner) {
    if let Err(err) = save_json(storage, CURRENT_CHAT_KEY, &inner.current) {
        tracing::error!(error = %err, "failed to persist current conversation");
    }
}

fn persist_personas(storage: &dyn Storage, inner: &Inner) {
    if let Err(err) = save_json(storage, PERSONAS_KEY, inner.personas.list()) {
        tracing::error!(error = %err, "failed to persist personas");
    }
}

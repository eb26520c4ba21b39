//! Core chat session management.
//!
//! This module provides the `ChatSession` struct which drives a [`ChatStore`] from the
//! terminal: it resolves the user's selectors, collects attachments, and follows streams.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;

use crate::chat::config::ChatConfig;
use crate::chat::render::{Renderer, new_suffix};
use crate::client::ChatClient;
use crate::error::{Error, Result};
use crate::personas::PersonaRegistry;
use crate::storage::FileStorage;
use crate::store::{ChatStore, StoreConfig, StreamHandle, StreamOutcome};
use crate::types::{ContentPart, ConversationId, MessageContent, Persona, Role};

/// How often the interrupt flag is checked while a reply streams.
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

/// A terminal chat session over a [`ChatStore`].
pub struct ChatSession {
    store: ChatStore,
    attachments: Vec<ContentPart>,
}

impl ChatSession {
    /// Opens the store in `config.data_dir`, talking to `config.server_url`.
    pub fn open(config: &ChatConfig) -> Result<Self> {
        let transport =
            ChatClient::with_options(&config.server_url, config.framing, config.idle_timeout)?;
        let seeds = match &config.personas_path {
            Some(path) => PersonaRegistry::load_seed(path)?,
            None => Vec::new(),
        };
        let store = ChatStore::load(
            Arc::new(FileStorage::new(&config.data_dir)),
            Arc::new(transport),
            StoreConfig::new().with_seed_personas(seeds),
        );
        Ok(Self::new(store))
    }

    /// Wraps an already loaded store.
    pub fn new(store: ChatStore) -> Self {
        Self {
            store,
            attachments: Vec::new(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    /// Resolves a 1-based list position, a full id, or a unique id prefix.
    pub async fn select_conversation(&self, selector: &str) -> Result<ConversationId> {
        let conversations = self.store.conversations().await;
        if let Ok(position) = selector.parse::<usize>() {
            return position
                .checked_sub(1)
                .and_then(|index| conversations.get(index))
                .map(|meta| meta.id.clone())
                .ok_or_else(|| {
                    Error::not_found(
                        format!("there is no conversation number {position}"),
                        Some("conversation".to_string()),
                        None,
                    )
                });
        }

        let matches: Vec<_> = conversations
            .iter()
            .filter(|meta| meta.id.as_str().starts_with(selector))
            .collect();
        match matches.as_slice() {
            [only] => Ok(only.id.clone()),
            [] => Err(Error::not_found(
                "no such conversation",
                Some("conversation".to_string()),
                Some(selector.to_string()),
            )),
            _ => Err(Error::validation(
                format!("{selector} matches more than one conversation"),
                None,
            )),
        }
    }

    /// Finds a persona by name (ignoring case) or id.
    pub async fn find_persona(&self, name_or_id: &str) -> Result<Persona> {
        self.store
            .personas()
            .await
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name_or_id) || p.id.as_str() == name_or_id)
            .ok_or_else(|| {
                Error::not_found(
                    "no such persona",
                    Some("persona".to_string()),
                    Some(name_or_id.to_string()),
                )
            })
    }

    /// Queues an image file for the next message.
    pub fn attach_image(&mut self, path: &str) -> Result<()> {
        let media_type = image_media_type(path).ok_or_else(|| {
            Error::validation(
                format!("{path} is not a supported image (png, jpeg, gif, webp)"),
                Some("path".to_string()),
            )
        })?;
        let bytes = read_attachment(path)?;
        self.attachments
            .push(ContentPart::image_from_bytes(media_type, &bytes));
        Ok(())
    }

    /// Queues a document file for the next message.
    pub fn attach_document(&mut self, path: &str) -> Result<()> {
        let bytes = read_attachment(path)?;
        let filename = std::path::Path::new(path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(path);
        self.attachments.push(ContentPart::document_from_bytes(
            filename,
            document_media_type(path),
            &bytes,
        ));
        Ok(())
    }

    /// Number of queued attachments.
    pub fn pending_attachments(&self) -> usize {
        self.attachments.len()
    }

    /// Drops queued attachments, returning how many there were.
    pub fn clear_attachments(&mut self) -> usize {
        std::mem::take(&mut self.attachments).len()
    }

    fn compose(&self, text: &str) -> MessageContent {
        MessageContent::with_attachments(text, self.attachments.clone())
    }

    /// Sends `text` plus queued attachments in the current conversation and follows the reply.
    pub async fn send_streaming(
        &mut self,
        text: &str,
        renderer: &mut dyn Renderer,
        interrupted: Arc<AtomicBool>,
    ) -> Result<StreamOutcome> {
        let id = self.store.current_id().await;
        let handle = self.store.send(&id, self.compose(text)).await?;
        self.attachments.clear();
        Ok(self.follow_handle(handle, renderer, &interrupted).await)
    }

    /// Sends `text` in the current conversation without following the reply.
    pub async fn send_background(&mut self, text: &str) -> Result<ConversationId> {
        let id = self.store.current_id().await;
        let handle = self.store.send(&id, self.compose(text)).await?;
        self.attachments.clear();
        Ok(handle.conversation_id().clone())
    }

    /// Re-sends the last user message of the current conversation and follows the reply.
    pub async fn retry_streaming(
        &self,
        renderer: &mut dyn Renderer,
        interrupted: Arc<AtomicBool>,
    ) -> Result<StreamOutcome> {
        let id = self.store.current_id().await;
        let handle = self.store.retry(&id).await?;
        Ok(self.follow_handle(handle, renderer, &interrupted).await)
    }

    /// Replays the current conversation and, if it is still streaming, follows the live reply.
    pub async fn show_current(
        &self,
        renderer: &mut dyn Renderer,
        interrupted: Arc<AtomicBool>,
    ) -> Result<()> {
        let visible = self.store.visible().await?;
        let id = visible.conversation.id.clone();
        let label = visible.conversation.persona.name.clone();
        renderer.print_info(&format!("== {} ==", visible.conversation.title));
        for message in &visible.conversation.messages {
            renderer.print_message(message, &label);
        }

        let Some(updates) = self.store.subscribe(&id).await else {
            return Ok(());
        };
        renderer.start_response(&label);
        let mut shown = String::new();
        if self
            .follow(&id, updates, &mut shown, renderer, &interrupted)
            .await
        {
            return Ok(());
        }
        if let Some(conversation) = self.store.conversation(&id).await
            && let Some(last) = conversation.last_message()
            && last.role == Role::Assistant
        {
            renderer.print_text(new_suffix(&shown, &last.content.text()));
        }
        renderer.finish_response();
        self.print_notices(renderer).await;
        Ok(())
    }

    /// Renders and clears pending notices.
    pub async fn print_notices(&self, renderer: &mut dyn Renderer) {
        for notice in self.store.notices().await {
            renderer.print_notice(&notice);
        }
    }

    async fn follow_handle(
        &self,
        handle: StreamHandle,
        renderer: &mut dyn Renderer,
        interrupted: &AtomicBool,
    ) -> StreamOutcome {
        let id = handle.conversation_id().clone();
        let label = match self.store.conversation(&id).await {
            Some(conversation) => conversation.persona.name,
            None => "Assistant".to_string(),
        };
        renderer.start_response(&label);

        let mut shown = String::new();
        let stopped = self
            .follow(&id, handle.updates(), &mut shown, renderer, interrupted)
            .await;
        let outcome = handle.outcome().await;
        match &outcome {
            StreamOutcome::Committed(message) => {
                renderer.print_text(new_suffix(&shown, &message.content.text()));
                renderer.finish_response();
            }
            StreamOutcome::Empty => renderer.finish_response(),
            StreamOutcome::Cancelled => {
                if !stopped {
                    renderer.print_interrupted();
                }
            }
            StreamOutcome::Errored(_) => {
                renderer.finish_response();
                self.print_notices(renderer).await;
            }
        }
        outcome
    }

    /// Prints snapshot suffixes until the stream ends. Returns true if the user stopped it.
    async fn follow(
        &self,
        id: &ConversationId,
        mut updates: watch::Receiver<String>,
        shown: &mut String,
        renderer: &mut dyn Renderer,
        interrupted: &AtomicBool,
    ) -> bool {
        let snapshot = updates.borrow_and_update().clone();
        renderer.print_text(new_suffix(shown, &snapshot));
        *shown = snapshot;

        loop {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    let snapshot = updates.borrow_and_update().clone();
                    renderer.print_text(new_suffix(shown, &snapshot));
                    *shown = snapshot;
                }
                _ = tokio::time::sleep(INTERRUPT_POLL) => {
                    if interrupted.swap(false, Ordering::Relaxed) {
                        self.store.stop(id).await;
                        renderer.print_interrupted();
                        return true;
                    }
                }
            }
        }
    }
}

fn read_attachment(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|err| Error::io(format!("failed to read {path}"), err))
}

fn extension(path: &str) -> String {
    std::path::Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn image_media_type(path: &str) -> Option<&'static str> {
    match extension(path).as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

fn document_media_type(path: &str) -> &'static str {
    match extension(path).as_str() {
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use futures::channel::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::client::ChatTransport;
    use crate::sse::{DeltaStream, StreamEvent};
    use crate::storage::MemoryStorage;
    use crate::store::Notice;
    use crate::types::{ChatRequest, ConversationMeta, Message};

    #[derive(Default)]
    struct QueuedTransport {
        streams: StdMutex<VecDeque<mpsc::UnboundedReceiver<Result<StreamEvent>>>>,
    }

    impl QueuedTransport {
        fn push(&self) -> mpsc::UnboundedSender<Result<StreamEvent>> {
            let (tx, rx) = mpsc::unbounded();
            self.streams.lock().unwrap().push_back(rx);
            tx
        }
    }

    #[async_trait::async_trait]
    impl ChatTransport for QueuedTransport {
        async fn open(
            &self,
            _request: ChatRequest,
            _cancel: CancellationToken,
        ) -> Result<DeltaStream> {
            match self.streams.lock().unwrap().pop_front() {
                Some(rx) => {
                    let stream: DeltaStream = Box::pin(rx);
                    Ok(stream)
                }
                None => Err(Error::api(503, None, "server is down")),
            }
        }
    }

    #[derive(Default)]
    struct RecordingRenderer {
        text: String,
        notices: Vec<Notice>,
        interrupted: bool,
    }

    impl Renderer for RecordingRenderer {
        fn start_response(&mut self, _label: &str) {}
        fn print_text(&mut self, text: &str) {
            self.text.push_str(text);
        }
        fn finish_response(&mut self) {}
        fn print_interrupted(&mut self) {
            self.interrupted = true;
        }
        fn print_error(&mut self, _error: &str) {}
        fn print_info(&mut self, _info: &str) {}
        fn print_notice(&mut self, notice: &Notice) {
            self.notices.push(notice.clone());
        }
        fn print_message(&mut self, _message: &Message, _assistant_label: &str) {}
        fn print_conversations(
            &mut self,
            _conversations: &[ConversationMeta],
            _current: &ConversationId,
            _streaming: &[ConversationId],
        ) {
        }
        fn print_personas(&mut self, _personas: &[Persona]) {}
    }

    fn session() -> (ChatSession, Arc<QueuedTransport>) {
        let transport = Arc::new(QueuedTransport::default());
        let store = ChatStore::load(
            Arc::new(MemoryStorage::new()),
            transport.clone(),
            StoreConfig::new().with_frame_interval(Duration::from_millis(1)),
        );
        (ChatSession::new(store), transport)
    }

    #[tokio::test]
    async fn streaming_reply_is_rendered_once() {
        let (mut session, transport) = session();
        let feed = transport.push();
        feed.unbounded_send(Ok(StreamEvent::Delta("Hello".into()))).unwrap();
        feed.unbounded_send(Ok(StreamEvent::Delta(", world".into()))).unwrap();
        feed.unbounded_send(Ok(StreamEvent::Done)).unwrap();

        let mut renderer = RecordingRenderer::default();
        let outcome = session
            .send_streaming("hi", &mut renderer, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert!(matches!(outcome, StreamOutcome::Committed(_)));
        assert_eq!(renderer.text, "Hello, world");
        assert!(!renderer.interrupted);
    }

    #[tokio::test]
    async fn interrupt_flag_stops_stream() {
        let (mut session, transport) = session();
        let feed = transport.push();
        feed.unbounded_send(Ok(StreamEvent::Delta("never".into()))).unwrap();

        let mut renderer = RecordingRenderer::default();
        let outcome = session
            .send_streaming("hi", &mut renderer, Arc::new(AtomicBool::new(true)))
            .await
            .unwrap();
        assert!(matches!(outcome, StreamOutcome::Cancelled));
        assert!(renderer.interrupted);
        let id = session.store().current_id().await;
        assert!(!session.store().is_streaming(&id).await);
        assert_eq!(
            session.store().conversation(&id).await.unwrap().messages.len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_send_renders_notice() {
        let (mut session, _transport) = session();
        let mut renderer = RecordingRenderer::default();
        let outcome = session
            .send_streaming("hi", &mut renderer, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert!(matches!(outcome, StreamOutcome::Errored(_)));
        assert_eq!(renderer.notices.len(), 1);
        assert_eq!(renderer.notices[0].message(), "server is down");
    }

    #[tokio::test]
    async fn background_stream_can_be_followed_later() {
        let (mut session, transport) = session();
        let feed = transport.push();
        let id = session.send_background("write a story").await.unwrap();
        session.store().create_conversation(None).await.unwrap();
        feed.unbounded_send(Ok(StreamEvent::Delta("Once".into()))).unwrap();

        session.store().change_current(&id).await.unwrap();
        let finisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            feed.unbounded_send(Ok(StreamEvent::Delta(" upon".into()))).unwrap();
            feed.unbounded_send(Ok(StreamEvent::Done)).unwrap();
        });
        let mut renderer = RecordingRenderer::default();
        session
            .show_current(&mut renderer, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        finisher.await.unwrap();
        assert_eq!(renderer.text, "Once upon");
    }

    #[tokio::test]
    async fn selectors_resolve_positions_and_prefixes() {
        let (session, _) = session();
        let first = session.store().current_id().await;
        let second = session.store().create_conversation(None).await.unwrap();

        assert_eq!(session.select_conversation("1").await.unwrap(), second);
        assert_eq!(session.select_conversation("2").await.unwrap(), first);
        assert!(session.select_conversation("0").await.unwrap_err().is_not_found());
        assert!(session.select_conversation("3").await.unwrap_err().is_not_found());
        assert_eq!(
            session.select_conversation(first.as_str()).await.unwrap(),
            first
        );
        assert!(session.select_conversation("zzz").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn personas_found_by_name_or_id() {
        let (session, _) = session();
        let persona = session.find_persona("chatgpt").await.unwrap();
        assert!(persona.is_default());
        let again = session.find_persona(persona.id.as_str()).await.unwrap();
        assert_eq!(again, persona);
        assert!(session.find_persona("Nobody").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn attachments_are_sent_with_next_message() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("pixel.png");
        std::fs::write(&image, [0x89, b'P', b'N', b'G']).unwrap();
        let notes = dir.path().join("notes.txt");
        std::fs::write(&notes, "remember the milk").unwrap();

        let (mut session, transport) = session();
        session.attach_image(image.to_str().unwrap()).unwrap();
        session.attach_document(notes.to_str().unwrap()).unwrap();
        assert!(session.attach_image(notes.to_str().unwrap()).unwrap_err().is_validation());
        assert_eq!(session.pending_attachments(), 2);

        let _feed = transport.push();
        let id = session.send_background("what is this?").await.unwrap();
        assert_eq!(session.pending_attachments(), 0);
        let conversation = session.store().conversation(&id).await.unwrap();
        match &conversation.messages[0].content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(&parts[1], ContentPart::ImageUrl { image_url } if image_url.url.starts_with("data:image/png;base64,")));
                assert!(matches!(&parts[2], ContentPart::File { file } if file.filename == "notes.txt"));
            }
            other => panic!("expected parts, got {other:?}"),
        }

        session.attach_document(notes.to_str().unwrap()).unwrap();
        assert_eq!(session.clear_attachments(), 1);
    }

    #[test]
    fn media_types_by_extension() {
        assert_eq!(image_media_type("a/b/photo.JPG"), Some("image/jpeg"));
        assert_eq!(image_media_type("doc.pdf"), None);
        assert_eq!(document_media_type("paper.pdf"), "application/pdf");
        assert_eq!(document_media_type("blob"), "application/octet-stream");
    }
}

//! Accumulates streamed deltas into the in-flight assistant message.

use std::time::Duration;

use tokio::sync::watch;

use crate::types::Message;

/// How often buffered deltas are published to subscribers while a stream is running.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// The growing text of one in-flight assistant reply.
///
/// `append` only touches the local buffer. Subscribers observe the buffer through a
/// `watch` channel that is updated by `flush`, so a burst of deltas arriving within one
/// frame produces a single visible update. Published snapshots only ever grow: commit and
/// reset clear the buffer without publishing.
#[derive(Debug)]
pub struct MessageAssembler {
    buffer: String,
    dirty: bool,
    snapshot: watch::Sender<String>,
}

impl MessageAssembler {
    /// Creates an empty assembler.
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(String::new());
        Self {
            buffer: String::new(),
            dirty: false,
            snapshot,
        }
    }

    /// Appends a delta to the buffer. Empty deltas are ignored.
    pub fn append(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.buffer.push_str(delta);
        self.dirty = true;
    }

    /// The text assembled so far, including deltas not yet flushed.
    pub fn text(&self) -> &str {
        &self.buffer
    }

    /// Returns true if nothing has been appended since the last commit or reset.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Publishes the buffer to subscribers if it changed since the last flush.
    ///
    /// Returns true if an update was published.
    pub fn flush(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        self.dirty = false;
        self.snapshot.send_replace(self.buffer.clone());
        true
    }

    /// Returns a receiver that observes flushed snapshots of the buffer.
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.snapshot.subscribe()
    }

    /// Materializes the buffer as an assistant message and clears it.
    ///
    /// Returns `None` when there is nothing to commit, so a second commit without an
    /// intervening append never yields a second message.
    pub fn commit(&mut self) -> Option<Message> {
        if self.buffer.is_empty() {
            return None;
        }
        self.dirty = false;
        let text = std::mem::take(&mut self.buffer);
        Some(Message::assistant(text))
    }

    /// Discards the buffer without committing.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.dirty = false;
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn commit_is_idempotent() {
        let mut assembler = MessageAssembler::new();
        assembler.append("Hello");
        assembler.append(", world");

        let message = assembler.commit().expect("first commit yields a message");
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.content.text(), "Hello, world");
        assert!(assembler.commit().is_none());
        assert!(assembler.is_empty());
    }

    #[test]
    fn commit_without_append_yields_nothing() {
        let mut assembler = MessageAssembler::new();
        assert!(assembler.commit().is_none());
        assembler.append("");
        assert!(assembler.commit().is_none());
    }

    #[test]
    fn buffer_is_monotonic() {
        let mut assembler = MessageAssembler::new();
        let mut previous = String::new();
        for delta in ["The", " quick", " brown", " fox", " ", "jumps", "!"] {
            assembler.append(delta);
            let current = assembler.text().to_string();
            assert!(current.len() >= previous.len());
            assert!(current.starts_with(&previous));
            previous = current;
        }
        assert_eq!(previous, "The quick brown fox jumps!");
    }

    #[test]
    fn reset_discards_without_commit() {
        let mut assembler = MessageAssembler::new();
        let rx = assembler.subscribe();
        assembler.append("partial");
        assembler.reset();
        assert!(assembler.is_empty());
        assert!(!assembler.flush());
        assert_eq!(*rx.borrow(), "");
        assert!(assembler.commit().is_none());
    }

    #[test]
    fn deltas_within_one_frame_publish_once() {
        let mut assembler = MessageAssembler::new();
        let mut rx = assembler.subscribe();

        assembler.append("a");
        assembler.append("b");
        assembler.append("c");
        assert!(!rx.has_changed().unwrap());

        assert!(assembler.flush());
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), "abc");

        assert!(!assembler.flush());
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn published_snapshots_never_shrink() {
        let mut assembler = MessageAssembler::new();
        let mut rx = assembler.subscribe();
        assembler.append("final answer");
        assembler.flush();
        rx.borrow_and_update();

        assembler.commit();
        assembler.flush();
        assert!(!rx.has_changed().unwrap());
        assert_eq!(*rx.borrow(), "final answer");
    }
}

//! Output rendering for the chat application.
//!
//! This module provides a trait-based rendering abstraction that allows
//! for different output styles. The default implementation uses ANSI
//! escape codes to set replies, notices and listings apart.

use std::io::{self, Stdout, Write};

use crate::store::Notice;
use crate::types::{
    ContentPart, ConversationId, ConversationMeta, Message, MessageContent, Persona, Role,
};

/// ANSI escape code for dim text (used for history replay).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code for bold text (used for the current conversation).
const ANSI_BOLD: &str = "\x1b[1m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for cyan text (used for speaker labels).
const ANSI_CYAN: &str = "\x1b[36m";

/// ANSI escape code for yellow text (used for retryable notices).
const ANSI_YELLOW: &str = "\x1b[33m";

/// ANSI escape code for red text (used for errors).
const ANSI_RED: &str = "\x1b[31m";

/// Trait for rendering chat output.
pub trait Renderer: Send {
    /// Print the label that precedes a streamed reply.
    fn start_response(&mut self, label: &str);

    /// Print a chunk of reply text.
    ///
    /// This is called incrementally with the new suffix of each snapshot.
    fn print_text(&mut self, text: &str);

    /// Called when a reply is complete.
    fn finish_response(&mut self);

    /// Called when the user stopped the reply.
    fn print_interrupted(&mut self);

    /// Print an error message.
    fn print_error(&mut self, error: &str);

    /// Print an informational message.
    fn print_info(&mut self, info: &str);

    /// Print a notice about a failed send.
    fn print_notice(&mut self, notice: &Notice);

    /// Print one committed message when replaying a conversation.
    fn print_message(&mut self, message: &Message, assistant_label: &str);

    /// Print the conversation list.
    fn print_conversations(
        &mut self,
        conversations: &[ConversationMeta],
        current: &ConversationId,
        streaming: &[ConversationId],
    );

    /// Print a list of personas.
    fn print_personas(&mut self, personas: &[Persona]);
}

/// Returns the part of `snapshot` not yet shown.
///
/// Snapshots only grow by suffix, so everything past `shown` is new. If `snapshot` does not
/// extend `shown` the whole snapshot is returned.
pub fn new_suffix<'a>(shown: &str, snapshot: &'a str) -> &'a str {
    snapshot.strip_prefix(shown).unwrap_or(snapshot)
}

/// Formats one row of the conversation list.
pub fn format_conversation_line(
    index: usize,
    meta: &ConversationMeta,
    is_current: bool,
    is_streaming: bool,
) -> String {
    let marker = if is_current { '*' } else { ' ' };
    let streaming = if is_streaming { " [streaming]" } else { "" };
    let short_id: String = meta.id.as_str().chars().take(8).collect();
    format!(
        "{marker} {index:>2}. {} ({}, {short_id}){streaming}",
        meta.title, meta.persona.name
    )
}

/// Plain text renderer with optional ANSI styling.
pub struct PlainTextRenderer {
    stdout: Stdout,
    use_color: bool,
}

impl PlainTextRenderer {
    /// Creates a new PlainTextRenderer with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new PlainTextRenderer with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self {
            stdout: io::stdout(),
            use_color,
        }
    }

    /// Flushes stdout to ensure immediate display of streamed content.
    fn flush(&mut self) {
        let _ = self.stdout.flush();
    }

    fn styled(&self, style: &str, text: &str) -> String {
        if self.use_color {
            format!("{style}{text}{ANSI_RESET}")
        } else {
            text.to_string()
        }
    }
}

impl Default for PlainTextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for PlainTextRenderer {
    fn start_response(&mut self, label: &str) {
        println!("{}", self.styled(ANSI_CYAN, &format!("{label}:")));
        self.flush();
    }

    fn print_text(&mut self, text: &str) {
        print!("{text}");
        self.flush();
    }

    fn finish_response(&mut self) {
        println!();
        self.flush();
    }

    fn print_interrupted(&mut self) {
        println!("\n[stopped]");
        self.flush();
    }

    fn print_error(&mut self, error: &str) {
        eprintln!("{}", self.styled(ANSI_RED, &format!("Error: {error}")));
    }

    fn print_info(&mut self, info: &str) {
        println!("{info}");
    }

    fn print_notice(&mut self, notice: &Notice) {
        if notice.is_retryable() {
            let text = format!(
                "Reply interrupted: {} (use /retry to try again)",
                notice.message()
            );
            eprintln!("{}", self.styled(ANSI_YELLOW, &text));
        } else {
            let text = format!("Request failed: {}", notice.message());
            eprintln!("{}", self.styled(ANSI_RED, &text));
        }
    }

    fn print_message(&mut self, message: &Message, assistant_label: &str) {
        let label = match message.role {
            Role::User => "You",
            Role::Assistant => assistant_label,
            Role::System => "System",
        };
        let attachments = match &message.content {
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|part| !matches!(part, ContentPart::Text { .. }))
                .count(),
            MessageContent::Text(_) => 0,
        };
        let mut text = message.content.text();
        if attachments > 0 {
            text.push_str(&format!(" [{attachments} attachment(s)]"));
        }
        println!("{}", self.styled(ANSI_CYAN, &format!("{label}:")));
        println!("{}", self.styled(ANSI_DIM, &text));
    }

    fn print_conversations(
        &mut self,
        conversations: &[ConversationMeta],
        current: &ConversationId,
        streaming: &[ConversationId],
    ) {
        for (index, meta) in conversations.iter().enumerate() {
            let is_current = &meta.id == current;
            let line =
                format_conversation_line(index + 1, meta, is_current, streaming.contains(&meta.id));
            if is_current {
                println!("{}", self.styled(ANSI_BOLD, &line));
            } else {
                println!("{line}");
            }
        }
    }

    fn print_personas(&mut self, personas: &[Persona]) {
        if personas.is_empty() {
            println!("    (no matching personas)");
        }
        for persona in personas {
            let default = if persona.is_default() { " (default)" } else { "" };
            println!("    {}{default}", self.styled(ANSI_BOLD, &persona.name));
            println!("      {}", self.styled(ANSI_DIM, &persona.prompt));
        }
    }
}

//! Configuration types for the chat application.
//!
//! This module provides CLI argument parsing via `arrrg` and configuration
//! structures for controlling chat behavior.

use std::time::Duration;

use arrrg_derive::CommandLine;

use crate::client::{DEFAULT_IDLE_TIMEOUT, DEFAULT_SERVER_URL};
use crate::error::{Error, Result};
use crate::sse::Framing;

/// Directory used for conversation storage when neither `--data-dir` nor `$HOME` is available.
const FALLBACK_DATA_DIR: &str = ".chatlite";

/// Command-line arguments for the chatlite-chat tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct ChatArgs {
    /// Base URL of the chat server.
    #[arrrg(optional, "Server URL (default: http://127.0.0.1:3000/)", "URL")]
    pub server: Option<String>,

    /// Directory holding conversations and personas.
    #[arrrg(optional, "Data directory (default: ~/.chatlite)", "DIR")]
    pub data_dir: Option<String>,

    /// Reply framing the server uses.
    #[arrrg(optional, "Reply framing: sse or raw (default: sse)", "FRAMING")]
    pub framing: Option<String>,

    /// YAML file of personas to seed.
    #[arrrg(optional, "YAML file of personas to add on startup", "FILE")]
    pub personas: Option<String>,

    /// Seconds of silence before a reply is abandoned.
    #[arrrg(optional, "Seconds of stream silence before giving up (default: 90)", "SECS")]
    pub idle_timeout: Option<u64>,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,
}

/// Configuration for a chat session.
///
/// This struct holds the resolved configuration values after processing
/// command-line arguments with appropriate defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Base URL of the chat server.
    pub server_url: String,

    /// Directory holding conversations and personas.
    pub data_dir: String,

    /// Reply framing the server uses.
    pub framing: Framing,

    /// Optional YAML file of personas to seed.
    pub personas_path: Option<String>,

    /// Bound on every stream read.
    pub idle_timeout: Duration,

    /// Whether to use ANSI colors and styles in output.
    pub use_color: bool,
}

impl ChatConfig {
    /// Creates a new ChatConfig with default values.
    ///
    /// Defaults:
    /// - Server: http://127.0.0.1:3000/
    /// - Data directory: ~/.chatlite
    /// - Framing: SSE
    /// - Idle timeout: 90 seconds
    /// - Color: enabled
    pub fn new() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            data_dir: default_data_dir(),
            framing: Framing::Sse,
            personas_path: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            use_color: true,
        }
    }

    /// Sets the server URL.
    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = server_url.into();
        self
    }

    /// Sets the data directory.
    pub fn with_data_dir(mut self, data_dir: impl Into<String>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Sets the reply framing.
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Sets the persona seed file.
    pub fn with_personas_path(mut self, path: Option<String>) -> Self {
        self.personas_path = path;
        self
    }

    /// Sets the idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Disables ANSI color output.
    pub fn without_color(mut self) -> Self {
        self.use_color = false;
        self
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<ChatArgs> for ChatConfig {
    type Error = Error;

    fn try_from(args: ChatArgs) -> Result<Self> {
        let defaults = ChatConfig::new();
        let framing = match args.framing {
            Some(framing) => framing.parse()?,
            None => defaults.framing,
        };
        if args.idle_timeout == Some(0) {
            return Err(Error::validation(
                "idle timeout must be at least one second",
                Some("idle-timeout".to_string()),
            ));
        }

        Ok(ChatConfig {
            server_url: args.server.unwrap_or(defaults.server_url),
            data_dir: args.data_dir.unwrap_or(defaults.data_dir),
            framing,
            personas_path: args.personas,
            idle_timeout: args
                .idle_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            use_color: !args.no_color,
        })
    }
}

fn default_data_dir() -> String {
    std::env::var("HOME")
        .ok()
        .filter(|home| !home.is_empty())
        .map(|home| format!("{home}/{FALLBACK_DATA_DIR}"))
        .unwrap_or_else(|| FALLBACK_DATA_DIR.to_string())
}

//! Chat application module for interactive conversations.
//!
//! This module provides a streaming REPL chat interface built on top of the
//! conversation store. It supports:
//!
//! - Streaming replies with real-time display
//! - Multiple conversations with background streams and re-attachment
//! - Slash commands for conversation and persona management
//! - Image and document attachments
//!
//! # Architecture
//!
//! The module is organized into several components:
//!
//! - [`config`]: CLI argument parsing and configuration
//! - [`session`]: Drives the store from the terminal
//! - [`commands`]: Slash command parsing and handling
//! - [`render`]: Output styling

mod commands;
mod config;
mod render;
mod session;

pub use commands::{ChatCommand, help_text, parse_command};
pub use config::{ChatArgs, ChatConfig};
pub use render::{PlainTextRenderer, Renderer, format_conversation_line, new_suffix};
pub use session::ChatSession;

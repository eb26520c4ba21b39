//! Slash command parsing for the chat application.
//!
//! This module handles parsing of special commands that start with `/`,
//! allowing users to manage conversations and personas without sending
//! messages to the server.

/// A parsed chat command.
///
/// These commands control the session and are not sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    /// Start a new conversation, optionally with a named persona.
    New(Option<String>),

    /// List conversations.
    List,

    /// Switch to a conversation by list position or id.
    Switch(String),

    /// Rename the current conversation.
    Rename(String),

    /// Delete a conversation by list position or id; `None` deletes the current one.
    Delete(Option<String>),

    /// Stop the reply streaming in the current conversation.
    Stop,

    /// Re-send the last message of the current conversation.
    Retry,

    /// Send a message without following the reply; `/switch` back to watch it.
    Background(String),

    /// List personas.
    PersonaList,

    /// Search personas by name or prompt.
    PersonaSearch(String),

    /// Add a persona.
    PersonaAdd {
        /// Display name.
        name: String,
        /// System prompt.
        prompt: String,
    },

    /// Replace the prompt of an existing persona.
    PersonaEdit {
        /// Display name of the persona to edit.
        name: String,
        /// New system prompt.
        prompt: String,
    },

    /// Remove a persona by name.
    PersonaRemove(String),

    /// Attach an image to the next message.
    AttachImage(String),

    /// Attach a document to the next message.
    AttachDocument(String),

    /// Drop pending attachments.
    ClearAttachments,

    /// Display help information.
    Help,

    /// Exit the chat application.
    Quit,

    /// Report a parsing error back to the caller.
    Invalid(String),
}

/// Parses user input for slash commands.
///
/// Returns `Some(ChatCommand)` if the input is a valid command,
/// or `None` if it should be treated as a regular message.
///
/// # Examples
///
/// ```
/// # use chatlite::chat::parse_command;
/// assert!(parse_command("/quit").is_some());
/// assert!(parse_command("/switch 2").is_some());
/// assert!(parse_command("Hello there!").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let input = input.trim();

    if !input.starts_with('/') {
        return None;
    }

    let mut parts = input[1..].splitn(2, ' ');
    let command = parts.next()?.to_lowercase();
    let argument = parts.next().map(|s| s.trim()).filter(|s| !s.is_empty());

    let result = match command.as_str() {
        "new" => ChatCommand::New(argument.map(|s| s.to_string())),
        "list" | "ls" => ChatCommand::List,
        "switch" | "sw" => required(argument, "/switch requires a number or id", |arg| {
            ChatCommand::Switch(arg.to_string())
        }),
        "rename" => required(argument, "/rename requires a title", |arg| {
            ChatCommand::Rename(arg.to_string())
        }),
        "delete" | "rm" => ChatCommand::Delete(argument.map(|s| s.to_string())),
        "stop" => ChatCommand::Stop,
        "retry" => ChatCommand::Retry,
        "bg" => required(argument, "/bg requires a message", |arg| {
            ChatCommand::Background(arg.to_string())
        }),
        "persona" | "personas" => parse_persona_command(argument),
        "image" | "img" => required(argument, "/image requires a file path", |arg| {
            ChatCommand::AttachImage(arg.to_string())
        }),
        "doc" | "file" => required(argument, "/doc requires a file path", |arg| {
            ChatCommand::AttachDocument(arg.to_string())
        }),
        "detach" => ChatCommand::ClearAttachments,
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        _ => ChatCommand::Invalid(format!("Unknown command: /{}", command)),
    };

    Some(result)
}

fn required<F>(argument: Option<&str>, missing: &str, constructor: F) -> ChatCommand
where
    F: Fn(&str) -> ChatCommand,
{
    match argument {
        Some(arg) => constructor(arg),
        None => ChatCommand::Invalid(missing.to_string()),
    }
}

fn parse_persona_command(argument: Option<&str>) -> ChatCommand {
    let Some(arg) = argument else {
        return ChatCommand::PersonaList;
    };

    let mut parts = arg.splitn(2, ' ');
    let action = parts.next().unwrap_or_default();
    let rest = parts.next().map(|s| s.trim()).filter(|s| !s.is_empty());
    match action.to_lowercase().as_str() {
        "list" => ChatCommand::PersonaList,
        "search" => ChatCommand::PersonaSearch(rest.unwrap_or_default().to_string()),
        "add" | "edit" => {
            let Some((name, prompt)) = rest.and_then(split_definition) else {
                return ChatCommand::Invalid(format!(
                    "/persona {action} expects '<name> :: <prompt>'"
                ));
            };
            if action.eq_ignore_ascii_case("add") {
                ChatCommand::PersonaAdd { name, prompt }
            } else {
                ChatCommand::PersonaEdit { name, prompt }
            }
        }
        "remove" | "rm" => required(rest, "/persona remove requires a name", |name| {
            ChatCommand::PersonaRemove(name.to_string())
        }),
        _ => ChatCommand::Invalid(
            "Unrecognized /persona action (use list, search, add, edit, or remove)".to_string(),
        ),
    }
}

fn split_definition(definition: &str) -> Option<(String, String)> {
    let (name, prompt) = definition.split_once("::")?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), prompt.trim().to_string()))
}

/// Returns help text describing available commands.
pub fn help_text() -> &'static str {
    r#"Available commands:
  /new [persona]         Start a new conversation (optionally with a persona)
  /list                  List conversations
  /switch <n|id>         Switch to a conversation
  /rename <title>        Rename the current conversation
  /delete [n|id]         Delete a conversation (default: current)
  /stop                  Stop the reply in progress
  /retry                 Re-send the last message
  /bg <message>          Send without waiting; /switch back to watch the reply
  /persona [list]        List personas
  /persona search <q>    Search personas by name or prompt
  /persona add <name> :: <prompt>
                         Add a persona
  /persona edit <name> :: <prompt>
                         Replace a persona's prompt
  /persona remove <name> Remove a persona
  /image <file>          Attach an image to the next message
  /doc <file>            Attach a document to the next message
  /detach                Drop pending attachments
  /help                  Show this help message
  /quit                  Exit the chat"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_quit_commands() {
        assert_eq!(parse_command("/quit"), Some(ChatCommand::Quit));
        assert_eq!(parse_command("/exit"), Some(ChatCommand::Quit));
        assert_eq!(parse_command("/q"), Some(ChatCommand::Quit));
        assert_eq!(parse_command("  /quit  "), Some(ChatCommand::Quit));
    }

    #[test]
    fn parse_conversation_commands() {
        assert_eq!(parse_command("/new"), Some(ChatCommand::New(None)));
        assert_eq!(
            parse_command("/new Poet"),
            Some(ChatCommand::New(Some("Poet".to_string())))
        );
        assert_eq!(parse_command("/LIST"), Some(ChatCommand::List));
        assert_eq!(
            parse_command("/switch 2"),
            Some(ChatCommand::Switch("2".to_string()))
        );
        assert_eq!(
            parse_command("/rename   Trip planning  "),
            Some(ChatCommand::Rename("Trip planning".to_string()))
        );
        assert_eq!(parse_command("/delete"), Some(ChatCommand::Delete(None)));
        assert_eq!(parse_command("/stop"), Some(ChatCommand::Stop));
        assert_eq!(parse_command("/retry"), Some(ChatCommand::Retry));
        assert_eq!(
            parse_command("/bg write a long poem"),
            Some(ChatCommand::Background("write a long poem".to_string()))
        );
    }

    #[test]
    fn missing_arguments_are_invalid() {
        assert!(matches!(
            parse_command("/switch"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("requires")
        ));
        assert!(matches!(
            parse_command("/rename"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("title")
        ));
        assert!(matches!(
            parse_command("/image"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("path")
        ));
    }

    #[test]
    fn parse_persona_commands() {
        assert_eq!(parse_command("/persona"), Some(ChatCommand::PersonaList));
        assert_eq!(
            parse_command("/persona search verse"),
            Some(ChatCommand::PersonaSearch("verse".to_string()))
        );
        assert_eq!(
            parse_command("/persona add Poet :: Answer in verse."),
            Some(ChatCommand::PersonaAdd {
                name: "Poet".to_string(),
                prompt: "Answer in verse.".to_string(),
            })
        );
        assert_eq!(
            parse_command("/persona edit Poet::Answer in haiku."),
            Some(ChatCommand::PersonaEdit {
                name: "Poet".to_string(),
                prompt: "Answer in haiku.".to_string(),
            })
        );
        assert_eq!(
            parse_command("/persona remove Poet"),
            Some(ChatCommand::PersonaRemove("Poet".to_string()))
        );
        assert!(matches!(
            parse_command("/persona add Poet"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("::")
        ));
        assert!(matches!(
            parse_command("/persona dance"),
            Some(ChatCommand::Invalid(_))
        ));
    }

    #[test]
    fn parse_attachments() {
        assert_eq!(
            parse_command("/image cat.png"),
            Some(ChatCommand::AttachImage("cat.png".to_string()))
        );
        assert_eq!(
            parse_command("/doc notes.pdf"),
            Some(ChatCommand::AttachDocument("notes.pdf".to_string()))
        );
        assert_eq!(parse_command("/detach"), Some(ChatCommand::ClearAttachments));
    }

    #[test]
    fn non_commands() {
        assert_eq!(parse_command("Hello there!"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("  "), None);
        assert_eq!(
            parse_command("/bogus"),
            Some(ChatCommand::Invalid("Unknown command: /bogus".to_string()))
        );
    }

    #[test]
    fn help_text_not_empty() {
        let help = help_text();
        assert!(help.contains("/quit"));
        assert!(help.contains("/switch"));
        assert!(help.contains("/persona"));
        assert!(help.contains("/stop"));
    }
}

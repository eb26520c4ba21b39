//! Interactive chat client for a chatlite server.
//!
//! This binary provides a streaming REPL with multiple conversations, personas and
//! attachments. Conversations are stored under the data directory and survive restarts.
//!
//! # Usage
//!
//! ```bash
//! # Talk to a local chatlite-server
//! chatlite-chat
//!
//! # Another server, raw text framing
//! chatlite-chat --server http://chat.internal:8080/ --framing raw
//!
//! # Seed personas from a YAML file
//! chatlite-chat --personas personas.yaml
//! ```
//!
//! # Commands
//!
//! While chatting, you can use slash commands:
//! - `/help` - Show available commands
//! - `/new [persona]` - Start a conversation
//! - `/list` - List conversations
//! - `/switch <n|id>` - Switch conversations; a reply still streaming there is picked up
//! - `/bg <message>` - Send without waiting for the reply
//! - `/quit` - Exit the application
//!
//! Ctrl+C while a reply streams stops that reply.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use chatlite::chat::{
    ChatArgs, ChatCommand, ChatConfig, ChatSession, PlainTextRenderer, Renderer, help_text,
    parse_command,
};
use chatlite::{Persona, Result};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (args, _) = ChatArgs::from_command_line_relaxed("chatlite-chat [OPTIONS]");
    let config = ChatConfig::try_from(args)?;
    let use_color = config.use_color;

    let mut session = ChatSession::open(&config)?;
    let mut renderer = PlainTextRenderer::with_color(use_color);
    let mut rl = DefaultEditor::new()?;

    // Flag for interrupt handling during streaming
    let interrupted = Arc::new(AtomicBool::new(false));

    let interrupted_clone = interrupted.clone();
    ctrlc::set_handler(move || {
        interrupted_clone.store(true, Ordering::Relaxed);
    })?;

    println!("chatlite (server: {})", config.server_url);
    println!("Type /help for commands, /quit to exit\n");
    session
        .show_current(&mut renderer, interrupted.clone())
        .await?;

    loop {
        interrupted.store(false, Ordering::Relaxed);
        session.print_notices(&mut renderer).await;

        match rl.readline("You: ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                if let Some(cmd) = parse_command(line) {
                    if cmd == ChatCommand::Quit {
                        println!("Goodbye!");
                        break;
                    }
                    if let Err(err) =
                        run_command(cmd, &mut session, &mut renderer, &interrupted).await
                    {
                        renderer.print_error(&err.to_string());
                    }
                    continue;
                }

                if let Err(err) = session
                    .send_streaming(line, &mut renderer, interrupted.clone())
                    .await
                {
                    renderer.print_error(&err.to_string());
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl+C at prompt - soft interrupt
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                renderer.print_error(&format!("Input error: {}", err));
                break;
            }
        }
    }

    Ok(())
}

async fn run_command(
    cmd: ChatCommand,
    session: &mut ChatSession,
    renderer: &mut PlainTextRenderer,
    interrupted: &Arc<AtomicBool>,
) -> Result<()> {
    let store = session.store().clone();
    match cmd {
        ChatCommand::New(persona) => {
            let persona = match persona {
                Some(name) => Some(session.find_persona(&name).await?),
                None => None,
            };
            store
                .create_conversation(persona.as_ref().map(|p| &p.id))
                .await?;
            session.show_current(renderer, interrupted.clone()).await?;
        }
        ChatCommand::List => {
            let conversations = store.conversations().await;
            let mut streaming = Vec::new();
            for meta in &conversations {
                if store.is_streaming(&meta.id).await {
                    streaming.push(meta.id.clone());
                }
            }
            renderer.print_conversations(&conversations, &store.current_id().await, &streaming);
        }
        ChatCommand::Switch(selector) => {
            let id = session.select_conversation(&selector).await?;
            store.change_current(&id).await?;
            session.show_current(renderer, interrupted.clone()).await?;
        }
        ChatCommand::Rename(title) => {
            store
                .rename_conversation(&store.current_id().await, &title)
                .await?;
            renderer.print_info(&format!("Renamed to: {title}"));
        }
        ChatCommand::Delete(selector) => {
            let id = match selector {
                Some(selector) => session.select_conversation(&selector).await?,
                None => store.current_id().await,
            };
            store.delete_conversation(&id).await?;
            renderer.print_info("Conversation deleted.");
            session.show_current(renderer, interrupted.clone()).await?;
        }
        ChatCommand::Stop => {
            if store.stop(&store.current_id().await).await {
                renderer.print_info("Reply stopped.");
            } else {
                renderer.print_info("Nothing is streaming here.");
            }
        }
        ChatCommand::Retry => {
            session
                .retry_streaming(renderer, interrupted.clone())
                .await?;
        }
        ChatCommand::Background(text) => {
            session.send_background(&text).await?;
            renderer.print_info("Sent. The reply streams in the background; /list shows its progress.");
        }
        ChatCommand::PersonaList => {
            renderer.print_personas(&store.personas().await);
        }
        ChatCommand::PersonaSearch(query) => {
            renderer.print_personas(&store.search_personas(&query).await);
        }
        ChatCommand::PersonaAdd { name, prompt } => {
            store.add_persona(Persona::new(name.clone(), prompt)).await?;
            renderer.print_info(&format!("Added persona {name}."));
        }
        ChatCommand::PersonaEdit { name, prompt } => {
            let mut persona = session.find_persona(&name).await?;
            persona.prompt = prompt;
            store.update_persona(persona).await?;
            renderer.print_info(&format!("Updated persona {name}."));
        }
        ChatCommand::PersonaRemove(name) => {
            let persona = session.find_persona(&name).await?;
            store.remove_persona(&persona.id).await?;
            renderer.print_info(&format!("Removed persona {}.", persona.name));
        }
        ChatCommand::AttachImage(path) => {
            session.attach_image(&path)?;
            renderer.print_info(&format!(
                "Attached {path} ({} pending).",
                session.pending_attachments()
            ));
        }
        ChatCommand::AttachDocument(path) => {
            session.attach_document(&path)?;
            renderer.print_info(&format!(
                "Attached {path} ({} pending).",
                session.pending_attachments()
            ));
        }
        ChatCommand::ClearAttachments => {
            let dropped = session.clear_attachments();
            renderer.print_info(&format!("Dropped {dropped} attachment(s)."));
        }
        ChatCommand::Help => {
            for line in help_text().lines() {
                println!("    {}", line);
            }
        }
        ChatCommand::Quit => {}
        ChatCommand::Invalid(message) => {
            renderer.print_error(&message);
        }
    }
    Ok(())
}

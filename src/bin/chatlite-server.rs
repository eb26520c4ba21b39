//! HTTP proxy that streams chat replies from OpenAI or Azure OpenAI.
//!
//! # Usage
//!
//! ```bash
//! # OpenAI
//! OPENAI_API_KEY=sk-... chatlite-server
//!
//! # Azure OpenAI, raw text framing, on another port
//! AZURE_OPENAI_API_KEY=... \
//! AZURE_OPENAI_API_BASE_URL=https://example.openai.azure.com/ \
//! AZURE_OPENAI_DEPLOYMENT=gpt-35-turbo \
//! chatlite-server --bind 0.0.0.0:8080 --framing raw
//! ```
//!
//! Provider credentials are read on every request, so the server starts without them and
//! answers with a configuration error until they are set.

use std::sync::Arc;

use arrrg::CommandLine;
use tracing_subscriber::EnvFilter;

use chatlite::server::{AppState, ProviderSource, ServerArgs, ServerConfig, router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (args, free) = ServerArgs::from_command_line_relaxed("chatlite-server [OPTIONS]");
    if !free.is_empty() {
        eprintln!("unexpected arguments: {}", free.join(" "));
        std::process::exit(1);
    }
    let config = ServerConfig::try_from(args)?;
    let bind = config.bind.clone();
    let framing = config.framing;

    let state = Arc::new(AppState::new(ProviderSource::Env, config));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(address = %listener.local_addr()?, ?framing, "chatlite-server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

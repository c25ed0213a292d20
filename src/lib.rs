// Streaming chat engine for Ollama servers.
//
// The engine owns the request/stream/finalize cycle of a chat turn and exposes
// it through `session::ChatSession`; any front end consumes its events.

pub mod api;
pub mod buffer;
pub mod config;
pub mod error;
pub mod json;
pub mod models;
pub mod parser;
pub mod revision;
pub mod session;
pub mod splitter;
pub mod state;
pub mod stream;
pub mod terminal;

pub use api::{ChatProvider, ChatResponseChunk, OllamaProvider};
pub use config::{AppConfig, ChatSettings};
pub use error::ChatError;
pub use json::JsonValue;
pub use models::{ChatMessage, Role};
pub use session::{ChatSession, StreamHandle};
pub use state::{ChatEvent, StreamOutcome};

use anyhow::{Context, Result};
use std::path::PathBuf;

pub fn run() -> Result<()> {
    // Initialize logging
    env_logger::init();

    let config_path = match std::env::var("MOCOLAMMA_CONFIG") {
        Ok(path) => PathBuf::from(path),
        Err(_) => AppConfig::default_path()?,
    };
    let mut config = AppConfig::load(&config_path)?;
    config.apply_env_overrides();

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async {
        let session = ChatSession::with_config(&config).context("Failed to create HTTP client")?;

        match session.provider().version().await {
            Ok(version) => log::info!("Connected to Ollama {} at {}", version, config.server.base_url()),
            Err(e) => log::warn!("Server at {} is not reachable yet: {}", config.server.base_url(), e),
        }

        if config.chat.model.is_empty() {
            // Default to the first installed model
            if let Ok(models) = session.provider().list_models().await {
                if let Some(first) = models.into_iter().next() {
                    log::info!("No model configured, using {}", first.name);
                    session.update_settings(|s| s.model = first.name).await;
                }
            }
        }
        if let Err(e) = session.refresh_model_details().await {
            log::warn!("Could not read model details: {}", e);
        }

        terminal::run(session).await
    })
}

//! CLI interface for phone-agent

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::config::Config;
use crate::dispatcher::{Backend, ToolDispatcher};
use crate::session::SessionEngine;

#[derive(Parser)]
#[command(name = "phone-agent")]
#[command(about = "Voice phone-call and chat bridge for a coding assistant", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the voice bridge: JSON-RPC on stdio plus the webhook/media server
    Serve,
    /// Run the text-chat variant: JSON-RPC on stdio backed by a Telegram bot
    Chat,
    /// Parse the environment and print the resolved configuration
    Config,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::Chat => chat().await,
        Commands::Config => show_config(),
    }
}

/// Voice mode: HTTP listener in the background, tool dispatcher on stdio.
async fn serve() -> Result<()> {
    let config = Config::from_env().context("startup configuration")?;
    let engine = Arc::new(SessionEngine::new(config.clone()));

    let server_engine = engine.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = crate::server::start(server_engine).await {
            tracing::error!("http server exited: {e:#}");
        }
    });

    let dispatcher = ToolDispatcher::new(Backend::Voice(engine));
    let result = dispatcher
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await;

    server.abort();
    result
}

/// Chat mode: no HTTP surface, the Telegram poller lives inside the engine.
async fn chat() -> Result<()> {
    let config = Config::from_env().context("startup configuration")?;
    let engine = Arc::new(crate::chat::ChatEngine::new(config)?);
    engine.start_background_poll();

    let dispatcher = ToolDispatcher::new(Backend::Chat(engine));
    dispatcher
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
}

fn show_config() -> Result<()> {
    let config = Config::from_env().context("startup configuration")?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

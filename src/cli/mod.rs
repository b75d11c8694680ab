use crate::agent::AgentLoop;
use crate::bus::Bus;
use crate::channels::cli::CliChannel;
use crate::channels::discord::DiscordChannel;
use crate::channels::manager::Manager;
use crate::channels::slack::SlackChannel;
use crate::channels::telegram::TelegramChannel;
use crate::channels::whatsapp::WhatsAppChannel;
use crate::config::{load_config, Config};
use crate::llm::Client;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pincer", version, about = "Multi-channel chat-agent runtime")]
struct Cli {
    /// Config file (default: ~/.pincer/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway: channels, bus, and the reply loop
    Gateway {
        /// Override the LLM provider (e.g. anthropic, openai, gemini)
        #[arg(long)]
        provider: Option<String>,
        /// Override the model id
        #[arg(long)]
        model: Option<String>,
        /// Echo mode: test channel connectivity without an LLM
        #[arg(long)]
        echo: bool,
    },
    /// List available models from the configured provider
    Models,
    /// Probe a single model id with a minimal request
    Probe { model: String },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Gateway {
            provider,
            model,
            echo,
        } => run_gateway(config, provider, model, echo).await,
        Commands::Models => run_models(config).await,
        Commands::Probe { model } => run_probe(config, &model).await,
    }
}

async fn run_gateway(
    mut config: Config,
    provider: Option<String>,
    model: Option<String>,
    echo: bool,
) -> Result<()> {
    if let Some(provider) = provider {
        config.llm.provider = provider;
    }
    if let Some(model) = model {
        config.llm.model = model;
    }

    let bus = Arc::new(Bus::new(config.bus_capacity));
    let manager = Arc::new(Manager::new(bus.clone()));

    let mut enabled = 0;
    if config.channels.telegram.enabled {
        if config.channels.telegram.token.trim().is_empty() {
            warn!("telegram enabled but token is empty, skipping");
        } else {
            manager.add(Arc::new(TelegramChannel::new(
                config.channels.telegram.clone(),
                bus.clone(),
            )));
            enabled += 1;
        }
    }
    if config.channels.slack.enabled {
        if config.channels.slack.bot_token.trim().is_empty() {
            warn!("slack enabled but botToken is empty, skipping");
        } else {
            manager.add(Arc::new(SlackChannel::new(
                config.channels.slack.clone(),
                bus.clone(),
            )));
            enabled += 1;
        }
    }
    if config.channels.discord.enabled {
        if config.channels.discord.token.trim().is_empty() {
            warn!("discord enabled but token is empty, skipping");
        } else {
            manager.add(Arc::new(DiscordChannel::new(
                config.channels.discord.clone(),
                bus.clone(),
            )));
            enabled += 1;
        }
    }
    if config.channels.whatsapp.enabled {
        manager.add(Arc::new(WhatsAppChannel::new(
            config.channels.whatsapp.clone(),
            bus.clone(),
        )));
        enabled += 1;
    }
    if config.channels.cli.enabled || enabled == 0 {
        if enabled == 0 {
            info!("no channels configured, starting with the cli channel");
        }
        manager.add(Arc::new(CliChannel::new(bus.clone())));
    }

    let llm = if echo {
        None
    } else {
        Some(Arc::new(Client::new(&config.llm)))
    };

    let root = CancellationToken::new();
    manager.start_all(&root);

    let agent = AgentLoop::new(bus, llm);
    let agent_task = tokio::spawn(agent.run(root.child_token()));

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    root.cancel();
    manager.stop_all().await;
    let _ = agent_task.await;

    for (name, status) in manager.status() {
        match status.last_error {
            Some(err) => info!("channel {}: stopped, last error: {}", name, err),
            None => info!("channel {}: stopped", name),
        }
    }
    Ok(())
}

async fn run_models(config: Config) -> Result<()> {
    let client = Client::new(&config.llm);
    println!("fetching models for provider: {}...", client.provider);
    let mut models = client.list_models().await?;
    models.sort_by(|a, b| a.id.cmp(&b.id));

    println!("\n{:<40}", "MODEL ID");
    println!("{}", "-".repeat(40));
    for model in &models {
        println!("{:<40}", model.id);
    }
    println!("\ntotal: {} models", models.len());
    Ok(())
}

async fn run_probe(config: Config, model: &str) -> Result<()> {
    let client = Client::new(&config.llm);
    println!("probing {} on provider {}...", model, client.provider);
    let info = client.probe_model(model).await;
    let status = info
        .status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("{:<40} {}", info.id, status);
    Ok(())
}

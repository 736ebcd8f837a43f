//! CLI interface for the call engine (§2 ambient stack): `clap` derive
//! subcommands to dial a number, run the hosted media-stream server, drive
//! SIP trunk registration, and inspect config — same shape as the teacher's
//! own `Cli` in this file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::EngineConfig;
use crate::engine::CallEngine;
use crate::types::AgentProfile;

#[derive(Parser)]
#[command(name = "voice-call-engine")]
#[command(about = "Real-time voice-agent call engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register with the configured SIP trunk and place an outgoing call.
    Dial {
        /// E.164 destination number.
        number: String,
        /// Path to a JSON/TOML agent profile (model/voice/transcriber config).
        #[arg(short, long)]
        agent: PathBuf,
        /// Call id to tag the call record with (defaults to a random id).
        #[arg(short, long)]
        call_id: Option<String>,
    },
    /// Run the hosted media-stream WebSocket server.
    Serve {
        /// Path to a JSON/TOML agent directory file, mapping agent ids to profiles.
        #[arg(short, long)]
        agents: Option<PathBuf>,
    },
    /// Register with the configured SIP trunk and exit.
    Register,
    /// Inspect or manage the on-disk configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the resolved configuration as TOML.
    Show,
    /// Print the path to the config file.
    Path,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Dial { number, agent, call_id } => dial(number, agent, call_id).await,
        Commands::Serve { agents } => serve(agents).await,
        Commands::Register => register().await,
        Commands::Config { command } => config_command(command),
    }
}

async fn dial(number: String, agent_path: PathBuf, call_id: Option<String>) -> Result<()> {
    let config = EngineConfig::load()?;
    let profile = load_agent_profile(&agent_path)?;

    let engine = CallEngine::new(config);
    engine.register().await.context("SIP trunk registration failed")?;

    let call_id = call_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let record = engine.dial(call_id, number, profile).await?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn serve(agents_path: Option<PathBuf>) -> Result<()> {
    let config = Arc::new(EngineConfig::load()?);

    let profiles: Arc<dyn crate::bridge::AgentProfileStore> = match agents_path {
        Some(path) => {
            let store = crate::bridge::InMemoryAgentProfileStore::new();
            let contents = std::fs::read_to_string(&path).with_context(|| format!("reading agent directory {}", path.display()))?;
            let directory: std::collections::HashMap<String, AgentProfile> = parse_profile_file(&path, &contents)?;
            for (agent_id, profile) in directory {
                store.insert(agent_id, profile).await;
            }
            Arc::new(store)
        }
        None => crate::server::empty_profile_store(),
    };

    crate::server::start(config, profiles).await
}

async fn register() -> Result<()> {
    let config = EngineConfig::load()?;
    let engine = CallEngine::new(config);
    engine.register().await.context("SIP trunk registration failed")?;
    println!("registered with SIP trunk");
    Ok(())
}

fn config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = EngineConfig::load()?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommands::Path => {
            println!("{}", crate::config::config_path()?.display());
        }
    }
    Ok(())
}

fn load_agent_profile(path: &PathBuf) -> Result<AgentProfile> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading agent profile {}", path.display()))?;
    parse_profile_file(path, &contents)
}

fn parse_profile_file<T: serde::de::DeserializeOwned>(path: &PathBuf, contents: &str) -> Result<T> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(contents).with_context(|| format!("parsing {} as TOML", path.display())),
        _ => serde_json::from_str(contents).with_context(|| format!("parsing {} as JSON", path.display())),
    }
}

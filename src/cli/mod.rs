//! Command-line interface.

mod admin;
mod route;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use zeptocache::logging::init_tracing;
use zeptocache::Config;

#[derive(Parser)]
#[command(name = "zeptocache")]
#[command(version)]
#[command(about = "Latency-tiered response cache for conversational replies")]
struct Cli {
    /// Config file (defaults to ~/.zeptocache/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Route a message through the cache tiers using a demo responder
    Route {
        /// Message to route
        message: String,
        /// Request context as a JSON object
        #[arg(long)]
        context: Option<String>,
        /// Route the same message this many times
        #[arg(long, default_value_t = 1)]
        repeat: usize,
        /// Warmup file loaded before routing
        #[arg(long)]
        warmup: Option<PathBuf>,
    },
    /// Print cache statistics as JSON
    Stats {
        /// Warmup file loaded first
        #[arg(long)]
        warmup: Option<PathBuf>,
    },
    /// Load a warmup file into the configured store
    Warmup {
        /// JSON file with `decisions`, `exact` and `categories`
        path: PathBuf,
    },
    /// Clear an allow-listed namespace
    Clear {
        namespace: String,
    },
    /// Show one raw entry
    Get {
        key: String,
    },
    /// Delete one raw entry
    Delete {
        key: String,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the default config file path
    Path,
    /// Validate the configuration and exit
    Check,
}

/// Load config from `--config` or the default location.
fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let mut config = Config::load_from_path(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            config.apply_env_overrides();
            config.validate()?;
            config
        }
        None => Config::load().context("Failed to load config")?,
    };
    Ok(config)
}

pub(crate) async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    // `config check` reports load errors itself; every other command needs a
    // valid config.
    let loaded = load_config(cli.config.as_ref());
    match cli.command {
        Commands::Config { action } => admin::cmd_config(&action, loaded),
        Commands::Route {
            message,
            context,
            repeat,
            warmup,
        } => {
            route::cmd_route(&loaded?, &message, context.as_deref(), repeat, warmup.as_deref())
                .await
        }
        Commands::Stats { warmup } => admin::cmd_stats(&loaded?, warmup.as_deref()).await,
        Commands::Warmup { path } => admin::cmd_warmup(&loaded?, &path).await,
        Commands::Clear { namespace } => admin::cmd_clear(&loaded?, &namespace).await,
        Commands::Get { key } => admin::cmd_get(&loaded?, &key).await,
        Commands::Delete { key } => admin::cmd_delete(&loaded?, &key).await,
    }
}

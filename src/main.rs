//! CLI entry point for the threadrun server.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;

mod client;
mod config;
mod error_taxonomy;
mod llm_client;
mod logging;
mod models;
mod run_coordinator;
mod runtime_api;
mod stream_protocol;
mod thread_store;
mod token_aggregator;

use crate::config::{Config, ProviderKind};
use crate::runtime_api::RuntimeApiOptions;
use crate::thread_store::ThreadStore;

#[derive(Parser, Debug)]
#[command(
    name = "threadrun",
    author,
    version,
    about = "Conversational thread server with cancellable streaming runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Config profile name
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Serve the HTTP API (default)
    Serve(ServeArgs),
    /// List stored threads
    Threads {
        /// Maximum number of threads to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Check configuration, credentials, and storage
    Doctor,
}

#[derive(Args, Debug, Clone, Default)]
struct ServeArgs {
    /// Bind address
    #[arg(long)]
    host: Option<String>,
    /// Bind port
    #[arg(short, long)]
    port: Option<u16>,
    /// SQLite database path
    #[arg(long)]
    db: Option<PathBuf>,
    /// Use the built-in mock provider instead of DeepSeek
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let mut config = Config::load(cli.config.clone(), cli.profile.as_deref())?;
    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => {
            apply_serve_args(&mut config, &args);
            let options = RuntimeApiOptions {
                host: config.host(),
                port: config.port(),
            };
            runtime_api::run_http_server(config, options).await
        }
        Commands::Threads { limit } => list_threads(&config, limit).await,
        Commands::Doctor => {
            run_doctor(&config, cli.config);
            Ok(())
        }
    }
}

fn apply_serve_args(config: &mut Config, args: &ServeArgs) {
    if let Some(host) = args.host.clone() {
        config.host = Some(host);
    }
    if let Some(port) = args.port {
        config.port = Some(port);
    }
    if let Some(db) = args.db.as_ref() {
        config.database_path = Some(db.to_string_lossy().into_owned());
    }
    if args.mock {
        config.provider = Some(ProviderKind::Mock.as_str().to_string());
    }
}

async fn list_threads(config: &Config, limit: usize) -> Result<()> {
    let path = config.database_path();
    let store = ThreadStore::open_sqlite(&path)
        .with_context(|| format!("Failed to open thread store at {}", path.display()))?;
    let threads = store.list().await?;
    if threads.is_empty() {
        println!("No threads in {}", path.display());
        return Ok(());
    }

    println!("{:<38} {:>8}  {:<20}  Preview", "Thread", "Messages", "Updated");
    for summary in threads.into_iter().take(limit) {
        println!(
            "{:<38} {:>8}  {:<20}  {}",
            summary.thread_id,
            summary.message_count,
            summary.updated_at.format("%Y-%m-%d %H:%M:%S"),
            summary.preview.unwrap_or_default().replace('\n', " ")
        );
    }
    Ok(())
}

fn run_doctor(config: &Config, config_path: Option<PathBuf>) {
    println!("threadrun doctor");
    println!("================");
    println!("  version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Configuration:");
    match config::resolve_load_config_path(config_path) {
        Some(path) if path.exists() => println!("  ok  config file {}", path.display()),
        Some(path) => println!("  --  no config file at {} (using defaults)", path.display()),
        None => println!("  --  no config path resolved (using defaults)"),
    }
    println!("  ok  listen {}:{}", config.host(), config.port());
    println!("  ok  run policy {}", config.run_policy().as_str());
    println!();

    println!("Provider:");
    match config.provider() {
        ProviderKind::Mock => println!("  ok  mock provider (model {})", config.model()),
        ProviderKind::DeepSeek => {
            println!("  ok  deepseek at {} (model {})", config.deepseek_base_url(), config.model());
            match config.deepseek_api_key() {
                Ok(_) => println!("  ok  API key configured"),
                Err(err) => println!("  !!  {err}"),
            }
        }
    }
    println!();

    println!("Storage:");
    let path = config.database_path();
    match ThreadStore::open_sqlite(&path) {
        Ok(_) => println!("  ok  thread store {}", path.display()),
        Err(err) => println!("  !!  thread store {}: {err}", path.display()),
    }
}

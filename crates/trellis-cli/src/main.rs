//! Trellis CLI
//!
//! Runs the sync engine against a note server and reports connection
//! status and notifications on the terminal.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trellis_core::sync::{
    spawn_supervisor, AuthPhase, ChangeStreamConsumer, ClockSyncPhase, ConflictReconciler,
    ConnectionContext, ConsumerOptions, HandshakePipeline, SessionGatePhase, SupervisorConfig,
    SyncStatus, WsChannelFactory,
};
use trellis_core::{
    AppReloader, Config, HttpServerApi, MirrorGraph, ProtectedSession, ServerApi, UserNotifier,
};

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Trellis - client-side mirror sync for a note server")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to a config file (defaults to ~/.config/trellis/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server base URL (overrides config)
    #[arg(long, global = true)]
    server_url: Option<String>,

    /// Surface processing errors instead of reloading
    #[arg(long, global = true)]
    debug_sync: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the server and sync until interrupted
    Run,
    /// Show the effective configuration
    Config,
}

/// Prints notifications to stderr.
struct TerminalNotifier;

impl UserNotifier for TerminalNotifier {
    fn toast(&self, message: &str) {
        eprintln!("* {}", message);
    }

    fn connection_lost(&self) {
        eprintln!("! Connection to the server was lost, retrying...");
    }

    fn connection_restored(&self) {
        eprintln!("* Connection restored");
    }

    fn permanent_failure(&self, message: &str) {
        eprintln!("!! {}", message);
    }
}

/// A CLI has no UI to reload; start over from a fresh mirror by exiting.
struct ExitReloader;

impl AppReloader for ExitReloader {
    fn reload(&self) {
        eprintln!("!! Mirror diverged beyond repair; please restart trellis");
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path).context("Failed to load configuration")?,
        None => Config::load().context("Failed to load configuration")?,
    };
    if let Some(ref url) = cli.server_url {
        config.server_url = url.clone();
    }
    if cli.debug_sync {
        config.debug_sync = true;
    }
    Ok(config)
}

async fn run(config: Config) -> Result<()> {
    let api: Arc<dyn ServerApi> = Arc::new(HttpServerApi::new(&config.server_url));
    let graph = Arc::new(Mutex::new(MirrorGraph::new()));
    let notifier: Arc<dyn UserNotifier> = Arc::new(TerminalNotifier);
    let reloader: Arc<dyn AppReloader> = Arc::new(ExitReloader);
    let session = Arc::new(ProtectedSession::new());
    let ctx = Arc::new(ConnectionContext::new());

    let consumer = ChangeStreamConsumer::new(
        graph.clone(),
        api.clone(),
        notifier.clone(),
        reloader.clone(),
        ConsumerOptions::from_config(&config),
    );

    let mut pipeline = HandshakePipeline::new();
    pipeline.register(Arc::new(AuthPhase::new(
        api.clone(),
        ctx.clone(),
        notifier.clone(),
    )));
    pipeline.register(Arc::new(ClockSyncPhase::new(api.clone())));
    pipeline.register(Arc::new(SessionGatePhase::new(
        api.clone(),
        session.clone(),
    )));
    pipeline.register_reconnect(Arc::new(ConflictReconciler::new(
        graph.clone(),
        api.clone(),
        session.clone(),
        Vec::new(),
    )));

    let factory = Arc::new(WsChannelFactory::new(config.channel_url()));
    let handle = spawn_supervisor(
        SupervisorConfig::default(),
        factory,
        Arc::new(pipeline),
        consumer,
        notifier,
        reloader,
        ctx,
    );

    eprintln!("Syncing with {} (ctrl-c to stop)", config.server_url);
    let mut status_rx = handle.subscribe_status();
    loop {
        tokio::select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *status_rx.borrow();
                eprintln!("  status: {:?}", status);
                if status == SyncStatus::PermanentlyFailed {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Shutting down...");
                handle.shutdown().await;
                break;
            }
        }
    }

    Ok(())
}

fn show_config(config: &Config) {
    println!("server_url   = {}", config.server_url);
    println!("channel_url  = {}", config.channel_url());
    println!("debug_sync   = {}", config.debug_sync);
    println!("apply_budget = {}s", config.apply_timeout().as_secs());
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Config => {
            show_config(&config);
            Ok(())
        }
    }
}

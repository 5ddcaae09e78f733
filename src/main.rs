//! netprobe-agent binary entry point.
//!
//! Parses the process flags, wires logging, and hands control to the
//! `Agent` supervisor until a signal or fatal error ends the run.
//! Exit code 0 on clean shutdown, 1 on startup or runtime fatal error.

use anyhow::Result;
use clap::Parser;
use mimalloc::MiMalloc;
use netprobe_agent::{Agent, AgentConfig};
use std::path::PathBuf;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "netprobe-agent")]
#[command(version = netprobe_agent::constants::VERSION)]
#[command(about = "Distributed network-probe agent")]
struct Cli {
    /// Path to the configuration file (default: ~/.agent/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity.
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"])]
    log_level: String,

    /// Write logs to this file instead of the console.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Suppress console log output.
    #[arg(long)]
    no_console: bool,
}

/// Maps the operator-facing level names onto `log` filter levels.
fn filter_for(level: &str) -> &'static str {
    match level {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" => "error",
        // `log` has no separate critical level; map it to error.
        "CRITICAL" => "error",
        _ => "info",
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter_for(&cli.log_level)));
    builder.format_timestamp_secs();

    if let Some(ref path) = cli.log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)
            .map_err(|e| anyhow::anyhow!("Failed to create log file {}: {e}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    } else if cli.no_console {
        builder.target(env_logger::Target::Pipe(Box::new(std::io::sink())));
    }

    builder.init();

    // Log panics before the default handler takes over.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        default_hook(panic_info);
    }));

    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => log::info!("SIGINT received"),
        _ = sigterm.recv() => log::info!("SIGTERM received"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = AgentConfig::load(cli.config.as_deref());
    let agent = Agent::new(config)?;

    let shutdown = agent.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    agent.start().await?;
    let outcome = agent.run().await;
    agent.stop().await;
    outcome
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    // The dependency graph enables more than one rustls crypto backend;
    // install the process default once so every TLS config builder agrees.
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        log::debug!("rustls crypto provider was already installed");
    }

    log::info!("netprobe-agent v{} starting", netprobe_agent::constants::VERSION);

    if let Err(e) = run(cli).await {
        log::error!("Fatal: {e:#}");
        eprintln!("netprobe-agent: {e:#}");
        std::process::exit(1);
    }
}

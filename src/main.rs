use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, EnvFilter};

use conntrack_accounting::agent::Agent;
use conntrack_accounting::config::Config;
use conntrack_accounting::conntrack::tool::ConntrackTool;

/// Per-interval traffic accounting from the kernel connection tracker.
#[derive(Parser)]
#[command(name = "conntrack-accounting", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("conntrack-accounting {}", version::full());
        return Ok(());
    }

    // Logs go to stderr; stdout may carry interval output.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate().context("validating default config")?;
            cfg
        }
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting conntrack-accounting",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<&'static str>();

    // Register before spawning so a failure is reported, not swallowed.
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sighup.recv() => "SIGHUP",
        };

        tracing::info!(signal = name, "received signal, shutting down");
        let _ = shutdown_tx.send(name);
    });

    let source = ConntrackTool::from_config(&cfg.conntrack);
    let agent = Agent::new(cfg, source)?;
    agent.run(shutdown_rx).await?;

    tracing::info!("conntrack-accounting stopped");

    Ok(())
}

use clap::{Parser, Subcommand};
use dstream::error::EXIT_OK;
use dstream::executor::Command;
use dstream::{logging, router, Config, Error, Executor, Ingester, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "dstream")]
#[command(about = "Change data capture runtime and provider task runner", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "dstream.toml", global = true)]
    config: PathBuf,

    #[arg(long, value_name = "LEVEL", global = true, help = "debug, info, warn or error")]
    log_level: Option<String>,

    #[arg(long, global = true, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[command(subcommand)]
    command: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Monitor configured tables and publish changes to the ingest queue
    Ingester,
    /// Forward ingest-queue messages to their destination topics
    Router,
    /// Run a task's providers
    Run { task: String },
    /// Send the init command to a task's providers
    Init { task: String },
    /// Send the destroy command to a task's providers
    Destroy { task: String },
    /// Send the plan command to a task's providers
    Plan { task: String },
    /// Send the status command to a task's providers
    Status { task: String },
}

impl Role {
    fn task(&self) -> Option<(&str, Command)> {
        match self {
            Role::Ingester | Role::Router => None,
            Role::Run { task } => Some((task, Command::Run)),
            Role::Init { task } => Some((task, Command::Init)),
            Role::Destroy { task } => Some((task, Command::Destroy)),
            Role::Plan { task } => Some((task, Command::Plan)),
            Role::Status { task } => Some((task, Command::Status)),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_level.as_deref(), args.json_logs);

    match run(args).await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            if !matches!(e, Error::Shutdown) {
                error!("{}", e);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("Loading configuration from {:?}", args.config);
    let config = Config::from_file(&args.config)?;

    let cancel = CancellationToken::new();
    let interrupted = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone(), interrupted.clone()));

    match &args.command {
        Role::Ingester => {
            Ingester::new(config)?.run(cancel).await?;
        }
        Role::Router => {
            router::serve(&config, cancel).await?;
        }
        role => {
            if let Some((name, command)) = role.task() {
                let task = config.task(name)?;
                Executor::new().execute(task, command, cancel).await?;
            }
        }
    }

    if interrupted.is_cancelled() {
        return Err(Error::Shutdown);
    }
    Ok(())
}

/// Cancels `cancel` on SIGINT or SIGTERM and records the interruption.
async fn watch_signals(cancel: CancellationToken, interrupted: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Received Ctrl+C");
    }

    info!("Shutting down gracefully");
    interrupted.cancel();
    cancel.cancel();
}

//! MediaForge CLI - Main entry point

mod commands;

use clap::{Parser, Subcommand};
use mediaforge_foundation::QueueConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// MediaForge - background media job runner
#[derive(Parser, Debug)]
#[command(name = "mediaforge")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Override the number of concurrent jobs
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect the encoder binary and hardware acceleration
    Probe,

    /// Print the effective queue configuration
    Config {
        /// Also write it to the project config file
        #[arg(long)]
        save: bool,
    },

    /// Run one command as a tracked job and wait for it
    Run {
        /// File the command is expected to produce
        #[arg(short, long)]
        output: PathBuf,

        /// Task type tag
        #[arg(long = "type", default_value = "render")]
        task_type: String,

        /// Human-readable description
        #[arg(long)]
        description: Option<String>,

        /// Insert hardware acceleration flags when available
        #[arg(long)]
        hwaccel: bool,

        /// Process timeout in seconds (0 disables)
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Command and arguments, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging; stdout is reserved for JSON output
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match dispatch(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::from(commands::exit_code(&err))
        }
    }
}

async fn dispatch(args: Args) -> anyhow::Result<()> {
    let mut config = QueueConfig::load()?;
    if let Some(max_concurrent) = args.max_concurrent {
        config = config.with_max_concurrent(max_concurrent);
        config.validate()?;
    }

    match args.command {
        Command::Probe => commands::probe(&config).await,
        Command::Config { save } => commands::show_config(&config, save),
        Command::Run {
            output,
            task_type,
            description,
            hwaccel,
            timeout_secs,
            command,
        } => {
            if let Some(secs) = timeout_secs {
                config.process_timeout_secs = secs;
            }
            let request = commands::RunRequest {
                output,
                task_type,
                description,
                hwaccel,
                command,
            };
            commands::run(config, request).await
        }
    }
}

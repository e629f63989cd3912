//! Switchback operator CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "switchback")]
#[command(about = "Build dispatch queue CLI", long_about = None)]
struct Cli {
    /// Path to the system configuration
    #[arg(long, env = "SWITCHBACK_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL, overriding the configuration file
    #[arg(long, env = "SWITCHBACK_REDIS_URL")]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a system configuration file
    ValidateConfig {
        /// Path to the configuration file
        #[arg(default_value = "switchback.kdl")]
        path: PathBuf,
    },
    #[command(flatten)]
    Queue(QueueCommands),
}

/// Commands that talk to the coordination store.
#[derive(Subcommand)]
enum QueueCommands {
    /// Admit a job described by a JSON file
    Enqueue {
        /// Path to the job description
        file: PathBuf,
    },
    /// Show a job and its status
    Job {
        /// Job ID
        id: String,
    },
    /// Show the result of a finished job
    Result {
        /// Job ID
        id: String,
    },
    /// Print a job's build log
    Logs {
        /// Job ID
        id: String,
        /// Start after this log position
        #[arg(long)]
        from: Option<String>,
        /// Keep following new lines until interrupted
        #[arg(short, long)]
        follow: bool,
    },
    /// Cancel a queued or building job
    Cancel {
        /// Job ID
        id: String,
    },
    /// Admit a failed or cancelled job again
    Retry {
        /// Job ID
        id: String,
    },
    /// List registered workers
    Workers,
    /// Show queue depth and pending callbacks
    Stats,
    /// Redeliver failed callbacks until interrupted
    DeliverCallbacks,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Commands::ValidateConfig { path } => return commands::validate_config(&path),
        Commands::Queue(command) => command,
    };

    let config = commands::load_system_config(cli.config.as_deref(), cli.redis_url)?;
    let queue = commands::connect(&config).await?;

    match command {
        QueueCommands::Enqueue { file } => commands::jobs::enqueue(&queue, &file).await?,
        QueueCommands::Job { id } => commands::jobs::show(&queue, &id).await?,
        QueueCommands::Result { id } => commands::jobs::result(&queue, &id).await?,
        QueueCommands::Logs { id, from, follow } => {
            commands::logs::print(&queue, &id, from.as_deref(), follow).await?;
        }
        QueueCommands::Cancel { id } => commands::jobs::cancel(&queue, &id).await?,
        QueueCommands::Retry { id } => commands::jobs::retry(&queue, &id).await?,
        QueueCommands::Workers => commands::ops::workers(&queue).await?,
        QueueCommands::Stats => commands::ops::stats(&queue).await?,
        QueueCommands::DeliverCallbacks => {
            commands::ops::deliver_callbacks(queue, &config).await?;
        }
    }

    Ok(())
}

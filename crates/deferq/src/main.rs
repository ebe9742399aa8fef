//! deferq: persistent delayed job queues from the command line
//!
//! Main binary with subcommands:
//! - `add`, `remove`, `clear`, `drop`: edit a queue and persist it
//! - `list`: print the stored snapshot of a queue
//! - `run`: process jobs from one or more queues until Ctrl-C

use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod host;

use host::{HostConfig, parse_bool_env};

#[derive(Parser)]
#[command(name = "deferq")]
#[command(about = "Persistent delayed job queues", long_about = None)]
struct Cli {
    /// Directory holding queue snapshots (default: <data dir>/deferq/queues)
    #[arg(long, global = true, env = "DEFERQ_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Keep queues in memory only; nothing is read or written
    #[arg(long, global = true)]
    bypass: bool,

    /// Drop overdue jobs marked --ignore-when-overdue when a queue opens,
    /// instead of keeping them
    #[arg(long, global = true, env = "DEFERQ_DISCARD_IGNORED", value_parser = parse_bool_env, default_value = "false")]
    discard_ignored: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule a job
    Add {
        /// Queue id
        #[arg(long)]
        queue: String,

        /// Job id, unique within the queue
        #[arg(long)]
        id: String,

        /// Run the job this many seconds from now
        #[arg(long = "in", value_name = "SECS", required_unless_present = "at", conflicts_with = "at")]
        in_secs: Option<u64>,

        /// Run the job at this RFC 3339 timestamp
        #[arg(long)]
        at: Option<String>,

        /// JSON object handed to the processor
        #[arg(long)]
        data: Option<String>,

        /// Skip the job instead of running it if it is already overdue when
        /// the queue next opens
        #[arg(long)]
        ignore_when_overdue: bool,
    },

    /// Cancel a scheduled job
    Remove {
        /// Queue id
        #[arg(long)]
        queue: String,

        /// Job id
        #[arg(long)]
        id: String,
    },

    /// Cancel every job in a queue
    Clear {
        /// Queue id
        #[arg(long)]
        queue: String,
    },

    /// Cancel every job and delete the queue's snapshot
    Drop {
        /// Queue id
        #[arg(long)]
        queue: String,
    },

    /// Print the stored jobs of a queue, one JSON object per line
    List {
        /// Queue id
        #[arg(long)]
        queue: String,
    },

    /// Process jobs until interrupted, printing each executed job as JSON
    Run {
        /// Queue ids (repeatable)
        #[arg(long, required = true)]
        queue: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; stdout is reserved for job output
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "deferq=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let host = HostConfig::new(cli.store_dir, cli.bypass, cli.discard_ignored);

    match cli.command {
        Commands::Add {
            queue,
            id,
            in_secs,
            at,
            data,
            ignore_when_overdue,
        } => {
            let due = commands::parse_due(in_secs, at.as_deref(), Utc::now())
                .map_err(|e| miette::miette!("{}", e))?;
            let payload =
                commands::parse_payload(data.as_deref()).map_err(|e| miette::miette!("{}", e))?;
            let job = commands::build_job(id, due, payload, ignore_when_overdue);
            commands::add(&host, &queue, job).await
        }

        Commands::Remove { queue, id } => commands::remove(&host, &queue, &id).await,

        Commands::Clear { queue } => commands::clear(&host, &queue).await,

        Commands::Drop { queue } => commands::drop_queue(&host, &queue).await,

        Commands::List { queue } => commands::list(&host, &queue).await,

        Commands::Run { queue } => commands::run(&host, &queue).await,
    }
}

mod cmd_replay;
mod cmd_status;
mod cmd_watch;
mod workspace;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "helpq", version, about = "Classroom help queue sync core")]
struct Cli {
    /// Config file (JSON); defaults apply when missing
    #[arg(long, global = true, default_value = "helpq.json")]
    config: PathBuf,
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the current session and print session, liveness and queue
    Status {
        /// Seed file: { "<collection>": { "<key>": <document> } }
        #[arg(long)]
        seed: PathBuf,
        /// Evaluate at this instant (RFC 3339) instead of now
        #[arg(long)]
        now: Option<String>,
    },
    /// Apply a list of queue operations and print the resulting queue document
    Replay {
        /// Seed file: { "<collection>": { "<key>": <document> } }
        #[arg(long)]
        seed: PathBuf,
        /// Operations file (JSON array)
        #[arg(long)]
        ops: PathBuf,
        /// Start the replay clock at this instant (RFC 3339)
        #[arg(long)]
        now: Option<String>,
    },
    /// Run the service and log session and queue events
    Watch {
        /// Seed file: { "<collection>": { "<key>": <document> } }
        #[arg(long)]
        seed: PathBuf,
        /// How long to run, in seconds
        #[arg(long, default_value_t = 10)]
        secs: u64,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = helpq_sync::HelpQueueConfig::load(&cli.config)?;
    let rt = tokio::runtime::Runtime::new()?;

    match cli.cmd {
        Command::Status { seed, now } => rt.block_on(cmd_status::execute(&seed, config, now)),
        Command::Replay { seed, ops, now } => {
            rt.block_on(cmd_replay::execute(&seed, &ops, config, now))
        }
        Command::Watch { seed, secs } => rt.block_on(cmd_watch::execute(&seed, config, secs)),
    }
}

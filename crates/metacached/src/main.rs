//! metacached — the metadata cache daemon.
//!
//! Opens an embedded coordination store (redb) and runs a watching
//! [`metacache::ClientCache`] against it:
//! - bulk load and per-kind watchers
//! - fail-server detection on server deregistration
//! - periodic cache statistics in the log
//!
//! # Usage
//!
//! ```text
//! metacached run --data-dir /var/lib/metacache --config cache.toml
//! metacached seed --data-dir /var/lib/metacache --file seed.json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod seed;
mod serve;

#[derive(Parser)]
#[command(name = "metacached", about = "Metadata cache daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the cache until Ctrl-C.
    Run {
        /// Data directory for the coordination store.
        #[arg(long, default_value = "/var/lib/metacache")]
        data_dir: PathBuf,

        /// Cache configuration (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Statistics log interval in seconds.
        #[arg(long, default_value = "60")]
        stats_interval: u64,
    },
    /// Write key/values from a JSON file into the coordination store.
    Seed {
        /// Data directory for the coordination store.
        #[arg(long, default_value = "/var/lib/metacache")]
        data_dir: PathBuf,

        /// JSON object of key → value. String values are written verbatim,
        /// anything else as JSON.
        #[arg(long)]
        file: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,metacache=debug,metacached=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Run {
            data_dir,
            config,
            stats_interval,
        } => serve::run(data_dir, config, stats_interval).await,
        Command::Seed { data_dir, file } => {
            let written = seed::seed_file(&data_dir, &file)?;
            tracing::info!(written, file = ?file, "seed applied");
            Ok(())
        }
    }
}

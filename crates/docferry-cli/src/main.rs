use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod ui;

#[derive(Parser)]
#[command(name = "docferry")]
#[command(about = "Ferry documents from a directory or mailbox into your DMS, exactly once.")]
#[command(version)]
struct Cli {
    /// Config file (default: docferry.toml, or $DOCFERRY_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: directory watch plus mailbox polling
    Run {
        /// Output the final summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Ingest files from a directory once
    Scan {
        /// Directory to ingest. If omitted, uses [directory] root from the config.
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,

        /// Descend into subdirectories
        #[arg(long, short)]
        recursive: bool,

        /// Only ingest files with this extension (repeatable)
        #[arg(long = "ext", value_name = "EXT")]
        extensions: Vec<String>,

        /// Keep watching for new files after the initial pass
        #[arg(long)]
        watch: bool,

        /// List what would be ingested without uploading anything
        #[arg(long)]
        dry_run: bool,

        /// Output the final summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Poll the configured mailbox for attachments
    Mail {
        /// Keep polling on the configured interval
        #[arg(long, short)]
        follow: bool,

        /// Also fetch messages already marked read (IMAP only)
        #[arg(long)]
        include_read: bool,

        /// Cap how many messages one cycle fetches
        #[arg(long, value_name = "N")]
        max: Option<usize>,

        /// List what would be ingested without uploading anything
        #[arg(long)]
        dry_run: bool,

        /// Output the final summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or edit the dedup cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },

    /// Verify store and mailbox connectivity
    Check {
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Show record counts
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop one fingerprint so its content re-verifies on the next offer
    Forget {
        /// Hex SHA-256 fingerprint to drop
        #[arg(value_name = "FINGERPRINT")]
        fingerprint: String,
    },
    /// Wipe every record
    Clear {
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Route tracing to stderr so stdout is reserved for summaries and --json
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Run { json } => commands::run::run(config, json).await,
        Commands::Scan {
            path,
            recursive,
            extensions,
            watch,
            dry_run,
            json,
        } => commands::scan::run(config, path, recursive, extensions, watch, dry_run, json).await,
        Commands::Mail {
            follow,
            include_read,
            max,
            dry_run,
            json,
        } => commands::mail::run(config, follow, include_read, max, dry_run, json).await,
        Commands::Cache { command } => match command {
            CacheCommand::Stats { json } => commands::cache::stats(config, json).await,
            CacheCommand::Forget { fingerprint } => {
                commands::cache::forget(config, &fingerprint).await
            }
            CacheCommand::Clear { yes } => commands::cache::clear(config, yes).await,
        },
        Commands::Check { json } => commands::check::run(config, json).await,
    }
}

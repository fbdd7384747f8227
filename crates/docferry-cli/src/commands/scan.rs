use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use tokio::sync::watch;
use tracing::info;

use docferry_core::sources::DirectorySource;
use docferry_core::IngestionCoordinator;

use crate::commands::{build_processor, finish, load_config};
use crate::ui;

/// One-shot directory ingestion, optionally staying to watch for arrivals.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    config_path: Option<&Path>,
    path: Option<PathBuf>,
    recursive: bool,
    extensions: Vec<String>,
    keep_watching: bool,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;

    let root = path.unwrap_or_else(|| config.directory.root.clone());
    if root.as_os_str().is_empty() {
        bail!("no directory to scan: pass PATH or set [directory] root");
    }
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let recursive = recursive || config.directory.recursive;
    let extensions = if extensions.is_empty() {
        config.directory.extensions.clone()
    } else {
        extensions
    };

    let source = DirectorySource::new(root.clone(), recursive, extensions);

    if dry_run {
        let files = source.preview()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&files)?);
        } else {
            for file in &files {
                println!("{}", file.display());
            }
            ui::info(&format!(
                "{} file(s) would be ingested from {}",
                files.len(),
                root.display()
            ));
        }
        return Ok(());
    }

    let processor = build_processor(&config).await?;
    let coordinator = IngestionCoordinator::new(processor, config.ingest.max_in_flight);
    let (tx, rx) = IngestionCoordinator::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let feeder_shutdown = shutdown_rx.clone();
    let feeder = tokio::spawn(async move {
        source.scan(&tx).await?;
        if keep_watching {
            source.watch(tx, feeder_shutdown).await?;
        }
        Ok::<(), anyhow::Error>(())
    });

    // The task owns the shutdown sender; dropping it early would read as a
    // shutdown request to the coordinator and the watcher.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight uploads");
            let _ = shutdown_tx.send(true);
        }
    });

    let summary = coordinator.run(rx, shutdown_rx).await?;
    feeder
        .await
        .map_err(|err| anyhow!("scan task panicked: {err}"))??;

    finish(&summary, json)
}

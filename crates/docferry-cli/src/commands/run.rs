use std::path::Path;

use anyhow::{anyhow, bail, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use docferry_core::sources::{open_mailbox, DirectorySource, MailSource};
use docferry_core::IngestionCoordinator;

use crate::commands::{build_processor, finish, load_config};

/// Full service: every configured source feeds one coordinator until Ctrl-C.
pub async fn run(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    if !config.directory_configured() && !config.mail_configured() {
        bail!("nothing to ingest: configure [directory] root and/or [mail] server");
    }

    let processor = build_processor(&config).await?;
    let coordinator = IngestionCoordinator::new(processor, config.ingest.max_in_flight);
    let (tx, rx) = IngestionCoordinator::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut feeders: JoinSet<Result<()>> = JoinSet::new();

    if config.directory_configured() {
        if !config.directory.root.is_dir() {
            bail!(
                "[directory] root {} is not a directory",
                config.directory.root.display()
            );
        }
        let source = DirectorySource::new(
            config.directory.root.clone(),
            config.directory.recursive,
            config.directory.extensions.clone(),
        );
        let scan_existing = config.directory.scan_existing;
        let keep_watching = config.directory.watch;
        let tx = tx.clone();
        let shutdown = shutdown_rx.clone();
        feeders.spawn(async move {
            if scan_existing {
                source.scan(&tx).await?;
            }
            if keep_watching {
                source.watch(tx, shutdown).await?;
            }
            Ok(())
        });
    }

    if config.mail_configured() {
        let mailbox = open_mailbox(&config.mail).await?;
        let mut source = MailSource::new(
            mailbox,
            config.mail.allowed_senders.clone(),
            config.mail.include_read,
            config.max_messages(),
        );
        let interval = config.poll_interval();
        let tx = tx.clone();
        let shutdown = shutdown_rx.clone();
        feeders.spawn(async move { source.poll_loop(tx, interval, shutdown).await });
    }

    // The feeders hold the only remaining senders; once they return, the
    // channel drains and the coordinator finishes.
    drop(tx);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight uploads");
            let _ = shutdown_tx.send(true);
        }
    });

    let summary = coordinator.run(rx, shutdown_rx).await?;

    let mut source_error: Option<anyhow::Error> = None;
    while let Some(joined) = feeders.join_next().await {
        let result = joined
            .map_err(|err| anyhow!("source task panicked: {err}"))
            .and_then(|inner| inner);
        if let Err(err) = result {
            error!(%err, "ingestion source failed");
            source_error.get_or_insert(err);
        }
    }

    finish(&summary, json)?;
    match source_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

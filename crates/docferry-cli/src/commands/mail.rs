use std::path::Path;

use anyhow::{anyhow, bail, Result};
use tokio::sync::watch;
use tracing::info;

use docferry_core::sources::{open_mailbox, MailSource};
use docferry_core::IngestionCoordinator;

use crate::commands::{build_processor, finish, load_config};
use crate::ui;

/// Poll the configured mailbox, once or on the configured interval.
pub async fn run(
    config_path: Option<&Path>,
    follow: bool,
    include_read: bool,
    max: Option<usize>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    if !config.mail_configured() {
        bail!("no mailbox configured: set [mail] server");
    }

    let include_read = include_read || config.mail.include_read;
    let max = max.or_else(|| config.max_messages());

    let mailbox = open_mailbox(&config.mail).await?;
    let mut source = MailSource::new(
        mailbox,
        config.mail.allowed_senders.clone(),
        include_read,
        max,
    );

    if dry_run {
        let lines = source.preview().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&lines)?);
        } else if lines.is_empty() {
            ui::info("nothing to ingest");
        } else {
            for line in &lines {
                println!("{line}");
            }
        }
        return Ok(());
    }

    let processor = build_processor(&config).await?;
    let coordinator = IngestionCoordinator::new(processor, config.ingest.max_in_flight);
    let (tx, rx) = IngestionCoordinator::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let interval = config.poll_interval();
    let feeder_shutdown = shutdown_rx.clone();
    let feeder = tokio::spawn(async move {
        if follow {
            source.poll_loop(tx, interval, feeder_shutdown).await
        } else {
            source.poll_once(&tx).await.map(|_| ())
        }
    });

    // The task owns the shutdown sender; dropping it early would read as a
    // shutdown request to the coordinator and the poll loop.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight uploads");
            let _ = shutdown_tx.send(true);
        }
    });

    let summary = coordinator.run(rx, shutdown_rx).await?;
    feeder
        .await
        .map_err(|err| anyhow!("mail task panicked: {err}"))??;

    finish(&summary, json)
}

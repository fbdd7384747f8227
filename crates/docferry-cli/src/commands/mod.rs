use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use docferry_cache::DedupCache;
use docferry_core::{DocferryConfig, IngestionProcessor, RunSummary};
use docferry_remote::StoreClient;

use crate::ui;

pub mod cache;
pub mod check;
pub mod mail;
pub mod run;
pub mod scan;

pub(crate) fn load_config(path: Option<&Path>) -> Result<DocferryConfig> {
    DocferryConfig::load(path)
}

pub(crate) async fn open_cache(config: &DocferryConfig) -> Result<DedupCache> {
    let db_path = config.db_path()?;
    DedupCache::open(&db_path)
        .await
        .with_context(|| format!("failed to open dedup cache at {}", db_path.display()))
}

/// Open the cache, connect to the store and resolve configured labels.
pub(crate) async fn build_processor(config: &DocferryConfig) -> Result<Arc<IngestionProcessor>> {
    let cache = open_cache(config).await?;
    let mut client = StoreClient::new(config.store_config()?)?;
    client
        .resolve_labels()
        .await
        .context("failed to resolve document type / cabinet labels")?;
    Ok(Arc::new(IngestionProcessor::new(
        cache,
        Arc::new(client),
        config.validation_policy(),
    )))
}

/// Print the run summary; exit non-zero when any item failed so cron and
/// orchestration can alert.
pub(crate) fn finish(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else if summary.failed > 0 {
        ui::error(&summary.to_string());
    } else {
        ui::success(&summary.to_string());
    }
    if summary.failed > 0 {
        bail!(
            "{} item(s) failed and will be retried when offered again",
            summary.failed
        );
    }
    Ok(())
}

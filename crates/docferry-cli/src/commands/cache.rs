use std::path::Path;

use anyhow::Result;

use docferry_cache::Fingerprint;

use crate::commands::{load_config, open_cache};
use crate::ui;

pub async fn stats(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let cache = open_cache(&config).await?;
    let stats = cache.stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("  {:<10} {}", "database", config.db_path()?.display());
    println!("  {:<10} {}", "records", stats.total);
    println!("  {:<10} {}", "uploaded", stats.uploaded);
    println!("  {:<10} {}", "pending", stats.pending);
    Ok(())
}

pub async fn forget(config_path: Option<&Path>, fingerprint: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let cache = open_cache(&config).await?;
    let fp = Fingerprint::parse(fingerprint)?;

    if cache.forget(&fp).await? {
        ui::success(&format!(
            "dropped {fp}; that content re-verifies against the store on the next offer"
        ));
    } else {
        ui::info("no record with that fingerprint");
    }
    Ok(())
}

pub async fn clear(config_path: Option<&Path>, yes: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let cache = open_cache(&config).await?;

    if !yes
        && !ui::confirm(
            "Wipe every dedup record? Re-observed content will re-query the store first.",
        )?
    {
        ui::info("aborted");
        return Ok(());
    }

    let dropped = cache.clear().await?;
    ui::success(&format!("dropped {dropped} record(s)"));
    Ok(())
}

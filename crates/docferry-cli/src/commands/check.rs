use std::path::Path;

use anyhow::{bail, Result};
use console::style;
use serde::Serialize;

use docferry_core::config::MailProtocol;
use docferry_core::sources::open_mailbox;
use docferry_core::DocferryConfig;
use docferry_remote::StoreClient;

use crate::commands::{load_config, open_cache};

#[derive(Serialize)]
struct CheckReport {
    store: ProbeReport,
    mailbox: Option<ProbeReport>,
    cache: CacheReport,
}

#[derive(Serialize)]
struct ProbeReport {
    target: String,
    ok: bool,
    error: Option<String>,
}

#[derive(Serialize)]
struct CacheReport {
    db_path: String,
    records: i64,
}

/// Probe everything the pipeline needs before anyone schedules it.
pub async fn run(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config_path)?;

    let store = probe(config.store.base_url.clone(), probe_store(&config).await);

    let mailbox = if config.mail_configured() {
        let protocol = match config.mail.protocol {
            MailProtocol::Imap => "imap",
            MailProtocol::Pop3 => "pop3",
        };
        let target = format!("{protocol} {}:{}", config.mail.server, config.mail.port);
        Some(probe(target, probe_mailbox(&config).await))
    } else {
        None
    };

    let cache = open_cache(&config).await?;
    let report = CheckReport {
        store,
        mailbox,
        cache: CacheReport {
            db_path: config.db_path()?.display().to_string(),
            records: cache.count().await?,
        },
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_probe("store", &report.store);
        if let Some(mailbox) = &report.mailbox {
            print_probe("mailbox", mailbox);
        }
        println!(
            "  {:<10} {} record(s)   {}",
            "cache", report.cache.records, report.cache.db_path
        );
    }

    let all_ok = report.store.ok && report.mailbox.as_ref().map_or(true, |m| m.ok);
    if !all_ok {
        bail!("connectivity check failed");
    }
    Ok(())
}

fn probe(target: String, result: Result<()>) -> ProbeReport {
    match result {
        Ok(()) => ProbeReport {
            target,
            ok: true,
            error: None,
        },
        Err(err) => ProbeReport {
            target,
            ok: false,
            error: Some(format!("{err:#}")),
        },
    }
}

fn print_probe(name: &str, probe: &ProbeReport) {
    let status = if probe.ok {
        format!("{}", style("✔ reachable").green())
    } else {
        format!("{}", style("✖ unreachable").red())
    };
    println!("  {:<10} {:<24} {}", name, status, probe.target);
    if let Some(error) = &probe.error {
        println!("  {:<10} {}", "", style(error).dim());
    }
}

async fn probe_store(config: &DocferryConfig) -> Result<()> {
    let mut client = StoreClient::new(config.store_config()?)?;
    client.resolve_labels().await?;
    client.check().await?;
    Ok(())
}

async fn probe_mailbox(config: &DocferryConfig) -> Result<()> {
    let _mailbox = open_mailbox(&config.mail).await?;
    Ok(())
}

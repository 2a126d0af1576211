use anyhow::{bail, Result};
use rawloader::{fetch::HttpFetcher, pipeline, BackupDir, Config, History, Outcome, Store};
use reqwest::Client;
use std::{env, sync::Arc};
use tracing::{error, info};

fn usage() -> ! {
    eprintln!("Usage: rawloader [--force] [CONFIG] [DATASET...]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    rawloader::init_tracing("info,rawloader=info");
    info!("startup");

    // ─── 2) args & config ────────────────────────────────────────────
    let mut force = false;
    let mut positional = Vec::new();
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--force" => force = true,
            "-h" | "--help" => usage(),
            s if s.starts_with('-') => usage(),
            _ => positional.push(arg),
        }
    }
    let config_arg = positional.first().map(String::as_str);
    let only: Vec<String> = positional.iter().skip(1).cloned().collect();

    let path = rawloader::config_path(config_arg);
    let mut config = Config::load(&path)?;
    config.force |= force;
    info!(config = %path.display(), datasets = config.datasets.len(), "loaded config");

    // ─── 3) open store, snapshots, ledger ────────────────────────────
    let mut store = Store::open(&config.raw_db)?;
    let backups = BackupDir::new(&config.backup_dir)?;
    let history = History::new(&config.history_dir)?;
    let fetcher = Arc::new(HttpFetcher::new(
        Client::new(),
        config.max_retries,
        config.backoff_ms,
    ));

    // ─── 4) fetch-or-load ────────────────────────────────────────────
    let report = pipeline::run(&config, &mut store, &backups, &history, fetcher, &only).await?;

    for (name, outcome) in &report.outcomes {
        match outcome {
            Outcome::AlreadyLoaded => info!(dataset = %name, "already loaded"),
            Outcome::FromBackup { rows, fallback } => {
                info!(dataset = %name, rows, fallback, "loaded from snapshot")
            }
            Outcome::Downloaded { rows } => info!(dataset = %name, rows, "downloaded"),
            Outcome::Failed(reason) => error!(dataset = %name, %reason, "failed"),
        }
    }
    info!(
        loaded = report.loaded(),
        skipped = report.skipped(),
        failed = report.failed(),
        "all done"
    );

    if report.failed() > 0 {
        bail!("{} dataset(s) failed to load", report.failed());
    }
    Ok(())
}

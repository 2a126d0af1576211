// src/pipeline.rs

use anyhow::{anyhow, Context, Result};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::{
    sync::{mpsc, Semaphore},
    time::Instant,
};
use tracing::{error, info, instrument, warn};
use url::Url;

use crate::backup::BackupDir;
use crate::config::Config;
use crate::fetch::{decode_payload, Fetch};
use crate::history::{History, LoadEvent, LoadSource};
use crate::process::parse_csv;
use crate::store::Store;

/// What happened to one dataset during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The raw table was already there; nothing fetched.
    AlreadyLoaded,
    /// Loaded from the local snapshot. `fallback` is set when the network
    /// was tried first and failed.
    FromBackup { rows: usize, fallback: bool },
    Downloaded { rows: usize },
    Failed(String),
}

impl Outcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Outcome::FromBackup { .. } | Outcome::Downloaded { .. })
    }
}

#[derive(Debug, Default)]
pub struct Report {
    pub outcomes: BTreeMap<String, Outcome>,
}

impl Report {
    pub fn loaded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_loaded()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, Outcome::AlreadyLoaded))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.failures().len()
    }

    pub fn failures(&self) -> Vec<(&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(name, o)| match o {
                Outcome::Failed(reason) => Some((name.as_str(), reason.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&Outcome> {
        self.outcomes.get(name)
    }
}

/// Fetch-or-load every configured dataset (or just `only`) into `store`.
///
/// Tables that already exist are left alone unless `config.force` is set.
/// Downloads run concurrently; loading into the store happens one dataset at
/// a time as results arrive. A failing dataset never stops the others.
#[instrument(level = "info", skip_all, fields(datasets = config.datasets.len()))]
pub async fn run<F: Fetch + 'static>(
    config: &Config,
    store: &mut Store,
    backups: &BackupDir,
    history: &History,
    fetcher: Arc<F>,
    only: &[String],
) -> Result<Report> {
    let selected = select(config, only)?;
    let portal = config.portal_url()?;
    let mut report = Report::default();
    let mut queued: Vec<(String, Url)> = Vec::new();

    // ─── 1) skip loaded tables, serve snapshots ──────────────────────
    for name in selected {
        if !config.force && store.table_exists(&name)? {
            info!(dataset = %name, "already loaded, skipping");
            report.outcomes.insert(name, Outcome::AlreadyLoaded);
            continue;
        }

        if config.prefer_backup && backups.exists(&name) {
            match load_backup(store, backups, history, &name) {
                Ok(rows) => {
                    report
                        .outcomes
                        .insert(name, Outcome::FromBackup { rows, fallback: false });
                    continue;
                }
                Err(e) => warn!(dataset = %name, error = %format!("{:#}", e), "snapshot unusable, downloading"),
            }
        }

        match config.datasets[&name].resolve(&portal) {
            Ok(url) => queued.push((name, url)),
            Err(e) => {
                error!(dataset = %name, error = %format!("{:#}", e), "cannot resolve source");
                report.outcomes.insert(name, Outcome::Failed(format!("{:#}", e)));
            }
        }
    }

    if queued.is_empty() {
        return Ok(report);
    }
    info!("{} datasets to download", queued.len());

    // ─── 2) spawn downloader tasks ───────────────────────────────────
    let (tx, mut rx) = mpsc::channel::<(String, Url, Result<Vec<u8>>)>(queued.len());
    let sem = Arc::new(Semaphore::new(config.max_concurrent_downloads));
    let mut handles = Vec::with_capacity(queued.len());

    for (name, url) in queued {
        let fetcher = Arc::clone(&fetcher);
        let tx = tx.clone();
        let sem = Arc::clone(&sem);

        let task_name = name.clone();
        handles.push((task_name, tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            info!(dataset = %name, %url, "downloading");
            let start = Instant::now();
            let result = fetcher.fetch(&url).await;
            if result.is_ok() {
                info!(dataset = %name, elapsed = ?start.elapsed(), "downloaded");
            }
            let _ = tx.send((name, url, result)).await;
        })));
    }
    // drop the original sender so `rx.recv()` ends once every download reports
    drop(tx);

    // ─── 3) load results one at a time ───────────────────────────────
    while let Some((name, url, fetched)) = rx.recv().await {
        let outcome = match ingest_download(config, store, backups, history, &name, &url, fetched).await {
            Ok(rows) => Outcome::Downloaded { rows },
            Err(e) => {
                let reason = format!("{:#}", e);
                error!(dataset = %name, error = %reason, "download failed");
                fall_back(store, backups, history, &name, reason)
            }
        };
        report.outcomes.insert(name, outcome);
    }

    // ─── 4) await all downloader tasks ───────────────────────────────
    let (names, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
    for (name, res) in names.into_iter().zip(futures::future::join_all(handles).await) {
        let Err(e) = res else { continue };
        error!(dataset = %name, "download task panicked: {}", e);
        // a task that died before reporting still needs an outcome
        if !report.outcomes.contains_key(&name) {
            let outcome = fall_back(store, backups, history, &name, format!("download task failed: {}", e));
            report.outcomes.insert(name, outcome);
        }
    }

    Ok(report)
}

fn select(config: &Config, only: &[String]) -> Result<Vec<String>> {
    if only.is_empty() {
        return Ok(config.datasets.keys().cloned().collect());
    }
    let wanted: BTreeSet<&String> = only.iter().collect();
    wanted
        .into_iter()
        .map(|name| {
            if config.datasets.contains_key(name) {
                Ok(name.clone())
            } else {
                Err(anyhow!("dataset `{}` is not configured", name))
            }
        })
        .collect()
}

async fn ingest_download(
    config: &Config,
    store: &mut Store,
    backups: &BackupDir,
    history: &History,
    name: &str,
    url: &Url,
    fetched: Result<Vec<u8>>,
) -> Result<usize> {
    let bytes = fetched?;
    let (infer_rows, batch_size) = (config.infer_rows, config.batch_size);

    // offload the parse to the blocking pool
    let batch = tokio::task::spawn_blocking(move || {
        let csv = decode_payload(bytes)?;
        parse_csv(&csv, infer_rows, batch_size)
    })
    .await
    .context("CSV parse task failed")?
    .with_context(|| format!("parsing {}", url))?;

    let rows = store.write_table(name, &batch)?;
    if config.write_backups {
        if let Err(e) = backups.write(name, &batch, Some(url.as_str())) {
            warn!(dataset = name, error = %format!("{:#}", e), "could not write snapshot");
        }
    }
    record(history, LoadEvent::now(name, LoadSource::Network, url.as_str(), rows));
    Ok(rows)
}

/// After a failed download, load the snapshot if there is one.
fn fall_back(store: &mut Store, backups: &BackupDir, history: &History, name: &str, reason: String) -> Outcome {
    if !backups.exists(name) {
        return Outcome::Failed(reason);
    }
    match load_backup(store, backups, history, name) {
        Ok(rows) => {
            warn!(dataset = name, "fell back to snapshot");
            Outcome::FromBackup { rows, fallback: true }
        }
        Err(be) => Outcome::Failed(format!("{}; snapshot: {:#}", reason, be)),
    }
}

fn load_backup(store: &mut Store, backups: &BackupDir, history: &History, name: &str) -> Result<usize> {
    let batch = backups.read(name)?;
    let rows = store.write_table(name, &batch)?;
    let location = backups.path_for(name).display().to_string();
    info!(dataset = name, rows, "loaded from snapshot");
    record(history, LoadEvent::now(name, LoadSource::Backup, &location, rows));
    Ok(rows)
}

/// A ledger write failing doesn't undo a load that already happened.
fn record(history: &History, event: LoadEvent) {
    if let Err(e) = history.record(&event) {
        warn!(table = %event.table, error = %format!("{:#}", e), "could not record load");
    }
}

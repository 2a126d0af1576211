// src/config.rs

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use url::Url;

static TABLE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("table name regex is valid"));

/// Open-data portal identifiers look like `abcd-1234`.
static PORTAL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]{4}-[a-z0-9]{4}$").expect("portal id regex is valid"));

/// Where a dataset comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatasetSource {
    Id { id: String },
    Url { url: String },
    /// Bare string: a URL if it parses as http(s), otherwise a portal id.
    Plain(String),
}

impl DatasetSource {
    /// The download URL, resolving portal ids against `portal`.
    pub fn resolve(&self, portal: &Url) -> Result<Url> {
        match self {
            DatasetSource::Id { id } => portal_url(portal, id),
            DatasetSource::Url { url } => parse_http_url(url),
            DatasetSource::Plain(s) => {
                if looks_like_url(s) {
                    parse_http_url(s)
                } else {
                    portal_url(portal, s)
                }
            }
        }
    }
}

fn looks_like_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

fn parse_http_url(s: &str) -> Result<Url> {
    let url = Url::parse(s).with_context(|| format!("invalid url `{}`", s))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => bail!("unsupported scheme `{}` in `{}`", other, s),
    }
}

fn portal_url(portal: &Url, id: &str) -> Result<Url> {
    if !PORTAL_ID_RE.is_match(id) {
        bail!("`{}` is not a portal dataset id (expected xxxx-xxxx)", id);
    }
    portal
        .join(&format!("api/views/{}/rows.csv?accessType=DOWNLOAD", id))
        .with_context(|| format!("joining dataset id `{}` onto {}", id, portal))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub raw_db: PathBuf,
    pub main_db: PathBuf,
    pub backup_dir: PathBuf,
    pub history_dir: PathBuf,
    pub portal: String,
    pub prefer_backup: bool,
    pub write_backups: bool,
    pub force: bool,
    pub max_concurrent_downloads: usize,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub infer_rows: usize,
    pub batch_size: usize,
    pub datasets: BTreeMap<String, DatasetSource>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            raw_db: PathBuf::from("data_raw.db"),
            main_db: PathBuf::from("data_main.db"),
            backup_dir: PathBuf::from("backups"),
            history_dir: PathBuf::from("history"),
            portal: "https://data.colorado.gov/".to_string(),
            prefer_backup: true,
            write_backups: true,
            force: false,
            max_concurrent_downloads: 3,
            max_retries: 3,
            backoff_ms: 500,
            infer_rows: 1_000,
            batch_size: 8_192,
            datasets: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Read and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading config {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(text).context("parsing config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn portal_url(&self) -> Result<Url> {
        Url::parse(&self.portal).with_context(|| format!("invalid portal url `{}`", self.portal))
    }

    /// Resolved download URL for a configured dataset.
    pub fn dataset_url(&self, name: &str) -> Result<Url> {
        let source = self
            .datasets
            .get(name)
            .ok_or_else(|| anyhow!("dataset `{}` is not configured", name))?;
        source.resolve(&self.portal_url()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            bail!("max_concurrent_downloads must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        let portal = self.portal_url()?;
        for (name, source) in &self.datasets {
            if !is_valid_table_name(name) {
                bail!("dataset name `{}` is not a valid table name", name);
            }
            source
                .resolve(&portal)
                .with_context(|| format!("dataset `{}`", name))?;
        }
        Ok(())
    }
}

pub fn is_valid_table_name(name: &str) -> bool {
    TABLE_NAME_RE.is_match(name)
}

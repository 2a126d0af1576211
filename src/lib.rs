//! Pull public CSV datasets (or local Parquet snapshots of them) into a
//! SQLite store as raw tables, plus the maintenance helpers around that.

pub mod backup;
pub mod cli;
pub mod config;
pub mod fetch;
pub mod history;
pub mod pipeline;
pub mod process;
pub mod store;
pub mod workspace;

pub use backup::BackupDir;
pub use config::{Config, DatasetSource};
pub use history::{History, LoadEvent, LoadSource};
pub use pipeline::{Outcome, Report};
pub use store::{Store, TableInfo};
pub use workspace::{Db, Workspace};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global fmt subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
}

/// Resolve the config path: explicit argument, then `RAWLOADER_CONFIG`, then `datasets.yaml`.
pub fn config_path(arg: Option<&str>) -> std::path::PathBuf {
    match arg {
        Some(p) => p.into(),
        None => std::env::var("RAWLOADER_CONFIG")
            .unwrap_or_else(|_| "datasets.yaml".to_string())
            .into(),
    }
}

//! export_backups: write Parquet snapshots of loaded raw tables.
//!
//! Usage: export_backups [--config PATH] [--db raw|main] [TABLE...]

use anyhow::Result;
use rawloader::{cli::ToolArgs, BackupDir, Config, Workspace};
use std::env;
use tracing::info;

fn main() -> Result<()> {
    rawloader::init_tracing("info");
    let args = ToolArgs::parse(env::args().skip(1))?;
    let config = Config::load(&args.config)?;
    let ws = Workspace::open(&config)?;
    let backups = BackupDir::new(&config.backup_dir)?;

    let exported = backups.export_all(ws.store(args.db), &args.tables)?;
    for (name, rows) in &exported {
        info!(table = %name, rows, path = %backups.path_for(name).display(), "exported");
    }
    info!(count = exported.len(), dir = %backups.dir().display(), "export complete");
    Ok(())
}

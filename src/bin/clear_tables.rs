//! clear_tables: drop named tables, or every table followed by VACUUM.
//!
//! Usage: clear_tables [--config PATH] [--db raw|main] [TABLE...]

use anyhow::Result;
use rawloader::{cli::ToolArgs, Config, Workspace};
use std::env;
use tracing::{info, warn};

fn main() -> Result<()> {
    rawloader::init_tracing("info");
    let args = ToolArgs::parse(env::args().skip(1))?;
    let config = Config::load(&args.config)?;
    let mut ws = Workspace::open(&config)?;
    let store = ws.store_mut(args.db);

    if args.tables.is_empty() {
        let dropped = store.clear_tables()?;
        info!(db = %args.db, dropped, "cleared all tables");
        return Ok(());
    }

    for name in &args.tables {
        if !store.drop_table(name)? {
            warn!(db = %args.db, table = %name, "no such table");
        }
    }
    Ok(())
}

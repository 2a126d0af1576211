//! list_tables: print every table in the raw (or main) database with its row count.
//!
//! Usage: list_tables [--config PATH] [--db raw|main]

use anyhow::Result;
use rawloader::{cli::ToolArgs, Config, Workspace};
use std::env;

fn main() -> Result<()> {
    rawloader::init_tracing("warn");
    let args = ToolArgs::parse(env::args().skip(1))?;
    let config = Config::load(&args.config)?;
    let ws = Workspace::open(&config)?;

    let tables = ws.store(args.db).list_tables()?;
    if tables.is_empty() {
        println!("{} database has no tables", args.db);
        return Ok(());
    }
    let width = tables.iter().map(|t| t.name.len()).max().unwrap_or(0);
    for t in &tables {
        println!("{:<width$}  {:>10} rows", t.name, t.rows, width = width);
    }
    println!("{} tables", tables.len());
    Ok(())
}

// src/cli.rs

use anyhow::{anyhow, bail, Result};
use std::path::PathBuf;

use crate::workspace::Db;

/// Arguments shared by the maintenance binaries:
/// `[--config PATH] [--db raw|main] [TABLE...]`.
#[derive(Debug, PartialEq)]
pub struct ToolArgs {
    pub config: PathBuf,
    pub db: Db,
    pub tables: Vec<String>,
}

impl ToolArgs {
    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = None;
        let mut db = Db::Raw;
        let mut tables = Vec::new();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    config = Some(args.next().ok_or_else(|| anyhow!("--config needs a path"))?);
                }
                "--db" => {
                    db = args
                        .next()
                        .ok_or_else(|| anyhow!("--db needs raw or main"))?
                        .parse()?;
                }
                s if s.starts_with('-') => bail!("unknown flag `{}`", s),
                _ => tables.push(arg),
            }
        }
        Ok(Self {
            config: crate::config_path(config.as_deref()),
            db,
            tables,
        })
    }
}

// src/workspace.rs

use anyhow::{bail, Result};
use arrow::record_batch::RecordBatch;
use std::{fmt, str::FromStr};

use crate::config::Config;
use crate::store::Store;

/// Which of the two databases to act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Db {
    /// Verbatim downloads.
    Raw,
    /// Cleaned and joined output of later stages.
    Main,
}

impl FromStr for Db {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "raw" => Ok(Db::Raw),
            "main" => Ok(Db::Main),
            other => bail!("unknown database `{}` (expected raw or main)", other),
        }
    }
}

impl fmt::Display for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Db::Raw => "raw",
            Db::Main => "main",
        })
    }
}

/// The raw and main stores side by side.
pub struct Workspace {
    pub raw: Store,
    pub main: Store,
}

impl Workspace {
    pub fn open(config: &Config) -> Result<Self> {
        Ok(Self {
            raw: Store::open(&config.raw_db)?,
            main: Store::open(&config.main_db)?,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            raw: Store::in_memory()?,
            main: Store::in_memory()?,
        })
    }

    pub fn store(&self, db: Db) -> &Store {
        match db {
            Db::Raw => &self.raw,
            Db::Main => &self.main,
        }
    }

    pub fn store_mut(&mut self, db: Db) -> &mut Store {
        match db {
            Db::Raw => &mut self.raw,
            Db::Main => &mut self.main,
        }
    }

    pub fn read_raw(&self, query: &str, filter: Option<&str>) -> Result<RecordBatch> {
        self.raw.read_sql(query, filter)
    }

    pub fn read_main(&self, query: &str, filter: Option<&str>) -> Result<RecordBatch> {
        self.main.read_sql(query, filter)
    }

    pub fn write_raw(&mut self, name: &str, batch: &RecordBatch) -> Result<usize> {
        self.raw.write_table(name, batch)
    }

    pub fn write_main(&mut self, name: &str, batch: &RecordBatch) -> Result<usize> {
        self.main.write_table(name, batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::parse_csv;
    use tempfile::tempdir;

    #[test]
    fn test_db_parsing() -> Result<()> {
        assert_eq!("raw".parse::<Db>()?, Db::Raw);
        assert_eq!(" MAIN ".parse::<Db>()?, Db::Main);
        assert!("other".parse::<Db>().is_err());
        assert_eq!(Db::Main.to_string(), "main");
        Ok(())
    }

    #[test]
    fn test_raw_and_main_are_separate() -> Result<()> {
        let mut ws = Workspace::in_memory()?;
        let batch = parse_csv(b"county,students\nAdams,9000\n", 10, 10)?;
        ws.write_raw("enrollment", &batch)?;
        assert!(ws.store(Db::Raw).table_exists("enrollment")?);
        assert!(!ws.store(Db::Main).table_exists("enrollment")?);

        let cleaned = ws.read_raw("select county from enrollment", None)?;
        ws.write_main("counties", &cleaned)?;
        assert_eq!(ws.read_main("counties", None)?.num_rows(), 1);
        assert_eq!(ws.store_mut(Db::Main).clear_tables()?, 1);
        Ok(())
    }

    #[test]
    fn test_open_from_config() -> Result<()> {
        let dir = tempdir()?;
        let mut config = Config::default();
        config.raw_db = dir.path().join("data_raw.db");
        config.main_db = dir.path().join("data_main.db");
        let ws = Workspace::open(&config)?;
        assert_eq!(ws.raw.path(), Some(config.raw_db.as_path()));
        assert_eq!(ws.main.path(), Some(config.main_db.as_path()));
        Ok(())
    }
}

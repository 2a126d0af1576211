// src/backup/mod.rs

use anyhow::{bail, Context, Result};
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use glob::{glob, Pattern};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

use crate::store::Store;

/// Sidecar written next to every snapshot as `<name>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub table: String,
    pub source: Option<String>,
    pub rows: usize,
    pub columns: Vec<String>,
    pub written_at: DateTime<Utc>,
}

/// A directory of Parquet snapshots, one per raw table.
pub struct BackupDir {
    dir: PathBuf,
}

impl BackupDir {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating backup directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.parquet", name))
    }

    fn manifest_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    /// Write `batch` as the snapshot for `name`, replacing any older one.
    #[instrument(level = "info", skip(self, batch, source), fields(rows = batch.num_rows()))]
    pub fn write(&self, name: &str, batch: &RecordBatch, source: Option<&str>) -> Result<PathBuf> {
        let final_path = self.path_for(name);
        let tmp_path = final_path.with_extension("parquet.tmp");

        if let Err(e) = write_parquet(&tmp_path, batch) {
            if let Err(rm) = fs::remove_file(&tmp_path) {
                debug!(path = %tmp_path.display(), error = %rm, "could not remove partial snapshot");
            }
            return Err(e);
        }
        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "renaming `{}` → `{}`",
                tmp_path.display(),
                final_path.display()
            )
        })?;

        let manifest = Manifest {
            table: name.to_string(),
            source: source.map(str::to_string),
            rows: batch.num_rows(),
            columns: batch
                .schema()
                .fields()
                .iter()
                .map(|f| f.name().clone())
                .collect(),
            written_at: Utc::now(),
        };
        let manifest_path = self.manifest_path(name);
        let manifest_tmp = manifest_path.with_extension("json.tmp");
        fs::write(&manifest_tmp, serde_json::to_vec_pretty(&manifest)?)
            .with_context(|| format!("writing `{}`", manifest_tmp.display()))?;
        fs::rename(&manifest_tmp, &manifest_path)
            .with_context(|| format!("renaming `{}`", manifest_tmp.display()))?;

        info!(path = %final_path.display(), "wrote snapshot");
        Ok(final_path)
    }

    /// Load the snapshot for `name` as a single batch.
    pub fn read(&self, name: &str) -> Result<RecordBatch> {
        let path = self.path_for(name);
        let file =
            File::open(&path).with_context(|| format!("failed to open `{}`", path.display()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).with_context(|| {
            format!("failed to create RecordBatchReaderBuilder for `{}`", path.display())
        })?;
        let schema = builder.schema().clone();
        let reader = builder
            .with_batch_size(8_192)
            .build()
            .with_context(|| format!("failed to build RecordBatchReader for `{}`", path.display()))?;
        let batches = reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("error reading RecordBatch from `{}`", path.display()))?;
        let batch = concat_batches(&schema, &batches)?;
        debug!(table = name, rows = batch.num_rows(), "read snapshot");
        Ok(batch)
    }

    /// The sidecar for `name`, if one was written.
    pub fn manifest(&self, name: &str) -> Result<Option<Manifest>> {
        let path = self.manifest_path(name);
        if !path.is_file() {
            return Ok(None);
        }
        let text =
            fs::read(&path).with_context(|| format!("reading `{}`", path.display()))?;
        let manifest = serde_json::from_slice(&text)
            .with_context(|| format!("parsing `{}`", path.display()))?;
        Ok(Some(manifest))
    }

    /// Names of every snapshot in the directory, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let pattern = format!("{}/*.parquet", Pattern::escape(&self.dir.to_string_lossy()));
        let mut names = Vec::new();
        for entry in glob(&pattern).context("invalid glob pattern for snapshot listing")? {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!("cannot read glob entry: {:?}", e);
                    continue;
                }
            };
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Re-export a loaded table from `store` as its snapshot.
    pub fn export_table(&self, store: &Store, name: &str) -> Result<usize> {
        if !store.table_exists(name)? {
            bail!("table `{}` does not exist", name);
        }
        let batch = store
            .read_table(name)
            .with_context(|| format!("reading `{}` for export", name))?;
        let source = store.path().map(|p| format!("sqlite:{}", p.display()));
        self.write(name, &batch, source.as_deref())?;
        Ok(batch.num_rows())
    }

    /// Export `only` (or every table when empty). Returns `(table, rows)` pairs.
    pub fn export_all(&self, store: &Store, only: &[String]) -> Result<Vec<(String, usize)>> {
        let names = if only.is_empty() {
            store.table_names()?
        } else {
            only.to_vec()
        };
        names
            .into_iter()
            .map(|name| {
                let rows = self.export_table(store, &name)?;
                Ok((name, rows))
            })
            .collect()
    }
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(3)?))
        .build();
    let file = File::create(path).with_context(|| format!("could not create `{}`", path.display()))?;
    let mut writer = ArrowWriter::try_new(BufWriter::new(file), batch.schema(), Some(props))
        .context("creating ArrowWriter for snapshot")?;
    if batch.num_rows() > 0 {
        writer.write(batch).context("writing snapshot batch")?;
    }
    writer.close().context("closing snapshot writer")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::parse_csv;
    use arrow::array::{Array, AsArray, StructArray};
    use arrow::datatypes::{DataType, Field, Fields, Int64Type, Schema};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sample() -> Result<RecordBatch> {
        parse_csv(
            b"county,students,opened\nAdams,9000,1950-09-01\nDenver,,1902-09-01\n",
            100,
            100,
        )
    }

    #[test]
    fn test_write_and_read_snapshot() -> Result<()> {
        let dir = tempdir()?;
        let backups = BackupDir::new(dir.path().join("backups"))?;
        assert!(!backups.exists("districts"));

        let path = backups.write("districts", &sample()?, Some("https://example.org/d.csv"))?;
        assert_eq!(path, backups.path_for("districts"));
        assert!(backups.exists("districts"));
        assert!(!dir.path().join("backups/districts.parquet.tmp").exists());

        let back = backups.read("districts")?;
        assert_eq!(back.num_rows(), 2);
        assert_eq!(back.schema().field(2).data_type(), &DataType::Date32);
        let students = back.column(1).as_primitive::<Int64Type>();
        assert_eq!(students.value(0), 9000);
        assert!(students.is_null(1));

        let manifest = backups.manifest("districts")?.expect("manifest written");
        assert_eq!(manifest.table, "districts");
        assert_eq!(manifest.rows, 2);
        assert_eq!(manifest.columns, vec!["county", "students", "opened"]);
        assert_eq!(manifest.source.as_deref(), Some("https://example.org/d.csv"));
        Ok(())
    }

    #[test]
    fn test_empty_batch_round_trips() -> Result<()> {
        let dir = tempdir()?;
        let backups = BackupDir::new(dir.path())?;
        backups.write("empty", &parse_csv(b"a,b\n", 10, 10)?, None)?;
        let back = backups.read("empty")?;
        assert_eq!(back.num_rows(), 0);
        assert_eq!(back.num_columns(), 2);
        Ok(())
    }

    #[test]
    fn test_failed_write_leaves_no_files() -> Result<()> {
        let dir = tempdir()?;
        let backups = BackupDir::new(dir.path())?;
        // parquet has no representation for a struct without fields
        let schema = Arc::new(Schema::new(vec![Field::new(
            "empty",
            DataType::Struct(Fields::empty()),
            true,
        )]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(StructArray::new_empty_fields(2, None))])?;

        assert!(backups.write("broken", &batch, None).is_err());
        assert!(!backups.exists("broken"));
        assert!(!dir.path().join("broken.parquet.tmp").exists());
        assert!(backups.manifest("broken")?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_and_missing() -> Result<()> {
        let dir = tempdir()?;
        let backups = BackupDir::new(dir.path())?;
        backups.write("b_table", &sample()?, None)?;
        backups.write("a_table", &sample()?, None)?;
        fs::write(dir.path().join("notes.txt"), "ignored")?;

        assert_eq!(backups.list()?, vec!["a_table", "b_table"]);
        assert!(backups.read("nope").is_err());
        assert!(backups.manifest("nope")?.is_none());
        Ok(())
    }

    #[test]
    fn test_export_from_store() -> Result<()> {
        let dir = tempdir()?;
        let backups = BackupDir::new(dir.path().join("backups"))?;
        let mut store = Store::open(dir.path().join("raw.db"))?;
        store.write_table("districts", &sample()?)?;
        store.write_table("counties", &parse_csv(b"county\nAdams\n", 10, 10)?)?;

        let exported = backups.export_all(&store, &[])?;
        assert_eq!(
            exported,
            vec![("counties".to_string(), 1), ("districts".to_string(), 2)]
        );

        let back = backups.read("districts")?;
        assert_eq!(back.num_rows(), 2);
        assert_eq!(back.column(0).as_string::<i32>().value(1), "Denver");
        let manifest = backups.manifest("districts")?.expect("manifest written");
        assert!(manifest.source.unwrap_or_default().starts_with("sqlite:"));

        // keyword names are still plain tables
        store.write_table("select", &parse_csv(b"county\nAdams\n", 10, 10)?)?;
        assert_eq!(backups.export_table(&store, "select")?, 1);
        assert_eq!(backups.read("select")?.num_rows(), 1);

        let err = backups
            .export_all(&store, &["missing".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        Ok(())
    }
}

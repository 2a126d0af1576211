// src/history/mod.rs

use anyhow::{anyhow, Context, Result};
use arrow::array::{ArrayRef, AsArray, StringArray, TimestampMicrosecondArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit, TimestampMicrosecondType, UInt64Type};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use glob::{glob, Pattern};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

/// Where a raw table's rows came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadSource {
    Network,
    Backup,
}

impl LoadSource {
    pub fn as_str(&self) -> &str {
        match self {
            LoadSource::Network => "network",
            LoadSource::Backup => "backup",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "network" => Some(LoadSource::Network),
            "backup" => Some(LoadSource::Backup),
            _ => None,
        }
    }
}

/// One successful load of a raw table.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadEvent {
    pub table: String,
    pub source: LoadSource,
    /// URL or snapshot path the rows were read from.
    pub location: String,
    pub rows: usize,
    pub loaded_at: DateTime<Utc>,
}

impl LoadEvent {
    pub fn now(table: &str, source: LoadSource, location: &str, rows: usize) -> Self {
        Self {
            table: table.to_string(),
            source,
            location: location.to_string(),
            rows,
            loaded_at: Utc::now(),
        }
    }
}

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("table", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("location", DataType::Utf8, false),
        Field::new("rows", DataType::UInt64, false),
        Field::new(
            "loaded_at",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        ),
    ]))
}

/// Ledger of loads, one tiny Parquet file per event:
/// `<table>---<source>---<ts_micros>.parquet`.
pub struct History {
    history_dir: PathBuf,
}

impl History {
    pub fn new(history_dir: impl Into<PathBuf>) -> Result<Self> {
        let history_dir = history_dir.into();
        fs::create_dir_all(&history_dir)
            .with_context(|| format!("creating history directory {:?}", &history_dir))?;
        Ok(Self { history_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.history_dir
    }

    pub fn record(&self, event: &LoadEvent) -> Result<PathBuf> {
        // bump the timestamp until the filename is free
        let mut ts = event.loaded_at.timestamp_micros();
        let final_path = loop {
            let p = self.history_dir.join(format!(
                "{}---{}---{}.parquet",
                event.table,
                event.source.as_str(),
                ts
            ));
            if !p.exists() {
                break p;
            }
            ts += 1;
        };
        let tmp_path = final_path.with_extension("parquet.tmp");

        let schema = schema();
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(vec![event.table.clone()])),
            Arc::new(StringArray::from(vec![event.source.as_str().to_string()])),
            Arc::new(StringArray::from(vec![event.location.clone()])),
            Arc::new(UInt64Array::from(vec![event.rows as u64])),
            Arc::new(TimestampMicrosecondArray::from(vec![ts])),
        ];
        let batch = RecordBatch::try_new(schema.clone(), columns)
            .context("building RecordBatch for history event")?;

        let tmp_file = File::create(&tmp_path)
            .with_context(|| format!("could not create temporary file `{}`", tmp_path.display()))?;
        let mut writer = ArrowWriter::try_new(BufWriter::new(tmp_file), schema, None)
            .context("creating ArrowWriter for history event")?;
        writer.write(&batch).context("writing history event")?;
        writer.close().context("closing history writer")?;

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "failed to rename `{}` to `{}`",
                tmp_path.display(),
                final_path.display()
            )
        })?;
        debug!(table = %event.table, source = event.source.as_str(), "recorded load");
        Ok(final_path)
    }

    /// Every recorded event, oldest first.
    pub fn events(&self) -> Result<Vec<LoadEvent>> {
        let pattern = format!(
            "{}/*---*---*.parquet",
            Pattern::escape(&self.history_dir.to_string_lossy())
        );
        let mut events = Vec::new();
        for entry in glob(&pattern).context("invalid glob pattern for history")? {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!("cannot read glob entry: {:?}", e);
                    continue;
                }
            };
            events.extend(read_events(&path)?);
        }
        events.sort_by_key(|e| e.loaded_at);
        Ok(events)
    }

    /// The newest load recorded for `table`.
    pub fn last_loaded(&self, table: &str) -> Result<Option<LoadEvent>> {
        Ok(self
            .events()?
            .into_iter()
            .filter(|e| e.table == table)
            .next_back())
    }
}

fn read_events(path: &Path) -> Result<Vec<LoadEvent>> {
    let file = File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading history file `{}`", path.display()))?
        .build()?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("error reading `{}`", path.display()))?;
        let tables = batch.column(0).as_string::<i32>();
        let sources = batch.column(1).as_string::<i32>();
        let locations = batch.column(2).as_string::<i32>();
        let rows = batch.column(3).as_primitive::<UInt64Type>();
        let times = batch.column(4).as_primitive::<TimestampMicrosecondType>();
        for i in 0..batch.num_rows() {
            let source = LoadSource::from_str(sources.value(i))
                .ok_or_else(|| anyhow!("unknown load source `{}`", sources.value(i)))?;
            let loaded_at = DateTime::<Utc>::from_timestamp_micros(times.value(i))
                .ok_or_else(|| anyhow!("timestamp out of range in `{}`", path.display()))?;
            out.push(LoadEvent {
                table: tables.value(i).to_string(),
                source,
                location: locations.value(i).to_string(),
                rows: rows.value(i) as usize,
                loaded_at,
            });
        }
    }
    Ok(out)
}

// src/process/mod.rs

use anyhow::{bail, Context, Result};
use arrow::compute::concat_batches;
use arrow::csv::{reader::Format, ReaderBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use std::{collections::HashSet, io::Cursor, sync::Arc};
use tracing::{debug, instrument, warn};

/// Parse CSV bytes into a single `RecordBatch`.
///
/// The header row supplies the column names untouched, except that blank
/// names become `Unnamed: <index>`. Column types are inferred from the first
/// `infer_rows` records; anything that isn't a clean integer, float, boolean,
/// date or timestamp stays a string. When a later record doesn't fit the
/// sampled types, the whole input is inferred again, and as a last resort
/// every column is read as text.
#[instrument(level = "debug", skip(bytes), fields(len = bytes.len()))]
pub fn parse_csv(bytes: &[u8], infer_rows: usize, batch_size: usize) -> Result<RecordBatch> {
    let format = Format::default().with_header(true);
    let (schema, sampled) = format
        .infer_schema(Cursor::new(bytes), Some(infer_rows))
        .context("inferring CSV schema")?;
    if schema.fields().is_empty() {
        bail!("CSV has no header row");
    }
    let schema = normalize_schema(&schema);
    ensure_unique_columns(&schema.fields().iter().map(|f| f.name().as_str()).collect::<Vec<_>>())?;
    debug!(columns = schema.fields().len(), sampled, "inferred schema");

    let err = match read_batch(bytes, &format, schema, batch_size) {
        Ok(batch) => return Ok(batch),
        Err(e) => e,
    };
    warn!(error = %format!("{:#}", err), "sampled types don't fit every record, inferring over the whole input");

    let (full, _) = format
        .infer_schema(Cursor::new(bytes), None)
        .context("inferring CSV schema over every record")?;
    let full = normalize_schema(&full);
    let err = match read_batch(bytes, &format, full.clone(), batch_size) {
        Ok(batch) => return Ok(batch),
        Err(e) => e,
    };
    warn!(error = %format!("{:#}", err), "reading every column as text");

    let text = Arc::new(Schema::new(
        full.fields()
            .iter()
            .map(|f| Field::new(f.name(), DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));
    read_batch(bytes, &format, text, batch_size)
}

fn read_batch(bytes: &[u8], format: &Format, schema: SchemaRef, batch_size: usize) -> Result<RecordBatch> {
    let reader = ReaderBuilder::new(schema.clone())
        .with_format(format.clone())
        .with_batch_size(batch_size)
        .build(Cursor::new(bytes))
        .context("creating CSV reader")?;
    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("reading CSV records")?;

    let batch = concat_batches(&schema, &batches).context("concatenating CSV batches")?;
    debug!(rows = batch.num_rows(), "parsed CSV");
    Ok(batch)
}

/// Name blank headers `Unnamed: <index>` and read all-empty columns as text.
fn normalize_schema(schema: &Schema) -> SchemaRef {
    let fields = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(i, f)| {
            let mut field = f.as_ref().clone();
            if field.name().trim().is_empty() {
                field = field.with_name(format!("Unnamed: {}", i));
            }
            if field.data_type() == &DataType::Null {
                field = field.with_data_type(DataType::Utf8);
            }
            field.with_nullable(true)
        })
        .collect::<Vec<_>>();
    Arc::new(Schema::new(fields))
}

/// SQLite refuses duplicate column names, so catch them with a useful message.
pub fn ensure_unique_columns(names: &[&str]) -> Result<()> {
    let mut seen = HashSet::with_capacity(names.len());
    for name in names {
        if !seen.insert(name.to_lowercase()) {
            bail!("duplicate column `{}` in header", name);
        }
    }
    Ok(())
}

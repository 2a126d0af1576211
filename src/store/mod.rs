// src/store/mod.rs

use anyhow::{bail, Context, Result};
use arrow::array::{Array, ArrayRef, AsArray, BinaryArray, Float64Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema};
use arrow::record_batch::RecordBatch;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, params_from_iter, types::Value, Connection};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, info, instrument};

static SELECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bselect\b").expect("select regex is valid"));

/// A table and how many rows it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub rows: usize,
}

/// A SQLite database holding raw (or cleaned) tables.
///
/// Reads through [`Store::read_sql`] are cached by query text; every write,
/// drop or clear on this store empties the cache.
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
    cache: Mutex<HashMap<String, RecordBatch>>,
}

impl Store {
    /// Open (or create) a database file, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        debug!(db = %path.display(), "opened store");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            path: None,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            params![name],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    pub fn row_count(&self, name: &str) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(name)), [], |r| {
                r.get(0)
            })
            .with_context(|| format!("counting rows of `{}`", name))?;
        Ok(n as usize)
    }

    /// Every user table with its row count, sorted by name.
    pub fn list_tables(&self) -> Result<Vec<TableInfo>> {
        self.table_names()?
            .into_iter()
            .map(|name| {
                let rows = self.row_count(&name)?;
                Ok(TableInfo { name, rows })
            })
            .collect()
    }

    /// Replace `name` with the contents of `batch`, returning the row count.
    ///
    /// Drop, create and every insert share one transaction, so a failure
    /// leaves the previous table in place.
    #[instrument(level = "info", skip(self, batch), fields(rows = batch.num_rows()))]
    pub fn write_table(&mut self, name: &str, batch: &RecordBatch) -> Result<usize> {
        if batch.num_columns() == 0 {
            bail!("refusing to write `{}` with no columns", name);
        }
        let schema = batch.schema();
        let columns = batch
            .columns()
            .iter()
            .zip(schema.fields())
            .map(|(array, field)| {
                SqlColumn::from_array(array)
                    .with_context(|| format!("converting column `{}`", field.name()))
            })
            .collect::<Result<Vec<_>>>()?;

        let table = quote_ident(name);
        let column_defs = schema
            .fields()
            .iter()
            .zip(&columns)
            .map(|(f, c)| format!("{} {}", quote_ident(f.name()), c.affinity()))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");

        let tx = self.conn.transaction()?;
        tx.execute(&format!("DROP TABLE IF EXISTS {}", table), [])?;
        tx.execute(&format!("CREATE TABLE {} ({})", table, column_defs), [])
            .with_context(|| format!("creating table `{}`", name))?;
        {
            let mut stmt = tx.prepare_cached(&format!("INSERT INTO {} VALUES ({})", table, placeholders))?;
            let mut row: Vec<Value> = Vec::with_capacity(columns.len());
            for i in 0..batch.num_rows() {
                row.clear();
                row.extend(columns.iter().map(|c| c.value(i)));
                stmt.execute(params_from_iter(row.iter()))
                    .with_context(|| format!("inserting row {} into `{}`", i, name))?;
            }
        }
        tx.commit()?;
        self.invalidate();

        info!(table = name, rows = batch.num_rows(), "wrote table");
        Ok(batch.num_rows())
    }

    /// Run a query (or read a whole table) into a `RecordBatch`.
    ///
    /// `query` without the word `select` is taken as a table name. `filter`
    /// is appended as a `WHERE` clause. Results are served from cache when
    /// the same final query ran before.
    pub fn read_sql(&self, query: &str, filter: Option<&str>) -> Result<RecordBatch> {
        self.cached_query(build_query(query, filter))
    }

    /// Read every row of `name`, whatever the name looks like.
    pub fn read_table(&self, name: &str) -> Result<RecordBatch> {
        self.cached_query(format!("SELECT * FROM {}", quote_ident(name)))
    }

    fn cached_query(&self, sql: String) -> Result<RecordBatch> {
        if let Some(hit) = self.cache().get(&sql) {
            debug!(%sql, "query cache hit");
            return Ok(hit.clone());
        }
        let batch = self.query_batch(&sql)?;
        self.cache().insert(sql, batch.clone());
        Ok(batch)
    }

    /// Returns whether the table existed.
    pub fn drop_table(&mut self, name: &str) -> Result<bool> {
        let existed = self.table_exists(name)?;
        self.conn
            .execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)), [])
            .with_context(|| format!("dropping `{}`", name))?;
        self.invalidate();
        if existed {
            info!(table = name, "dropped table");
        }
        Ok(existed)
    }

    /// Drop every user table, then `VACUUM` to hand the space back.
    #[instrument(level = "info", skip(self), fields(db = ?self.path))]
    pub fn clear_tables(&mut self) -> Result<usize> {
        let names = self.table_names()?;
        let tx = self.conn.transaction()?;
        for name in &names {
            tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)), [])
                .with_context(|| format!("dropping `{}`", name))?;
        }
        tx.commit()?;
        // VACUUM cannot run inside a transaction
        self.conn.execute_batch("VACUUM").context("vacuuming database")?;
        self.invalidate();
        info!(dropped = names.len(), "cleared tables");
        Ok(names.len())
    }

    fn query_batch(&self, sql: &str) -> Result<RecordBatch> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("preparing `{}`", sql))?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut values: Vec<Vec<Value>> = vec![Vec::new(); names.len()];

        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for (i, col) in values.iter_mut().enumerate() {
                col.push(row.get::<_, Value>(i)?);
            }
        }

        let mut fields = Vec::with_capacity(names.len());
        let mut arrays = Vec::with_capacity(names.len());
        for (name, col) in names.iter().zip(values) {
            let array = array_from_values(col);
            fields.push(Field::new(name, array.data_type().clone(), true));
            arrays.push(array);
        }
        let schema = Arc::new(Schema::new(fields));
        RecordBatch::try_new(schema, arrays).context("assembling query result")
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, RecordBatch>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalidate(&self) {
        self.cache().clear();
    }
}

/// Double-quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn build_query(query: &str, filter: Option<&str>) -> String {
    let query = query.trim();
    let mut sql = if SELECT_RE.is_match(query) {
        query.to_string()
    } else {
        format!("SELECT * FROM {}", quote_ident(query))
    };
    if let Some(filter) = filter {
        sql.push_str(" WHERE ");
        sql.push_str(filter);
    }
    sql
}

/// A batch column cast into one of SQLite's storage classes.
enum SqlColumn {
    Integer(Int64Array),
    Real(Float64Array),
    Text(StringArray),
    Blob(BinaryArray),
}

impl SqlColumn {
    fn from_array(array: &ArrayRef) -> Result<Self> {
        Ok(match array.data_type() {
            DataType::Boolean
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => {
                let a = cast(array, &DataType::Int64)?;
                SqlColumn::Integer(a.as_primitive::<Int64Type>().clone())
            }
            DataType::Float16
            | DataType::Float32
            | DataType::Float64
            | DataType::Decimal128(_, _)
            | DataType::Decimal256(_, _) => {
                let a = cast(array, &DataType::Float64)?;
                SqlColumn::Real(a.as_primitive::<Float64Type>().clone())
            }
            DataType::Binary | DataType::LargeBinary | DataType::FixedSizeBinary(_) => {
                let a = cast(array, &DataType::Binary)?;
                SqlColumn::Blob(a.as_binary::<i32>().clone())
            }
            // dates, timestamps and strings all land as text
            _ => {
                let a = cast(array, &DataType::Utf8)?;
                SqlColumn::Text(a.as_string::<i32>().clone())
            }
        })
    }

    fn affinity(&self) -> &'static str {
        match self {
            SqlColumn::Integer(_) => "INTEGER",
            SqlColumn::Real(_) => "REAL",
            SqlColumn::Text(_) => "TEXT",
            SqlColumn::Blob(_) => "BLOB",
        }
    }

    fn value(&self, i: usize) -> Value {
        match self {
            SqlColumn::Integer(a) if a.is_valid(i) => Value::Integer(a.value(i)),
            SqlColumn::Real(a) if a.is_valid(i) => Value::Real(a.value(i)),
            SqlColumn::Text(a) if a.is_valid(i) => Value::Text(a.value(i).to_string()),
            SqlColumn::Blob(a) if a.is_valid(i) => Value::Blob(a.value(i).to_vec()),
            _ => Value::Null,
        }
    }
}

/// Pick the narrowest Arrow type that holds every value SQLite returned.
fn array_from_values(values: Vec<Value>) -> ArrayRef {
    let (mut int, mut real, mut text, mut blob) = (false, false, false, false);
    for v in &values {
        match v {
            Value::Null => {}
            Value::Integer(_) => int = true,
            Value::Real(_) => real = true,
            Value::Text(_) => text = true,
            Value::Blob(_) => blob = true,
        }
    }

    if text || (blob && (int || real)) {
        let strings = values.into_iter().map(|v| match v {
            Value::Null => None,
            Value::Integer(i) => Some(i.to_string()),
            Value::Real(f) => Some(f.to_string()),
            Value::Text(s) => Some(s),
            Value::Blob(b) => Some(String::from_utf8_lossy(&b).into_owned()),
        });
        Arc::new(StringArray::from_iter(strings))
    } else if blob {
        Arc::new(BinaryArray::from_iter(values.into_iter().map(|v| match v {
            Value::Blob(b) => Some(b),
            _ => None,
        })))
    } else if real {
        Arc::new(Float64Array::from_iter(values.into_iter().map(|v| match v {
            Value::Integer(i) => Some(i as f64),
            Value::Real(f) => Some(f),
            _ => None,
        })))
    } else if int {
        Arc::new(Int64Array::from_iter(values.into_iter().map(|v| match v {
            Value::Integer(i) => Some(i),
            _ => None,
        })))
    } else {
        Arc::new(StringArray::from_iter(values.into_iter().map(|_| None::<String>)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::parse_csv;
    use arrow::array::BooleanArray;
    use tempfile::tempdir;

    fn districts() -> Result<RecordBatch> {
        parse_csv(
            b"county,district,students,ratio,opened\n\
Adams,Mapleton 1,9000,16.5,1950-09-01\n\
Denver,Denver County 1,90000,17.25,1902-09-01\n\
Mesa,Mesa County Valley 51,,15.0,1951-09-01\n",
            1_000,
            1_024,
        )
    }

    #[test]
    fn test_write_then_read_back() -> Result<()> {
        let mut store = Store::in_memory()?;
        assert!(!store.table_exists("districts")?);

        let rows = store.write_table("districts", &districts()?)?;
        assert_eq!(rows, 3);
        assert!(store.table_exists("districts")?);
        assert!(store.table_exists("DISTRICTS")?);

        let out = store.read_sql("districts", None)?;
        assert_eq!(out.num_rows(), 3);
        let schema = out.schema();
        assert_eq!(schema.field(0).name(), "county");
        assert_eq!(schema.field(2).data_type(), &DataType::Int64);
        assert_eq!(schema.field(3).data_type(), &DataType::Float64);
        // dates come back as their text form
        assert_eq!(schema.field(4).data_type(), &DataType::Utf8);
        assert_eq!(out.column(4).as_string::<i32>().value(1), "1902-09-01");
        assert!(out.column(2).is_null(2));
        Ok(())
    }

    #[test]
    fn test_write_replaces_existing_table() -> Result<()> {
        let mut store = Store::in_memory()?;
        store.write_table("districts", &districts()?)?;
        let smaller = parse_csv(b"only\n1\n2\n", 100, 100)?;
        store.write_table("districts", &smaller)?;

        let out = store.read_sql("districts", None)?;
        assert_eq!(out.num_columns(), 1);
        assert_eq!(out.num_rows(), 2);
        Ok(())
    }

    #[test]
    fn test_booleans_stored_as_integers() -> Result<()> {
        let mut store = Store::in_memory()?;
        let schema = Arc::new(Schema::new(vec![Field::new("flag", DataType::Boolean, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(BooleanArray::from(vec![Some(true), None, Some(false)]))],
        )?;
        store.write_table("flags", &batch)?;
        let out = store.read_sql("SELECT flag FROM flags WHERE flag IS NOT NULL ORDER BY flag", None)?;
        let flags = out.column(0).as_primitive::<Int64Type>();
        assert_eq!(flags.values().to_vec(), vec![0, 1]);
        Ok(())
    }

    #[test]
    fn test_read_sql_with_filter() -> Result<()> {
        let mut store = Store::in_memory()?;
        store.write_table("districts", &districts()?)?;

        let out = store.read_sql("districts", Some("students > 10000"))?;
        assert_eq!(out.num_rows(), 1);
        assert_eq!(out.column(0).as_string::<i32>().value(0), "Denver");

        let out = store.read_sql("select county from districts", Some("county like 'M%'"))?;
        assert_eq!(out.num_columns(), 1);
        assert_eq!(out.num_rows(), 1);
        Ok(())
    }

    #[test]
    fn test_reads_are_cached_until_write() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("raw.db");
        let mut store = Store::open(&path)?;
        store.write_table("districts", &districts()?)?;
        assert_eq!(store.read_sql("districts", None)?.num_rows(), 3);

        // change the table behind the store's back
        let other = Connection::open(&path)?;
        other.execute("DELETE FROM districts WHERE county = 'Mesa'", [])?;
        drop(other);
        assert_eq!(store.read_sql("districts", None)?.num_rows(), 3);

        // any write through the store invalidates
        store.write_table("unrelated", &parse_csv(b"x\n1\n", 10, 10)?)?;
        assert_eq!(store.read_sql("districts", None)?.num_rows(), 2);
        Ok(())
    }

    #[test]
    fn test_list_drop_and_clear() -> Result<()> {
        let dir = tempdir()?;
        let mut store = Store::open(dir.path().join("nested").join("raw.db"))?;
        store.write_table("districts", &districts()?)?;
        store.write_table("counties", &parse_csv(b"county\nAdams\nMesa\n", 10, 10)?)?;

        let tables = store.list_tables()?;
        assert_eq!(
            tables,
            vec![
                TableInfo { name: "counties".into(), rows: 2 },
                TableInfo { name: "districts".into(), rows: 3 },
            ]
        );

        assert!(store.drop_table("counties")?);
        assert!(!store.drop_table("counties")?);
        assert_eq!(store.table_names()?, vec!["districts".to_string()]);

        store.write_table("counties", &parse_csv(b"county\nAdams\n", 10, 10)?)?;
        assert_eq!(store.clear_tables()?, 2);
        assert!(store.list_tables()?.is_empty());
        assert!(store.read_sql("districts", None).is_err());
        Ok(())
    }

    #[test]
    fn test_odd_identifiers_are_quoted() -> Result<()> {
        let mut store = Store::in_memory()?;
        let batch = parse_csv(b"\"District \"\"Name\"\"\",2019 Count\nA,1\n", 10, 10)?;
        store.write_table("weird table", &batch)?;
        let out = store.read_sql("weird table", None)?;
        assert_eq!(out.schema().field(0).name(), "District \"Name\"");
        assert_eq!(out.schema().field(1).name(), "2019 Count");
        Ok(())
    }

    #[test]
    fn test_keyword_table_names_read_by_name() -> Result<()> {
        let mut store = Store::in_memory()?;
        store.write_table("select", &parse_csv(b"county\nAdams\nMesa\n", 10, 10)?)?;
        assert!(store.read_sql("select", None).is_err());
        let out = store.read_table("select")?;
        assert_eq!(out.num_rows(), 2);
        assert_eq!(out.column(0).as_string::<i32>().value(1), "Mesa");
        Ok(())
    }

    #[test]
    fn test_mixed_values_widen() -> Result<()> {
        let store = Store::in_memory()?;
        store.conn.execute_batch(
            "CREATE TABLE loose (a, b, c);
             INSERT INTO loose VALUES (1, 1, NULL);
             INSERT INTO loose VALUES (2.5, 'x', NULL);",
        )?;
        let out = store.read_sql("loose", None)?;
        assert_eq!(out.schema().field(0).data_type(), &DataType::Float64);
        assert_eq!(out.schema().field(1).data_type(), &DataType::Utf8);
        assert_eq!(out.column(1).as_string::<i32>().value(0), "1");
        assert_eq!(out.schema().field(2).data_type(), &DataType::Utf8);
        assert_eq!(out.column(2).null_count(), 2);
        Ok(())
    }

    #[test]
    fn test_build_query() {
        assert_eq!(build_query("districts", None), "SELECT * FROM \"districts\"");
        assert_eq!(
            build_query("districts", Some("county = 'Adams'")),
            "SELECT * FROM \"districts\" WHERE county = 'Adams'"
        );
        assert_eq!(build_query("SELECT 1", None), "SELECT 1");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}

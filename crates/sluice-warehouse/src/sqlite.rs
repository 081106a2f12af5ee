use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use futures::future::BoxFuture;
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info};

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::{BulkLoad, QueryExecutor};
use sluice_core::types::{LoadOptions, LoadReport, Location, QueryJob, QueryMode, TableRef};

use crate::csv_load::parse_csv;
use crate::object_store::LocalObjectStore;

/// SQLite-backed warehouse.
///
/// Every `dataset.table` reference is a single SQLite object whose name is the
/// dotted string, so backtick-quoted references in query jobs resolve as-is.
pub struct SqliteWarehouse {
    conn: Mutex<Connection>,
    sources: LocalObjectStore,
}

impl SqliteWarehouse {
    /// Open or create a database file. Load sources resolve under `storage_root`.
    pub fn open(path: &Path, storage_root: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SluiceError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| SluiceError::Database(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| SluiceError::Database(e.to_string()))?;

        debug!(path = %path.display(), "SQLite warehouse opened");
        Ok(Self {
            conn: Mutex::new(conn),
            sources: LocalObjectStore::new(storage_root),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory(storage_root: &Path) -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| SluiceError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            sources: LocalObjectStore::new(storage_root),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SluiceError::Database(e.to_string()))
    }

    /// Load a CSV object into `destination`, replacing or appending per
    /// `options.overwrite`.
    pub fn load_csv(
        &self,
        source: &Location,
        destination: &TableRef,
        options: &LoadOptions,
    ) -> Result<LoadReport> {
        let path = self
            .sources
            .resolve(source)
            .map_err(|e| SluiceError::Load(e.to_string()))?;
        let file = std::fs::File::open(&path)
            .map_err(|e| SluiceError::Load(format!("cannot open {}: {}", path.display(), e)))?;
        let parsed = parse_csv(std::io::BufReader::new(file), options)?;
        if parsed.columns.is_empty() {
            return Err(SluiceError::Load(format!("{} has no columns", source)));
        }

        let name = ident(&destination.to_string());
        let column_defs = parsed
            .columns
            .iter()
            .map(|c| format!("{} {}", ident(&c.name), c.ty.sql()))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=parsed.columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");

        let mut conn = self.lock()?;
        let load_err = |e: rusqlite::Error| SluiceError::Load(format!("{}: {}", destination, e));
        let tx = conn.transaction().map_err(load_err)?;
        if options.overwrite {
            drop_object(&tx, &destination.to_string()).map_err(load_err)?;
        }
        tx.execute(
            &format!("CREATE TABLE IF NOT EXISTS {} ({})", name, column_defs),
            [],
        )
        .map_err(load_err)?;
        {
            let mut stmt = tx
                .prepare(&format!("INSERT INTO {} VALUES ({})", name, placeholders))
                .map_err(load_err)?;
            for row in &parsed.rows {
                let values = parsed
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(col, field)| col.ty.to_value(field.as_deref()));
                stmt.execute(params_from_iter(values)).map_err(load_err)?;
            }
        }
        tx.commit().map_err(load_err)?;

        info!(
            source = %source,
            destination = %destination,
            rows = parsed.rows.len(),
            skipped = parsed.bad_records,
            overwrite = options.overwrite,
            "CSV loaded into SQLite"
        );
        Ok(LoadReport {
            rows_loaded: parsed.rows.len(),
            rows_skipped: parsed.bad_records,
        })
    }

    /// Run a query job as `DROP ... IF EXISTS` followed by `CREATE ... AS`.
    pub fn run_job(&self, job: &QueryJob) -> Result<()> {
        let name = job.destination.to_string();
        let create = match job.mode {
            QueryMode::CreateOrReplaceTable => "CREATE TABLE",
            QueryMode::CreateOrReplaceView => "CREATE VIEW",
        };

        let mut conn = self.lock()?;
        let query_err = |e: rusqlite::Error| SluiceError::Query(format!("{}: {}", name, e));
        let tx = conn.transaction().map_err(query_err)?;
        drop_object(&tx, &name).map_err(query_err)?;
        tx.execute_batch(&format!("{} {} AS\n{};", create, ident(&name), job.select))
            .map_err(query_err)?;
        tx.commit().map_err(query_err)?;

        debug!(destination = %name, mode = job.mode.statement_prefix(), "Query job applied");
        Ok(())
    }

    /// `"table"`, `"view"`, or `None` if nothing by that name exists.
    pub fn object_type(&self, table: &TableRef) -> Result<Option<String>> {
        let conn = self.lock()?;
        object_type(&conn, &table.to_string()).map_err(|e| SluiceError::Database(e.to_string()))
    }

    pub fn column_names(&self, table: &TableRef) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let stmt = conn
            .prepare(&format!("SELECT * FROM {}", ident(&table.to_string())))
            .map_err(|e| SluiceError::Database(e.to_string()))?;
        Ok(stmt.column_names().into_iter().map(str::to_string).collect())
    }

    /// Every row of a table or view, rendered as text (`NULL` for nulls).
    pub fn table_rows(&self, table: &TableRef) -> Result<Vec<Vec<String>>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT * FROM {}", ident(&table.to_string())))
            .map_err(|e| SluiceError::Database(e.to_string()))?;
        let width = stmt.column_count();

        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get_ref(i).map(render))
                    .collect::<rusqlite::Result<Vec<String>>>()
            })
            .map_err(|e| SluiceError::Database(e.to_string()))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SluiceError::Database(e.to_string()))
    }
}

impl BulkLoad for SqliteWarehouse {
    fn load(
        &self,
        source: &Location,
        destination: &TableRef,
        options: &LoadOptions,
    ) -> BoxFuture<'_, Result<LoadReport>> {
        let source = source.clone();
        let destination = destination.clone();
        let options = options.clone();
        Box::pin(async move { self.load_csv(&source, &destination, &options) })
    }
}

impl QueryExecutor for SqliteWarehouse {
    fn execute(&self, job: &QueryJob) -> BoxFuture<'_, Result<()>> {
        let job = job.clone();
        Box::pin(async move { self.run_job(&job) })
    }
}

/// Double-quoted SQLite identifier.
fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn object_type(conn: &Connection, name: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT type FROM sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
        params![name],
        |row| row.get(0),
    )
    .optional()
}

/// Drop whatever table or view currently holds `name`.
fn drop_object(conn: &Connection, name: &str) -> rusqlite::Result<()> {
    match object_type(conn, name)?.as_deref() {
        Some("view") => conn.execute_batch(&format!("DROP VIEW {};", ident(name))),
        Some(_) => conn.execute_batch(&format!("DROP TABLE {};", ident(name))),
        None => Ok(()),
    }
}

fn render(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

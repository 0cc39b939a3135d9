//! Replicated embedded SQL store. Statements enter through consensus and are
//! executed against a local SQLite database on every replica; snapshots are a
//! gzip-compressed copy of the database file taken through the online backup
//! API.

use std::{
    collections::BTreeMap,
    io::{Read as _, Write as _},
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use rusqlite::Connection;

use crate::{
    applier::{Applier, ApplyError, SnapshotError, SnapshotReader, SnapshotWriter},
    command::{Command, CommandOutput},
};

/// File name the SQL store registers in every snapshot manifest.
pub const SQL_SNAPSHOT_FILE: &str = "store.db.gz";

#[derive(Debug)]
pub enum SqlError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    /// A positional parameter could not be bound.
    InvalidParam { index: usize, reason: String },
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "sqlite: {e}"),
            Self::Io(e) => write!(f, "sql store io: {e}"),
            Self::InvalidParam { index, reason } => {
                write!(f, "invalid parameter at index {index}: {reason}")
            }
        }
    }
}

impl std::error::Error for SqlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::InvalidParam { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for SqlError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<std::io::Error> for SqlError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// One SQLite connection behind a mutex. Writes arrive serialized from the
/// apply path already; the mutex exists for concurrent local reads.
pub struct SqlStore {
    conn: Mutex<Connection>,
}

impl SqlStore {
    pub fn open(path: &Path) -> Result<Self, SqlError> {
        Ok(Self {
            conn: Mutex::new(Connection::open(path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self, SqlError> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Execute one statement, returning the number of rows it changed.
    pub fn execute(&self, sql: &str, params: &[serde_json::Value]) -> Result<u64, SqlError> {
        let bound = bind_params(params)?;
        let conn = self.lock();
        let changed = conn.execute(sql, rusqlite::params_from_iter(bound))?;
        Ok(changed as u64)
    }

    /// Local read path: run a query and return rows as column-name maps.
    pub fn query(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<BTreeMap<String, serde_json::Value>>, SqlError> {
        let bound = bind_params(params)?;
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt.query(rusqlite::params_from_iter(bound))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = BTreeMap::new();
            for (i, name) in columns.iter().enumerate() {
                record.insert(name.clone(), column_to_json(row.get_ref(i)?));
            }
            out.push(record);
        }
        Ok(out)
    }

    /// Online backup of the live database into `path`.
    pub fn backup_to(&self, path: &Path) -> Result<(), SqlError> {
        let conn = self.lock();
        let mut dst = Connection::open(path)?;
        let backup = rusqlite::backup::Backup::new(&conn, &mut dst)?;
        backup.run_to_completion(64, std::time::Duration::from_millis(5), None)?;
        Ok(())
    }

    /// Replace the live database wholesale with the contents of `path`.
    pub fn restore_from(&self, path: &Path) -> Result<(), SqlError> {
        let src = Connection::open(path)?;
        let mut conn = self.lock();
        let backup = rusqlite::backup::Backup::new(&src, &mut conn)?;
        backup.run_to_completion(64, std::time::Duration::from_millis(5), None)?;
        Ok(())
    }
}

fn bind_params(params: &[serde_json::Value]) -> Result<Vec<rusqlite::types::Value>, SqlError> {
    use rusqlite::types::Value;

    params
        .iter()
        .enumerate()
        .map(|(index, param)| match param {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Integer(*b as i64)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Real(f))
                } else {
                    Err(SqlError::InvalidParam {
                        index,
                        reason: format!("number out of range: {n}"),
                    })
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Err(SqlError::InvalidParam {
                    index,
                    reason: "arrays and objects are not bindable".to_string(),
                })
            }
        })
        .collect()
}

fn column_to_json(value: rusqlite::types::ValueRef<'_>) -> serde_json::Value {
    use rusqlite::types::ValueRef;

    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::from(
            b.iter().map(|byte| serde_json::Value::from(*byte)).collect::<Vec<_>>(),
        ),
    }
}

/// SQL side of the applier contract.
pub struct SqlApplier {
    store: Arc<SqlStore>,
}

impl SqlApplier {
    pub fn new(store: Arc<SqlStore>) -> Self {
        Self { store }
    }
}

impl Applier for SqlApplier {
    fn execute(&self, cmd: &Command) -> Result<CommandOutput, ApplyError> {
        match cmd {
            Command::Sql(op) => match self.store.execute(&op.sql, &op.params) {
                Ok(rows_affected) => Ok(CommandOutput::Sql { rows_affected }),
                // A failed statement is this entry's outcome, not a fault.
                Err(err) => Err(ApplyError::Rejected {
                    code: "sql_error",
                    message: err.to_string(),
                }),
            },
            Command::Registry(_) => Err(ApplyError::UnsupportedCommand { got: "registry" }),
        }
    }

    fn save_snapshot(&self, writer: &mut SnapshotWriter) -> Result<(), SnapshotError> {
        let raw = writer.file_path("store.db");
        self.store
            .backup_to(&raw)
            .map_err(|e| SnapshotError::Corrupt { reason: e.to_string() })?;

        let compressed = writer.file_path(SQL_SNAPSHOT_FILE);
        let mut input = std::fs::File::open(&raw)?;
        let mut encoder = GzEncoder::new(std::fs::File::create(&compressed)?, Compression::default());
        std::io::copy(&mut input, &mut encoder)?;
        encoder.finish()?.flush()?;
        std::fs::remove_file(&raw)?;

        writer.add_file(SQL_SNAPSHOT_FILE);
        Ok(())
    }

    fn load_snapshot(&self, reader: &SnapshotReader) -> Result<(), SnapshotError> {
        if !reader.contains(SQL_SNAPSHOT_FILE) {
            return Err(SnapshotError::MissingFile {
                name: SQL_SNAPSHOT_FILE.to_string(),
            });
        }

        let raw = reader.file_path("store.db");
        let mut decoder = GzDecoder::new(std::fs::File::open(reader.file_path(SQL_SNAPSHOT_FILE))?);
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes)?;
        std::fs::write(&raw, bytes)?;

        let result = self
            .store
            .restore_from(&raw)
            .map_err(|e| SnapshotError::Corrupt { reason: e.to_string() });
        let _ = std::fs::remove_file(&raw);
        result
    }
}

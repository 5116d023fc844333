//! # vg-store: The "Vault" of VIGIL
//!
//! SQLite-backed [`LogSink`] and read side for the audit trail. Records live
//! in `records`, their meta in `record_meta` (cascade-deleted with the
//! record). Reads go through [`vg_query::record::RecordQuery`], compiled to
//! parameterized SQL and run by [`executor`].

pub mod executor;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Timelike, Utc};
use rusqlite::{params, Connection};
use vg_core::{LogSink, NewRecord, Record, SinkError, TIMESTAMP_FORMAT};
use vg_query::record::RecordQuery;

pub use executor::{RecordPage, RowPage};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid record: {0}")]
    Invalid(String),

    #[error("Store connection lock poisoned")]
    Poisoned,
}

impl From<StoreError> for SinkError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invalid(reason) => SinkError::Invalid(reason),
            StoreError::Poisoned => SinkError::Unavailable,
            other => SinkError::Storage(other.to_string()),
        }
    }
}

/// One SQLite connection behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        tracing::info!("Opened record store at {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        schema::install(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert `record` and its meta in one transaction. `created_at`
    /// defaults to `now` and is stored with microsecond precision.
    pub fn insert(&self, record: NewRecord, now: DateTime<Utc>) -> Result<Record, StoreError> {
        record
            .validate()
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let created_at = truncate_micros(record.created_at.unwrap_or(now));

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO records (object_id, actor_id, actor_role, created_at, summary, connector, context, action, ip) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.object_id,
                record.actor_id,
                record.actor_role,
                created_at.format(TIMESTAMP_FORMAT).to_string(),
                record.summary,
                record.connector,
                record.context,
                record.action,
                record.ip,
            ],
        )?;
        let id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO record_meta (record_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
            )?;
            for (key, values) in &record.meta {
                for value in values {
                    stmt.execute(params![id, key, value])?;
                }
            }
        }
        tx.commit()?;

        tracing::debug!(
            "Stored record {} ({}/{}/{})",
            id,
            record.connector,
            record.context,
            record.action
        );
        Ok(NewRecord {
            created_at: Some(created_at),
            ..record
        }
        .into_record(id, created_at))
    }

    pub fn query(&self, query: &RecordQuery) -> Result<RecordPage, StoreError> {
        let conn = self.conn()?;
        executor::execute(&conn, query)
    }

    /// Like [`SqliteStore::query`], restricted to the query's `fields`.
    pub fn query_rows(&self, query: &RecordQuery) -> Result<RowPage, StoreError> {
        let conn = self.conn()?;
        executor::execute_rows(&conn, query)
    }

    /// Delete records created more than `days` days before `now`.
    pub fn purge_older_than(&self, days: u32, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = now - Duration::days(i64::from(days));
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM records WHERE created_at < ?1",
            params![cutoff.format(TIMESTAMP_FORMAT).to_string()],
        )?;
        tracing::info!("Purged {} records older than {} days", deleted, days);
        Ok(deleted)
    }

    /// Remove every record and restart id assignment.
    pub fn reset(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM record_meta;
             DELETE FROM records;
             DELETE FROM sqlite_sequence WHERE name IN ('records', 'record_meta');",
        )?;
        tx.commit()?;
        tracing::warn!("Record store reset");
        Ok(())
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(total.max(0) as u64)
    }
}

impl LogSink for SqliteStore {
    fn write(&self, record: NewRecord) -> Result<Record, SinkError> {
        Ok(self.insert(record, Utc::now())?)
    }
}

fn truncate_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    let micros = at.nanosecond() / 1_000 * 1_000;
    at.with_nanosecond(micros).unwrap_or(at)
}

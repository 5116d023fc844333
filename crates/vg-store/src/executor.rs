//! # Query Executor
//!
//! Runs compiled [`RecordQuery`] statements against the SQLite connection
//! and hydrates the matching rows.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{NaiveDateTime, TimeZone, Utc};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{params_from_iter, Connection, Row};
use serde_json::{Map, Value};
use vg_core::{Record, RecordId, RecordMeta, TIMESTAMP_PARSE_FORMAT};
use vg_query::compiler::Dialect;
use vg_query::record::{RecordField, RecordQuery};

use crate::StoreError;

/// One page of full records plus the unpaged match count.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPage {
    pub records: Vec<Record>,
    pub total: u64,
    pub query_time_ms: u64,
}

/// One page of projected rows, keyed by column name.
#[derive(Debug, Clone, PartialEq)]
pub struct RowPage {
    pub rows: Vec<Map<String, Value>>,
    pub total: u64,
    pub query_time_ms: u64,
}

/// Execute `query` returning full records with their meta.
pub fn execute(conn: &Connection, query: &RecordQuery) -> Result<RecordPage, StoreError> {
    let start = Instant::now();

    let mut full = query.clone();
    full.fields = RecordField::ALL.to_vec();
    let compiled = full.compile(Dialect::Sqlite);

    let mut stmt = conn.prepare(&compiled.select_sql)?;
    let mut records = stmt
        .query_map(params_from_iter(compiled.params.iter()), record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let total = count(conn, &compiled.count_sql, &compiled.params)?;

    let ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();
    let mut meta = load_meta(conn, &ids)?;
    for record in &mut records {
        if let Some(values) = meta.remove(&record.id) {
            record.meta = values;
        }
    }

    Ok(RecordPage {
        records,
        total,
        query_time_ms: start.elapsed().as_millis() as u64,
    })
}

/// Execute `query` returning only its projected columns.
pub fn execute_rows(conn: &Connection, query: &RecordQuery) -> Result<RowPage, StoreError> {
    let start = Instant::now();
    let compiled = query.compile(Dialect::Sqlite);

    let mut stmt = conn.prepare(&compiled.select_sql)?;
    let rows = stmt
        .query_map(params_from_iter(compiled.params.iter()), |row| {
            let mut out = Map::new();
            for (i, field) in compiled.fields.iter().enumerate() {
                out.insert(field.column().to_string(), json_value(row.get_ref(i)?));
            }
            Ok(out)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let total = count(conn, &compiled.count_sql, &compiled.params)?;

    Ok(RowPage {
        rows,
        total,
        query_time_ms: start.elapsed().as_millis() as u64,
    })
}

fn count(conn: &Connection, sql: &str, params: &[String]) -> Result<u64, StoreError> {
    let total: i64 = conn.query_row(sql, params_from_iter(params.iter()), |row| row.get(0))?;
    Ok(total.max(0) as u64)
}

/// Columns in [`RecordField::ALL`] order.
fn record_from_row(row: &Row<'_>) -> rusqlite::Result<Record> {
    let created_at: String = row.get(4)?;
    let created_at = NaiveDateTime::parse_from_str(&created_at, TIMESTAMP_PARSE_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(Record {
        id: row.get(0)?,
        object_id: row.get(1)?,
        actor_id: row.get(2)?,
        actor_role: row.get(3)?,
        created_at,
        summary: row.get(5)?,
        connector: row.get(6)?,
        context: row.get(7)?,
        action: row.get(8)?,
        ip: row.get(9)?,
        meta: RecordMeta::new(),
    })
}

/// Ids bound per meta lookup. Stays well under SQLite's variable limit.
pub const META_BATCH: usize = 500;

/// Meta of the given records, values in insertion order.
pub fn load_meta(
    conn: &Connection,
    ids: &[RecordId],
) -> Result<HashMap<RecordId, RecordMeta>, StoreError> {
    let mut meta: HashMap<RecordId, RecordMeta> = HashMap::new();
    for batch in ids.chunks(META_BATCH) {
        let placeholders = vec!["?"; batch.len()].join(", ");
        let sql = format!(
            "SELECT record_id, meta_key, meta_value FROM record_meta \
             WHERE record_id IN ({placeholders}) ORDER BY meta_id"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(batch.iter()), |row| {
            Ok((
                row.get::<_, RecordId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (record_id, key, value) = row?;
            meta.entry(record_id).or_default().entry(key).or_default().push(value);
        }
    }
    Ok(meta)
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

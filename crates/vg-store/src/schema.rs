//! Table layout and connection setup.

use std::sync::Arc;

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    object_id   INTEGER,
    actor_id    INTEGER NOT NULL DEFAULT 0,
    actor_role  TEXT    NOT NULL DEFAULT '',
    created_at  TEXT    NOT NULL,
    summary     TEXT    NOT NULL,
    connector   TEXT    NOT NULL,
    context     TEXT    NOT NULL,
    action      TEXT    NOT NULL,
    ip          TEXT
);
CREATE INDEX IF NOT EXISTS records_created_at ON records (created_at);
CREATE INDEX IF NOT EXISTS records_labels ON records (connector, context, action);
CREATE INDEX IF NOT EXISTS records_actor ON records (actor_id);

CREATE TABLE IF NOT EXISTS record_meta (
    meta_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id   INTEGER NOT NULL REFERENCES records (id) ON DELETE CASCADE,
    meta_key    TEXT    NOT NULL,
    meta_value  TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS record_meta_record ON record_meta (record_id);
CREATE INDEX IF NOT EXISTS record_meta_key ON record_meta (meta_key);
"#;

/// Enable foreign keys, create tables and register SQL functions.
pub fn install(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    register_regexp(conn)
}

/// `text REGEXP pattern`. SQLite parses the operator but ships no
/// implementation. NULL text yields NULL; the compiled pattern is cached
/// per statement.
fn register_regexp(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern: Arc<Regex> = ctx.get_or_create_aux(0, |raw| -> Result<_, BoxError> {
                Ok(Regex::new(raw.as_str()?)?)
            })?;
            let Ok(text) = ctx.get_raw(1).as_str() else {
                return Ok(None);
            };
            Ok(Some(pattern.is_match(text)))
        },
    )
}

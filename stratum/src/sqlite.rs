//! SQLite backend, built on `rusqlite`.
//!
//! SQLite has a single writer per database file, so there is no advisory lock; the gateway uses
//! a [NullLocker](crate::NullLocker). DDL is transactional, so a failed migrate leaves no tables
//! behind.

use crate::connection::{Connection, Driver, Row, Value};
use crate::dialect::{quote_with, Bookkeeping, Dialect, Query};
use crate::dialect::{BATCH_COLUMN, NAME_COLUMN, VERSION_COLUMN};
use crate::error::Error;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, ErrorCode, ToSql};

const IN_MEMORY: &str = ":memory:";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Default)]
pub struct SqliteDialect {
    bookkeeping: Bookkeeping,
}

impl SqliteDialect {
    pub fn new(bookkeeping: Bookkeeping) -> Self {
        Self { bookkeeping }
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn bookkeeping(&self) -> &Bookkeeping {
        &self.bookkeeping
    }

    fn quote(&self, ident: &str) -> String {
        quote_with(ident, '"')
    }

    fn placeholder(&self, _position: usize) -> String {
        "?".to_string()
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({} INTEGER PRIMARY KEY NOT NULL, {} INTEGER NOT NULL, {} VARCHAR(255) NOT NULL, {} TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)",
            self.table(),
            self.quote(VERSION_COLUMN),
            self.quote(BATCH_COLUMN),
            self.quote(NAME_COLUMN),
            self.quote(&self.bookkeeping.applied_at_column),
        )
    }

    fn show_tables_query(&self) -> Query {
        Query::new(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Int(v) => ToSqlOutput::from(*v),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Timestamp(t) => ToSqlOutput::from(t.format(TIMESTAMP_FORMAT).to_string()),
        })
    }
}

fn decode(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Text(v.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

impl Connection for rusqlite::Connection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let changed = rusqlite::Connection::execute(self, sql, params_from_iter(params.iter()))?;
        Ok(changed as u64)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let mut stmt = self.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut decoded = Vec::new();
        while let Some(row) = rows.next()? {
            let values = (0..columns)
                .map(|idx| row.get_ref(idx).map(decode))
                .collect::<Result<Vec<_>, _>>()?;
            decoded.push(Row::new(values));
        }
        Ok(decoded)
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), Error> {
        self.execute_batch(sql)?;
        Ok(())
    }

    fn ping(&mut self) -> Result<(), Error> {
        self.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

/// Opens a database file, or a private in-memory database.
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    path: String,
}

impl SqliteDriver {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_memory() -> Self {
        Self::new(IN_MEMORY)
    }

    /// Accepts `sqlite:<path>`, `sqlite://<path>` and `sqlite::memory:`.
    pub fn from_url(url: &str) -> Result<Self, Error> {
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .ok_or_else(|| Error::InvalidDatabaseUrl(url.to_string()))?;
        if path.is_empty() {
            return Err(Error::InvalidDatabaseUrl(url.to_string()));
        }
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Driver for SqliteDriver {
    fn open(&self) -> Result<Box<dyn Connection>, Error> {
        let conn = if self.path == IN_MEMORY {
            rusqlite::Connection::open_in_memory()?
        } else {
            rusqlite::Connection::open(&self.path)?
        };
        Ok(Box::new(conn))
    }

    fn is_retryable(&self, err: &Error) -> bool {
        match err {
            Error::Rusqlite(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn create_table_sql() {
        assert_eq!(
            SqliteDialect::default().create_table_sql(),
            "CREATE TABLE IF NOT EXISTS \"schema_migrations\" (\"version\" INTEGER PRIMARY KEY NOT NULL, \"batch\" INTEGER NOT NULL, \"name\" VARCHAR(255) NOT NULL, \"migrated_at\" TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)"
        );
    }

    #[test]
    fn placeholders_are_positional_question_marks() {
        let query = SqliteDialect::default()
            .remove_query(&crate::Version::new(1596897167, "create foo table"))
            .unwrap();
        assert_eq!(
            query.sql,
            "DELETE FROM \"schema_migrations\" WHERE \"version\" = ?"
        );
    }

    #[test]
    fn parses_urls() {
        assert_eq!(SqliteDriver::from_url("sqlite:app.db").unwrap().path(), "app.db");
        assert_eq!(
            SqliteDriver::from_url("sqlite:///tmp/app.db").unwrap().path(),
            "/tmp/app.db"
        );
        assert_eq!(
            SqliteDriver::from_url("sqlite::memory:").unwrap().path(),
            ":memory:"
        );
        assert!(matches!(
            SqliteDriver::from_url("mysql://localhost"),
            Err(Error::InvalidDatabaseUrl(_))
        ));
        assert!(matches!(
            SqliteDriver::from_url("sqlite:"),
            Err(Error::InvalidDatabaseUrl(_))
        ));
    }

    #[test]
    fn connection_round_trips_values() {
        let mut conn = SqliteDriver::in_memory().open().unwrap();
        conn.ping().unwrap();
        conn.batch_execute("CREATE TABLE t (id INTEGER, label TEXT, at TIMESTAMP); CREATE TABLE u (id INTEGER)")
            .unwrap();
        let at = Utc.with_ymd_and_hms(2020, 8, 8, 14, 32, 47).unwrap();
        let changed = conn
            .execute(
                "INSERT INTO t (id, label, at) VALUES (?, ?, ?)",
                &[Value::Int(7), Value::Text("seven".into()), Value::Timestamp(at)],
            )
            .unwrap();
        assert_eq!(changed, 1);
        conn.execute("INSERT INTO t (id, label, at) VALUES (?, ?, ?)", &[Value::Int(8), Value::Null, Value::Null])
            .unwrap();

        let rows = conn
            .query("SELECT id, label, at FROM t ORDER BY id", &[])
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].int(0).unwrap(), 7);
        assert_eq!(rows[0].text(1).unwrap(), "seven");
        assert_eq!(rows[0].timestamp(2).unwrap(), Some(at));
        assert_eq!(rows[1].get(1), Some(&Value::Null));

        let tables = conn
            .query(&SqliteDialect::default().show_tables_query().sql, &[])
            .unwrap()
            .iter()
            .map(|row| row.text(0).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(tables, vec!["t", "u"]);
    }

    #[test]
    fn sql_errors_surface() {
        let mut conn = SqliteDriver::in_memory().open().unwrap();
        assert!(matches!(
            conn.batch_execute("CREATE TABLE"),
            Err(Error::Rusqlite(_))
        ));
        assert!(!SqliteDriver::in_memory().is_retryable(&Error::Generic("x".into())));
    }
}

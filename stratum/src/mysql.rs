//! MySQL backend, built on the `mysql` crate.
//!
//! Migrators serialize on a named lock (`GET_LOCK`). MySQL commits DDL implicitly, so a failed
//! migrate rolls back its bookkeeping rows but cannot undo tables a script already created.

use crate::connection::{Connection, Driver, Row, Value};
use crate::context::Context;
use crate::dialect::{quote_with, Bookkeeping, Dialect, Query};
use crate::dialect::{BATCH_COLUMN, NAME_COLUMN, VERSION_COLUMN};
use crate::error::Error;
use crate::locker::Locker;
use chrono::{Datelike, NaiveDate, Timelike};
use mysql::prelude::Queryable;
use mysql::{Opts, Params, Pool, PooledConn};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct MysqlDialect {
    bookkeeping: Bookkeeping,
}

impl MysqlDialect {
    pub fn new(bookkeeping: Bookkeeping) -> Self {
        Self { bookkeeping }
    }
}

impl Dialect for MysqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn bookkeeping(&self) -> &Bookkeeping {
        &self.bookkeeping
    }

    fn quote(&self, ident: &str) -> String {
        quote_with(ident, '`')
    }

    fn placeholder(&self, _position: usize) -> String {
        "?".to_string()
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({} BIGINT NOT NULL PRIMARY KEY, {} BIGINT NOT NULL, {} VARCHAR(255) NOT NULL, {} TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)",
            self.table(),
            self.quote(VERSION_COLUMN),
            self.quote(BATCH_COLUMN),
            self.quote(NAME_COLUMN),
            self.quote(&self.bookkeeping.applied_at_column),
        )
    }

    fn show_tables_query(&self) -> Query {
        Query::new(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = DATABASE() ORDER BY table_name",
        )
    }

    fn begin_statement(&self, read_only: bool) -> &'static str {
        if read_only {
            "START TRANSACTION READ ONLY"
        } else {
            "START TRANSACTION"
        }
    }
}

fn encode(value: &Value) -> mysql::Value {
    match value {
        Value::Null => mysql::Value::NULL,
        Value::Int(v) => mysql::Value::Int(*v),
        Value::Text(s) => mysql::Value::Bytes(s.as_bytes().to_vec()),
        Value::Timestamp(t) => mysql::Value::Date(
            t.year() as u16,
            t.month() as u8,
            t.day() as u8,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.timestamp_subsec_micros(),
        ),
    }
}

fn decode(value: &mysql::Value) -> Value {
    match value {
        mysql::Value::NULL => Value::Null,
        mysql::Value::Bytes(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        mysql::Value::Int(v) => Value::Int(*v),
        mysql::Value::UInt(v) => i64::try_from(*v)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(v.to_string())),
        mysql::Value::Date(year, month, day, hour, minute, second, micros) => {
            NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day))
                .and_then(|date| {
                    date.and_hms_micro_opt(
                        u32::from(*hour),
                        u32::from(*minute),
                        u32::from(*second),
                        *micros,
                    )
                })
                .map(|t| Value::Timestamp(t.and_utc()))
                .unwrap_or(Value::Null)
        }
        other => Value::Text(other.as_sql(true).trim_matches('\'').to_string()),
    }
}

fn params(values: &[Value]) -> Params {
    if values.is_empty() {
        Params::Empty
    } else {
        Params::Positional(values.iter().map(encode).collect())
    }
}

impl Connection for PooledConn {
    fn execute(&mut self, sql: &str, values: &[Value]) -> Result<u64, Error> {
        Queryable::exec_drop(self, sql, params(values))?;
        Ok(self.affected_rows())
    }

    fn query(&mut self, sql: &str, values: &[Value]) -> Result<Vec<Row>, Error> {
        let rows: Vec<mysql::Row> = Queryable::exec(self, sql, params(values))?;
        Ok(rows
            .iter()
            .map(|row| {
                Row::new(
                    (0..row.len())
                        .map(|idx| row.as_ref(idx).map(decode).unwrap_or(Value::Null))
                        .collect(),
                )
            })
            .collect())
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), Error> {
        Queryable::query_drop(self, sql)?;
        Ok(())
    }

    fn ping(&mut self) -> Result<(), Error> {
        Queryable::query_drop(self, "SELECT 1")?;
        Ok(())
    }
}

/// Opens a pool for the URL and checks out one connection from it.
#[derive(Clone)]
pub struct MysqlDriver {
    opts: Opts,
}

// keep credentials out of logs
impl fmt::Debug for MysqlDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MysqlDriver")
            .field("host", &self.opts.get_ip_or_hostname())
            .field("port", &self.opts.get_tcp_port())
            .field("database", &self.opts.get_db_name())
            .finish()
    }
}

impl MysqlDriver {
    pub fn from_url(url: &str) -> Result<Self, Error> {
        let opts =
            Opts::from_url(url).map_err(|err| Error::InvalidDatabaseUrl(format!("{url}: {err}")))?;
        Ok(Self { opts })
    }
}

impl Driver for MysqlDriver {
    fn open(&self) -> Result<Box<dyn Connection>, Error> {
        let pool = Pool::new(self.opts.clone())?;
        let mut conn = pool.get_conn()?;
        // applied-at timestamps are read and written as UTC
        conn.query_drop("SET time_zone = '+00:00'")?;
        Ok(Box::new(conn))
    }
}

/// Named advisory lock through `GET_LOCK` / `RELEASE_LOCK`.
#[derive(Debug, Clone)]
pub struct MysqlLocker {
    key: String,
    timeout: Duration,
    no_lock: bool,
}

impl MysqlLocker {
    pub fn new(key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            key: key.into(),
            timeout,
            no_lock: false,
        }
    }

    /// Turn locking into a no-op.
    pub fn with_no_lock(mut self, no_lock: bool) -> Self {
        self.no_lock = no_lock;
        self
    }

    /// Seconds to wait for the lock: the configured timeout, clamped to what is left of `ctx`.
    fn wait_seconds(&self, ctx: &Context) -> i64 {
        let wait = match ctx.remaining() {
            Some(remaining) => self.timeout.min(remaining),
            None => self.timeout,
        };
        i64::try_from(wait.as_secs()).unwrap_or(i64::MAX)
    }
}

fn single_int(rows: &[Row]) -> Option<i64> {
    rows.first().and_then(|row| row.int(0).ok())
}

impl Locker for MysqlLocker {
    fn lock(&self, ctx: &Context, conn: &mut dyn Connection) -> Result<(), Error> {
        if self.no_lock {
            return Ok(());
        }
        let seconds = self.wait_seconds(ctx);
        let rows = conn.query(
            "SELECT GET_LOCK(?, ?)",
            &[Value::Text(self.key.clone()), Value::Int(seconds)],
        )?;
        match single_int(&rows) {
            Some(1) => Ok(()),
            Some(_) => Err(Error::Generic(format!(
                "timed out after {seconds}s waiting for lock '{}'",
                self.key
            ))),
            None => Err(Error::Generic(format!(
                "server failed to acquire lock '{}'",
                self.key
            ))),
        }
    }

    fn unlock(&self, _ctx: &Context, conn: &mut dyn Connection) -> Result<(), Error> {
        if self.no_lock {
            return Ok(());
        }
        let rows = conn.query("SELECT RELEASE_LOCK(?)", &[Value::Text(self.key.clone())])?;
        match single_int(&rows) {
            Some(1) => Ok(()),
            Some(_) => Err(Error::Generic(format!(
                "lock '{}' is held by another session",
                self.key
            ))),
            None => Err(Error::Generic(format!("lock '{}' does not exist", self.key))),
        }
    }
}

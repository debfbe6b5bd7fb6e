//! PostgreSQL backend, built on the blocking `postgres` client.
//!
//! Migrators serialize on a session-level advisory lock whose integer id is derived from the
//! configured lock key. DDL is transactional, so a failed migrate leaves no tables behind.

use crate::connection::{Connection, Driver, Row, Value};
use crate::context::Context;
use crate::dialect::{quote_with, Bookkeeping, Dialect, Query};
use crate::dialect::{BATCH_COLUMN, NAME_COLUMN, VERSION_COLUMN};
use crate::error::Error;
use crate::locker::Locker;
use chrono::{DateTime, NaiveDateTime, Utc};
use postgres::types::{FromSql, ToSql, Type};
use postgres::{Client, Config, NoTls};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct PostgresDialect {
    bookkeeping: Bookkeeping,
}

impl PostgresDialect {
    pub fn new(bookkeeping: Bookkeeping) -> Self {
        Self { bookkeeping }
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn bookkeeping(&self) -> &Bookkeeping {
        &self.bookkeeping
    }

    fn quote(&self, ident: &str) -> String {
        quote_with(ident, '"')
    }

    fn placeholder(&self, position: usize) -> String {
        format!("${position}")
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({} BIGINT PRIMARY KEY NOT NULL, {} BIGINT NOT NULL, {} VARCHAR(255) NOT NULL, {} TIMESTAMP NOT NULL DEFAULT (now() AT TIME ZONE 'utc'))",
            self.table(),
            self.quote(VERSION_COLUMN),
            self.quote(BATCH_COLUMN),
            self.quote(NAME_COLUMN),
            self.quote(&self.bookkeeping.applied_at_column),
        )
    }

    fn show_tables_query(&self) -> Query {
        Query::new(
            "SELECT tablename::text FROM pg_catalog.pg_tables WHERE schemaname = current_schema() ORDER BY tablename",
        )
    }

    fn begin_statement(&self, read_only: bool) -> &'static str {
        if read_only {
            "BEGIN READ ONLY"
        } else {
            "BEGIN"
        }
    }
}

type Param = Box<dyn ToSql + Sync>;

fn encode(value: &Value) -> Param {
    match value {
        Value::Null => Box::new(None::<String>),
        Value::Int(v) => Box::new(*v),
        Value::Text(s) => Box::new(s.clone()),
        Value::Timestamp(t) => Box::new(t.naive_utc()),
    }
}

fn decode(row: &postgres::Row, idx: usize, ty: &Type) -> Result<Value, Error> {
    let value = match *ty {
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| Value::Int(i64::from(v))),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Int(i64::from(v))),
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)?
            .map(|v| Value::Int(i64::from(v))),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|t| Value::Timestamp(t.and_utc())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(Value::Timestamp),
        ref other if <String as FromSql>::accepts(other) => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
        }
        _ => None,
    };
    Ok(value.unwrap_or(Value::Null))
}

impl Connection for Client {
    fn execute(&mut self, sql: &str, values: &[Value]) -> Result<u64, Error> {
        let params = values.iter().map(encode).collect::<Vec<_>>();
        let refs = params.iter().map(|p| p.as_ref()).collect::<Vec<_>>();
        Ok(Client::execute(self, sql, &refs)?)
    }

    fn query(&mut self, sql: &str, values: &[Value]) -> Result<Vec<Row>, Error> {
        let params = values.iter().map(encode).collect::<Vec<_>>();
        let refs = params.iter().map(|p| p.as_ref()).collect::<Vec<_>>();
        Client::query(self, sql, &refs)?
            .iter()
            .map(|row| {
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| decode(row, idx, column.type_()))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Row::new)
            })
            .collect()
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), Error> {
        Client::batch_execute(self, sql)?;
        Ok(())
    }

    fn ping(&mut self) -> Result<(), Error> {
        Client::batch_execute(self, "SELECT 1")?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PostgresDriver {
    config: Config,
}

// keep credentials out of logs
impl fmt::Debug for PostgresDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresDriver")
            .field("hosts", &self.config.get_hosts())
            .field("ports", &self.config.get_ports())
            .field("dbname", &self.config.get_dbname())
            .finish()
    }
}

impl PostgresDriver {
    pub fn from_url(url: &str) -> Result<Self, Error> {
        let config = url
            .parse::<Config>()
            .map_err(|err| Error::InvalidDatabaseUrl(format!("{url}: {err}")))?;
        Ok(Self { config })
    }
}

impl Driver for PostgresDriver {
    fn open(&self) -> Result<Box<dyn Connection>, Error> {
        Ok(Box::new(self.config.connect(NoTls)?))
    }
}

/// Session-level advisory lock through `pg_advisory_lock` / `pg_advisory_unlock`.
#[derive(Debug, Clone)]
pub struct PostgresLocker {
    id: i64,
    timeout: Duration,
    no_lock: bool,
}

impl PostgresLocker {
    pub fn new(key: &str, timeout: Duration) -> Self {
        Self {
            id: lock_id(key),
            timeout,
            no_lock: false,
        }
    }

    /// Turn locking into a no-op.
    pub fn with_no_lock(mut self, no_lock: bool) -> Self {
        self.no_lock = no_lock;
        self
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

/// The first eight bytes of the key's SHA-256, big-endian.
pub fn lock_id(key: &str) -> i64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

impl Locker for PostgresLocker {
    fn lock(&self, ctx: &Context, conn: &mut dyn Connection) -> Result<(), Error> {
        if self.no_lock {
            return Ok(());
        }
        let wait = match ctx.remaining() {
            Some(remaining) => self.timeout.min(remaining),
            None => self.timeout,
        };
        // lock_timeout 0 means wait forever
        let millis = wait.as_millis().max(1);
        conn.batch_execute(&format!("SET lock_timeout = {millis}"))?;
        let locked = conn.query("SELECT pg_advisory_lock($1)", &[Value::Int(self.id)]);
        let reset = conn.batch_execute("RESET lock_timeout");
        locked?;
        reset
    }

    fn unlock(&self, _ctx: &Context, conn: &mut dyn Connection) -> Result<(), Error> {
        if self.no_lock {
            return Ok(());
        }
        let rows = conn.query("SELECT pg_advisory_unlock($1)", &[Value::Int(self.id)])?;
        match rows.first().and_then(|row| row.int(0).ok()) {
            Some(1) => Ok(()),
            _ => Err(Error::Generic(format!(
                "advisory lock {} was not held by this session",
                self.id
            ))),
        }
    }
}

//! The narrow interface the engine needs from a database driver.

use crate::error::Error;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;

/// A bound parameter or a decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

/// Formats accepted when a timestamp column comes back as text.
const TEXT_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// One result row, columns in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(Vec<Value>);

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    fn column(&self, idx: usize) -> Result<&Value, Error> {
        self.0
            .get(idx)
            .ok_or_else(|| Error::Decode(format!("no column at index {idx}")))
    }

    pub fn int(&self, idx: usize) -> Result<i64, Error> {
        match self.column(idx)? {
            Value::Int(v) => Ok(*v),
            Value::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| Error::Decode(format!("column {idx}: '{s}' is not an integer"))),
            other => Err(Error::Decode(format!(
                "column {idx}: expected an integer, found {other:?}"
            ))),
        }
    }

    pub fn text(&self, idx: usize) -> Result<String, Error> {
        match self.column(idx)? {
            Value::Text(s) => Ok(s.clone()),
            Value::Int(v) => Ok(v.to_string()),
            other => Err(Error::Decode(format!(
                "column {idx}: expected text, found {other:?}"
            ))),
        }
    }

    /// A timestamp column; backends without a native timestamp type return text.
    pub fn timestamp(&self, idx: usize) -> Result<Option<DateTime<Utc>>, Error> {
        match self.column(idx)? {
            Value::Null => Ok(None),
            Value::Timestamp(t) => Ok(Some(*t)),
            Value::Text(s) => parse_text_timestamp(s).map(Some),
            other => Err(Error::Decode(format!(
                "column {idx}: expected a timestamp, found {other:?}"
            ))),
        }
    }
}

fn parse_text_timestamp(s: &str) -> Result<DateTime<Utc>, Error> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    TEXT_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .map(|t| t.and_utc())
        .ok_or_else(|| Error::Decode(format!("'{s}' is not a timestamp")))
}

/// A live database session.
///
/// Transactions and advisory locks are session state, so the engine issues every statement of an
/// operation on the same `Connection`.
pub trait Connection: Send {
    /// Run a single parameterized statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error>;

    /// Run a single parameterized query and decode every row.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error>;

    /// Run a script that may contain several statements and no parameters.
    fn batch_execute(&mut self, sql: &str) -> Result<(), Error>;

    /// Round-trip to the server to confirm the session is alive.
    fn ping(&mut self) -> Result<(), Error>;
}

impl fmt::Debug for dyn Connection + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Connection")
    }
}

/// Opens new sessions for the [Connector](crate::Connector).
pub trait Driver: Send + Sync + fmt::Debug {
    fn open(&self) -> Result<Box<dyn Connection>, Error>;

    /// Whether a failure from [Driver::open] or a ping is worth retrying.
    fn is_retryable(&self, err: &Error) -> bool {
        !matches!(
            err,
            Error::InvalidDatabaseUrl(_) | Error::UnsupportedBackend(_)
        )
    }
}

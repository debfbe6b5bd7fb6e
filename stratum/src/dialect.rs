//! Backend-specific SQL for the bookkeeping table.
//!
//! A [Dialect] is a stateless query builder: it owns the names of the bookkeeping table and its
//! timestamp column and turns requests into SQL plus bound parameters. It never talks to the
//! database itself.

use crate::connection::{Row, Value};
use crate::core::Version;
use crate::error::Error;
use std::fmt;

pub(crate) const DEFAULT_TABLE_NAME: &str = "schema_migrations";
pub(crate) const DEFAULT_APPLIED_AT_COLUMN: &str = "migrated_at";

pub(crate) const VERSION_COLUMN: &str = "version";
pub(crate) const NAME_COLUMN: &str = "name";
pub(crate) const BATCH_COLUMN: &str = "batch";

/// A statement and its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Names of the bookkeeping table and of its applied-at column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bookkeeping {
    pub table: String,
    pub applied_at_column: String,
}

impl Default for Bookkeeping {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE_NAME.to_string(),
            applied_at_column: DEFAULT_APPLIED_AT_COLUMN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    fn keyword(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

/// Inclusive range of batch numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRange {
    pub min: u64,
    pub max: u64,
}

/// Filter for reading rows from the bookkeeping table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionQuery {
    pub limit: Option<u64>,
    pub batches: Option<BatchRange>,
    pub order: Order,
}

impl VersionQuery {
    /// Every row, ascending by key.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_batches(mut self, min: u64, max: u64) -> Self {
        self.batches = Some(BatchRange { min, max });
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = Order::Desc;
        self
    }
}

/// Hands out placeholders in order for one statement.
struct Placeholders<'d, D: ?Sized> {
    dialect: &'d D,
    next: usize,
}

impl<'d, D: Dialect + ?Sized> Placeholders<'d, D> {
    fn new(dialect: &'d D) -> Self {
        Self { dialect, next: 1 }
    }

    fn next(&mut self) -> String {
        let placeholder = self.dialect.placeholder(self.next);
        self.next += 1;
        placeholder
    }
}

fn key_param(version: &Version) -> Result<Value, Error> {
    if version.key == 0 {
        return Err(Error::MigrationMalformed(format!(
            "migration '{}' has no ordering key",
            version.name
        )));
    }
    i64::try_from(version.key)
        .map(Value::Int)
        .map_err(|_| Error::MigrationMalformed(format!("ordering key {} is too large", version.key)))
}

fn i64_param(value: u64, what: &str) -> Result<Value, Error> {
    i64::try_from(value)
        .map(Value::Int)
        .map_err(|_| Error::InvalidQuery(format!("{what} {value} is too large")))
}

/// The SQL a backend needs for bookkeeping, locking aside.
///
/// Backends provide identifier quoting, placeholder style, the table DDL and the table listing;
/// the remaining builders are shared.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// Short backend name, as used in logs.
    fn name(&self) -> &'static str;

    fn bookkeeping(&self) -> &Bookkeeping;

    /// Quote an identifier with the backend's native quoting.
    fn quote(&self, ident: &str) -> String;

    /// Placeholder for the 1-based parameter `position`.
    fn placeholder(&self, position: usize) -> String;

    /// `CREATE TABLE IF NOT EXISTS` for the bookkeeping table.
    fn create_table_sql(&self) -> String;

    /// Lists user tables, one name per row.
    fn show_tables_query(&self) -> Query;

    fn begin_statement(&self, read_only: bool) -> &'static str {
        let _ = read_only;
        "BEGIN"
    }

    fn commit_statement(&self) -> &'static str {
        "COMMIT"
    }

    fn rollback_statement(&self) -> &'static str {
        "ROLLBACK"
    }

    fn table(&self) -> String {
        self.quote(&self.bookkeeping().table)
    }

    fn init_query(&self) -> Query {
        Query::new(self.create_table_sql())
    }

    /// Record `version` as applied. Without `applied_at` the column default fills it in.
    fn insert_query(&self, version: &Version) -> Result<Query, Error> {
        let key = key_param(version)?;
        if version.name.trim().is_empty() {
            return Err(Error::MigrationMalformed(format!(
                "migration {} has no name",
                version.key
            )));
        }
        if version.batch == 0 {
            return Err(Error::MigrationMalformed(format!(
                "migration {} has no batch",
                version.file_key()
            )));
        }
        let batch = i64_param(version.batch, "batch")
            .map_err(|err| Error::MigrationMalformed(err.to_string()))?;

        let mut columns = vec![
            self.quote(VERSION_COLUMN),
            self.quote(BATCH_COLUMN),
            self.quote(NAME_COLUMN),
        ];
        let mut params = vec![key, batch, Value::Text(version.name.clone())];
        if let Some(applied_at) = version.applied_at {
            columns.push(self.quote(&self.bookkeeping().applied_at_column));
            params.push(Value::Timestamp(applied_at));
        }

        let mut placeholders = Placeholders::new(self);
        let values = params
            .iter()
            .map(|_| placeholders.next())
            .collect::<Vec<_>>();
        Ok(Query::with_params(
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table(),
                columns.join(", "),
                values.join(", ")
            ),
            params,
        ))
    }

    fn remove_query(&self, version: &Version) -> Result<Query, Error> {
        let key = key_param(version)?;
        let mut placeholders = Placeholders::new(self);
        Ok(Query::with_params(
            format!(
                "DELETE FROM {} WHERE {} = {}",
                self.table(),
                self.quote(VERSION_COLUMN),
                placeholders.next()
            ),
            vec![key],
        ))
    }

    /// Select rows as `(version, name, batch, applied_at)`, see [decode_version].
    fn read_versions_query(&self, filter: &VersionQuery) -> Result<Query, Error> {
        let mut placeholders = Placeholders::new(self);
        let mut params = Vec::new();
        let mut sql = format!(
            "SELECT {}, {}, {}, {} FROM {}",
            self.quote(VERSION_COLUMN),
            self.quote(NAME_COLUMN),
            self.quote(BATCH_COLUMN),
            self.quote(&self.bookkeeping().applied_at_column),
            self.table()
        );

        if let Some(BatchRange { min, max }) = filter.batches {
            if min == 0 {
                return Err(Error::InvalidQuery(
                    "minimum batch must be positive".to_string(),
                ));
            }
            if min > max {
                return Err(Error::InvalidQuery(format!(
                    "minimum batch {min} is greater than maximum batch {max}"
                )));
            }
            let batch = self.quote(BATCH_COLUMN);
            sql.push_str(&format!(
                " WHERE {batch} >= {} AND {batch} <= {}",
                placeholders.next(),
                placeholders.next()
            ));
            params.push(i64_param(min, "batch")?);
            params.push(i64_param(max, "batch")?);
        }

        sql.push_str(&format!(
            " ORDER BY {} {}",
            self.quote(VERSION_COLUMN),
            filter.order.keyword()
        ));

        if let Some(limit) = filter.limit {
            if limit == 0 {
                return Err(Error::InvalidQuery("limit must be positive".to_string()));
            }
            sql.push_str(&format!(" LIMIT {}", placeholders.next()));
            params.push(i64_param(limit, "limit")?);
        }

        Ok(Query::with_params(sql, params))
    }

    fn drop_query(&self) -> Query {
        Query::new(format!("DROP TABLE IF EXISTS {}", self.table()))
    }
}

/// Decode a row produced by [Dialect::read_versions_query].
pub fn decode_version(row: &Row) -> Result<Version, Error> {
    let key = row.int(0)?;
    let batch = row.int(2)?;
    Ok(Version {
        key: u64::try_from(key).map_err(|_| Error::Decode(format!("negative version {key}")))?,
        name: row.text(1)?,
        batch: u64::try_from(batch)
            .map_err(|_| Error::Decode(format!("negative batch {batch}")))?,
        applied_at: row.timestamp(3)?,
    })
}

/// Double every quote character inside `ident` and wrap it in quotes.
pub(crate) fn quote_with(ident: &str, quote: char) -> String {
    let mut quoted = String::with_capacity(ident.len() + 2);
    quoted.push(quote);
    for c in ident.chars() {
        if c == quote {
            quoted.push(quote);
        }
        quoted.push(c);
    }
    quoted.push(quote);
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    /// Minimal dialect exercising the shared builders with `$n` placeholders.
    #[derive(Debug, Default)]
    struct NumberedDialect {
        bookkeeping: Bookkeeping,
    }

    impl Dialect for NumberedDialect {
        fn name(&self) -> &'static str {
            "numbered"
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
            String::new()
        }
        fn show_tables_query(&self) -> Query {
            Query::new("")
        }
    }

    fn applied(key: u64, name: &str, batch: u64) -> Version {
        Version {
            batch,
            ..Version::new(key, name)
        }
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_with("plain", '"'), "\"plain\"");
        assert_eq!(quote_with("we\"ird", '"'), "\"we\"\"ird\"");
        assert_eq!(quote_with("back`tick", '`'), "`back``tick`");
    }

    #[test]
    fn insert_query_without_timestamp_uses_column_default() {
        let query = NumberedDialect::default()
            .insert_query(&applied(1596897167, "create foo table", 1))
            .unwrap();
        assert_eq!(
            query.sql,
            "INSERT INTO \"schema_migrations\" (\"version\", \"batch\", \"name\") VALUES ($1, $2, $3)"
        );
        assert_eq!(
            query.params,
            vec![
                Value::Int(1596897167),
                Value::Int(1),
                Value::Text("create foo table".into())
            ]
        );
    }

    #[test]
    fn insert_query_with_timestamp() {
        let at = Utc.with_ymd_and_hms(2020, 8, 8, 14, 32, 47).unwrap();
        let mut version = applied(1596897167, "create foo table", 3);
        version.applied_at = Some(at);
        let query = NumberedDialect::default().insert_query(&version).unwrap();
        assert_eq!(
            query.sql,
            "INSERT INTO \"schema_migrations\" (\"version\", \"batch\", \"name\", \"migrated_at\") VALUES ($1, $2, $3, $4)"
        );
        assert_eq!(query.params[3], Value::Timestamp(at));
    }

    #[test]
    fn insert_query_rejects_malformed_versions() {
        let dialect = NumberedDialect::default();
        for version in [
            applied(0, "no key", 1),
            applied(1596897167, "  ", 1),
            applied(1596897167, "no batch", 0),
        ] {
            assert!(
                matches!(
                    dialect.insert_query(&version),
                    Err(Error::MigrationMalformed(_))
                ),
                "{version:?}"
            );
        }
    }

    #[test]
    fn remove_query_only_needs_a_key() {
        let dialect = NumberedDialect::default();
        let query = dialect
            .remove_query(&Version::new(1596897167, "create foo table"))
            .unwrap();
        assert_eq!(
            query.sql,
            "DELETE FROM \"schema_migrations\" WHERE \"version\" = $1"
        );
        assert_eq!(query.params, vec![Value::Int(1596897167)]);
        assert!(matches!(
            dialect.remove_query(&Version::new(0, "x")),
            Err(Error::MigrationMalformed(_))
        ));
    }

    #[test]
    fn read_versions_query_defaults_to_ascending() {
        let query = NumberedDialect::default()
            .read_versions_query(&VersionQuery::all())
            .unwrap();
        assert_eq!(
            query.sql,
            "SELECT \"version\", \"name\", \"batch\", \"migrated_at\" FROM \"schema_migrations\" ORDER BY \"version\" ASC"
        );
        assert!(query.params.is_empty());
    }

    #[test]
    fn read_versions_query_with_range_order_and_limit() {
        let query = NumberedDialect::default()
            .read_versions_query(&VersionQuery::all().with_batches(2, 4).descending().with_limit(10))
            .unwrap();
        assert_eq!(
            query.sql,
            "SELECT \"version\", \"name\", \"batch\", \"migrated_at\" FROM \"schema_migrations\" WHERE \"batch\" >= $1 AND \"batch\" <= $2 ORDER BY \"version\" DESC LIMIT $3"
        );
        assert_eq!(
            query.params,
            vec![Value::Int(2), Value::Int(4), Value::Int(10)]
        );
    }

    #[test]
    fn read_versions_query_validates_range() {
        let dialect = NumberedDialect::default();
        assert!(matches!(
            dialect.read_versions_query(&VersionQuery::all().with_batches(3, 2)),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            dialect.read_versions_query(&VersionQuery::all().with_batches(0, 2)),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            dialect.read_versions_query(&VersionQuery::all().with_limit(0)),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn custom_bookkeeping_names() {
        let dialect = NumberedDialect {
            bookkeeping: Bookkeeping {
                table: "history".into(),
                applied_at_column: "applied_on".into(),
            },
        };
        assert_eq!(dialect.drop_query().sql, "DROP TABLE IF EXISTS \"history\"");
        let query = dialect.read_versions_query(&VersionQuery::all()).unwrap();
        assert!(query.sql.contains("\"applied_on\" FROM \"history\""));
    }

    #[test]
    fn decodes_version_rows() {
        let row = Row::new(vec![
            Value::Int(1596897167),
            Value::Text("create foo table".into()),
            Value::Int(2),
            Value::Text("2020-08-08 14:32:47".into()),
        ]);
        let version = decode_version(&row).unwrap();
        assert_eq!(version.key, 1596897167);
        assert_eq!(version.name, "create foo table");
        assert_eq!(version.batch, 2);
        assert_eq!(
            version.applied_at,
            Some(Utc.with_ymd_and_hms(2020, 8, 8, 14, 32, 47).unwrap())
        );

        let negative = Row::new(vec![
            Value::Int(-1),
            Value::Text("x".into()),
            Value::Int(1),
            Value::Null,
        ]);
        assert!(matches!(decode_version(&negative), Err(Error::Decode(_))));
    }
}

//! The public entry point: a [Source] of migrations wired to a [Gateway].

use crate::connector::Connector;
use crate::context::Context;
use crate::core::{Migration, Version, VersionFormat};
use crate::dialect::{Bookkeeping, DEFAULT_APPLIED_AT_COLUMN, DEFAULT_TABLE_NAME};
use crate::error::Error;
use crate::gateway::Gateway;
use crate::plan::Plan;
use crate::retry::Retry;
use crate::source::{Source, SourceFilter};
use chrono::Utc;
use std::fmt;
use std::time::Duration;

pub(crate) const DEFAULT_LOCK_KEY: &str = "stratum";

/// Tunables for the bookkeeping table, the advisory lock and the connection retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub table_name: String,
    pub applied_at_column: String,
    pub lock_key: String,
    /// How long to wait for another migrator to release the lock.
    pub lock_timeout: Duration,
    /// Skip advisory locking altogether.
    pub no_lock: bool,
    pub max_attempts: u32,
    pub max_timeout: Duration,
    pub step: Duration,
    /// Shape of keys generated by [Migrator::create].
    pub version_format: VersionFormat,
}

impl Default for Options {
    fn default() -> Self {
        let retry = Retry::default();
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            applied_at_column: DEFAULT_APPLIED_AT_COLUMN.to_string(),
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            lock_timeout: Duration::from_secs(60),
            no_lock: false,
            max_attempts: retry.max_attempts,
            max_timeout: retry.max_timeout,
            step: retry.step,
            version_format: VersionFormat::default(),
        }
    }
}

impl Options {
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_applied_at_column(mut self, column: impl Into<String>) -> Self {
        self.applied_at_column = column.into();
        self
    }

    pub fn with_lock_key(mut self, lock_key: impl Into<String>) -> Self {
        self.lock_key = lock_key.into();
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_no_lock(mut self, no_lock: bool) -> Self {
        self.no_lock = no_lock;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout;
        self
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    pub fn with_version_format(mut self, version_format: VersionFormat) -> Self {
        self.version_format = version_format;
        self
    }

    pub fn bookkeeping(&self) -> Bookkeeping {
        Bookkeeping {
            table: self.table_name.clone(),
            applied_at_column: self.applied_at_column.clone(),
        }
    }

    pub fn retry(&self) -> Retry {
        Retry::default()
            .with_max_attempts(self.max_attempts)
            .with_max_timeout(self.max_timeout)
            .with_step(self.step)
    }
}

/// Database backends, chosen by URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Mysql,
    Postgres,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Sqlite => "sqlite",
            Backend::Mysql => "mysql",
            Backend::Postgres => "postgres",
        })
    }
}

impl Backend {
    /// `sqlite:`, `mysql://`, `postgres://` or `postgresql://`.
    pub fn from_url(url: &str) -> Result<Self, Error> {
        let scheme = url
            .split_once(':')
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| Error::UnsupportedBackend(url.to_string()))?;
        match scheme.as_str() {
            "sqlite" => Ok(Backend::Sqlite),
            "mysql" => Ok(Backend::Mysql),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            other => Err(Error::UnsupportedBackend(other.to_string())),
        }
    }

    /// Whether this build was compiled with the backend's feature.
    pub fn is_enabled(self) -> bool {
        match self {
            Backend::Sqlite => cfg!(feature = "sqlite"),
            Backend::Mysql => cfg!(feature = "mysql"),
            Backend::Postgres => cfg!(feature = "postgres"),
        }
    }

    /// Build a gateway for `url`. Nothing is opened until the first operation.
    #[cfg_attr(
        not(any(feature = "sqlite", feature = "mysql", feature = "postgres")),
        allow(unused_variables)
    )]
    pub fn gateway(self, url: &str, options: &Options) -> Result<Gateway, Error> {
        #[cfg(feature = "tracing")]
        tracing::debug!(backend = %self, "building gateway");

        match self {
            #[cfg(feature = "sqlite")]
            Backend::Sqlite => {
                use crate::locker::NullLocker;
                use crate::sqlite::{SqliteDialect, SqliteDriver};
                Ok(Gateway::new(
                    Connector::with_retry(Box::new(SqliteDriver::from_url(url)?), options.retry()),
                    Box::new(SqliteDialect::new(options.bookkeeping())),
                    Box::new(NullLocker),
                ))
            }
            #[cfg(feature = "mysql")]
            Backend::Mysql => {
                use crate::mysql::{MysqlDialect, MysqlDriver, MysqlLocker};
                Ok(Gateway::new(
                    Connector::with_retry(Box::new(MysqlDriver::from_url(url)?), options.retry()),
                    Box::new(MysqlDialect::new(options.bookkeeping())),
                    Box::new(
                        MysqlLocker::new(options.lock_key.clone(), options.lock_timeout)
                            .with_no_lock(options.no_lock),
                    ),
                ))
            }
            #[cfg(feature = "postgres")]
            Backend::Postgres => {
                use crate::postgres::{PostgresDialect, PostgresDriver, PostgresLocker};
                Ok(Gateway::new(
                    Connector::with_retry(
                        Box::new(PostgresDriver::from_url(url)?),
                        options.retry(),
                    ),
                    Box::new(PostgresDialect::new(options.bookkeeping())),
                    Box::new(
                        PostgresLocker::new(&options.lock_key, options.lock_timeout)
                            .with_no_lock(options.no_lock),
                    ),
                ))
            }
            #[allow(unreachable_patterns)]
            disabled => Err(Error::UnsupportedBackend(format!(
                "{disabled} support is not compiled in"
            ))),
        }
    }
}

/// Runs migrate, rollback and refresh for the migrations of one [Source].
///
/// ```
/// use stratum::{migration, Context, MemorySource, Migrator, Options, Plan};
///
/// let source = MemorySource::new([migration!(1596897167, "create users",
///     migrate: "CREATE TABLE users (id INTEGER PRIMARY KEY)",
///     rollback: "DROP TABLE users"
/// )]);
/// let mut migrator = Migrator::from_url("sqlite::memory:", Box::new(source), Options::default())?;
///
/// let ctx = Context::background();
/// let migrated = migrator.migrate(&ctx, Plan::all())?;
/// assert_eq!(migrated.len(), 1);
/// assert!(migrator.migrate(&ctx, Plan::all()).unwrap_err().is_no_changes_required());
/// # Ok::<(), stratum::Error>(())
/// ```
#[derive(Debug)]
pub struct Migrator {
    source: Box<dyn Source>,
    gateway: Gateway,
    options: Options,
}

impl Migrator {
    /// Wrap an already configured gateway. [Options::default] applies until
    /// [Migrator::with_options] replaces it.
    pub fn new(source: Box<dyn Source>, gateway: Gateway) -> Self {
        Self {
            source,
            gateway,
            options: Options::default(),
        }
    }

    /// Replace the options consulted by [Migrator::create]. The gateway keeps the settings it was
    /// built with.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Pick the backend from `url` and build its gateway with `options`.
    pub fn from_url(url: &str, source: Box<dyn Source>, options: Options) -> Result<Self, Error> {
        let gateway = Backend::from_url(url)?.gateway(url, &options)?;
        Ok(Self {
            source,
            gateway,
            options,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn source(&self) -> &dyn Source {
        self.source.as_ref()
    }

    pub fn gateway(&mut self) -> &mut Gateway {
        &mut self.gateway
    }

    /// See [Gateway::on_migration_start].
    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, &str) + Send + Sync + 'static,
    {
        self.gateway = self.gateway.on_migration_start(callback);
        self
    }

    /// See [Gateway::on_migration_complete].
    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, &str, Duration) + Send + Sync + 'static,
    {
        self.gateway = self.gateway.on_migration_complete(callback);
        self
    }

    /// See [Gateway::on_migration_error].
    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, &str, &Error) + Send + Sync + 'static,
    {
        self.gateway = self.gateway.on_migration_error(callback);
        self
    }

    /// Apply pending migrations. Returns what was applied, ascending.
    pub fn migrate(&mut self, ctx: &Context, plan: Plan) -> Result<Vec<Migration>, Error> {
        let migrations = self
            .source
            .select(ctx, &SourceFilter::versions(plan.versions.clone()))?;
        self.gateway.migrate(ctx, &migrations, &plan)
    }

    /// Revert applied migrations. Returns what was reverted, descending.
    pub fn rollback(&mut self, ctx: &Context, plan: Plan) -> Result<Vec<Migration>, Error> {
        let migrations = self
            .source
            .select(ctx, &SourceFilter::versions(plan.versions.clone()))?;
        self.gateway.rollback(ctx, &migrations, &plan)
    }

    /// Revert then re-apply applied migrations. Returns `(rolled_back, migrated)`.
    pub fn refresh(
        &mut self,
        ctx: &Context,
        plan: Plan,
    ) -> Result<(Vec<Migration>, Vec<Migration>), Error> {
        let migrations = self
            .source
            .select(ctx, &SourceFilter::versions(plan.versions.clone()))?;
        self.gateway.refresh(ctx, &migrations, &plan)
    }

    pub fn read_versions(&mut self, ctx: &Context) -> Result<Vec<Version>, Error> {
        self.gateway.read_versions(ctx)
    }

    /// Add a new, empty migration to the source, keyed by the current time.
    pub fn create(&self, name: &str, with_rollback: bool) -> Result<Migration, Error> {
        let key = self.options.version_format.next_key(Utc::now());
        if self.source.already_exists(key, name)? {
            return Err(Error::InvalidMigrationFile {
                file: format!("{key}_{}", crate::core::snake_name(name)),
                reason: "a migration with this key or name already exists".to_string(),
            });
        }
        self.source.create(key, name, with_rollback)
    }

    /// Close the database connection. A later operation reconnects.
    pub fn close(&mut self) {
        self.gateway.close();
    }
}

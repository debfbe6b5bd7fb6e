//! Applies and reverts migrations against the database.
//!
//! Every action runs the same way: take the advisory lock, make sure the bookkeeping table
//! exists, open one transaction, read what is applied, schedule, run each scheduled migration and
//! its bookkeeping write, commit, release the lock. Any failure rolls the whole transaction back,
//! so the bookkeeping table only ever records committed work. Cleanup failures are attached to
//! the original error as suppressed context.

use crate::connection::Connection;
use crate::connector::Connector;
use crate::context::Context;
use crate::core::{Migration, Migrations, Version};
use crate::dialect::{decode_version, Dialect, VersionQuery};
use crate::error::Error;
use crate::locker::{LockGuard, Locker};
use crate::plan::Plan;
use crate::scheduler::{schedule_for_migration, schedule_for_refresh, schedule_for_rollback};
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::{Duration, Instant};

type StartHook = Box<dyn Fn(u64, &str) + Send + Sync>;
type CompleteHook = Box<dyn Fn(u64, &str, Duration) + Send + Sync>;
type ErrorHook = Box<dyn Fn(u64, &str, &Error) + Send + Sync>;

/// Callbacks invoked around every migration the gateway applies or reverts.
#[derive(Default)]
pub struct Hooks {
    on_migration_start: Option<StartHook>,
    on_migration_complete: Option<CompleteHook>,
    on_migration_error: Option<ErrorHook>,
}

// closures don't implement Debug
impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_migration_start", &self.on_migration_start.is_some())
            .field(
                "on_migration_complete",
                &self.on_migration_complete.is_some(),
            )
            .field("on_migration_error", &self.on_migration_error.is_some())
            .finish()
    }
}

impl Hooks {
    fn start(&self, migration: &Migration) {
        if let Some(ref callback) = self.on_migration_start {
            callback(migration.key(), migration.name());
        }
    }

    fn complete(&self, migration: &Migration, duration: Duration) {
        if let Some(ref callback) = self.on_migration_complete {
            callback(migration.key(), migration.name(), duration);
        }
    }

    fn error(&self, migration: &Migration, error: &Error) {
        if let Some(ref callback) = self.on_migration_error {
            callback(migration.key(), migration.name(), error);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Migrate,
    Rollback,
}

/// The migration orchestrator.
#[derive(Debug)]
pub struct Gateway {
    connector: Connector,
    dialect: Box<dyn Dialect>,
    locker: Box<dyn Locker>,
    hooks: Hooks,
}

impl Gateway {
    pub fn new(connector: Connector, dialect: Box<dyn Dialect>, locker: Box<dyn Locker>) -> Self {
        Self {
            connector,
            dialect,
            locker,
            hooks: Hooks::default(),
        }
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    /// Set a callback to be invoked when a migration starts.
    /// The callback receives the migration key and name.
    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, &str) + Send + Sync + 'static,
    {
        self.hooks.on_migration_start = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a migration completes successfully.
    /// The callback receives the migration key, name, and duration.
    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, &str, Duration) + Send + Sync + 'static,
    {
        self.hooks.on_migration_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a migration fails.
    /// The callback receives the migration key, name, and error.
    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, &str, &Error) + Send + Sync + 'static,
    {
        self.hooks.on_migration_error = Some(Box::new(callback));
        self
    }

    /// Apply the pending migrations selected by `plan`, ascending, as one batch.
    ///
    /// Fails with [Error::NoChangesRequired] when nothing is pending.
    pub fn migrate(
        &mut self,
        ctx: &Context,
        migrations: &Migrations,
        plan: &Plan,
    ) -> Result<Vec<Migration>, Error> {
        let result = self.locked(ctx, |tx, hooks| {
            let applied = read_applied(tx)?;
            let schedule = schedule_for_migration(migrations, &applied, plan);
            if schedule.is_empty() {
                return Err(Error::NoChangesRequired);
            }
            let batch = next_batch(&applied);
            let applied_at = Utc::now();

            #[cfg(feature = "tracing")]
            tracing::info!(count = schedule.len(), batch, "applying migrations");

            let mut done = Vec::with_capacity(schedule.len());
            for migration in schedule {
                apply(tx, hooks, migration, batch, applied_at)?;
                done.push(migration.clone());
            }
            Ok(done)
        });
        log_outcome("migrate", result)
    }

    /// Revert the applied migrations selected by `plan`, descending.
    ///
    /// Every applied row the plan reaches must still have a migration in `migrations`.
    pub fn rollback(
        &mut self,
        ctx: &Context,
        migrations: &Migrations,
        plan: &Plan,
    ) -> Result<Vec<Migration>, Error> {
        let result = self.locked(ctx, |tx, hooks| {
            let applied = read_applied(tx)?;
            check_known(migrations, &applied, plan)?;
            let schedule = schedule_for_rollback(migrations, &applied, plan);
            if schedule.is_empty() {
                return Err(Error::NoChangesRequired);
            }

            #[cfg(feature = "tracing")]
            tracing::info!(count = schedule.len(), "reverting migrations");

            let mut done = Vec::with_capacity(schedule.len());
            for migration in schedule {
                revert(tx, hooks, migration)?;
                done.push(migration.clone());
            }
            Ok(done)
        });
        log_outcome("rollback", result)
    }

    /// Revert the migrations selected by `plan`, then apply the same set again, in one
    /// transaction. Returns `(rolled_back, migrated)`.
    ///
    /// The re-applied rows share a new batch, one past the highest batch present at the start.
    pub fn refresh(
        &mut self,
        ctx: &Context,
        migrations: &Migrations,
        plan: &Plan,
    ) -> Result<(Vec<Migration>, Vec<Migration>), Error> {
        let result = self.locked(ctx, |tx, hooks| {
            let applied = read_applied(tx)?;
            check_known(migrations, &applied, plan)?;
            let schedule = schedule_for_refresh(migrations, &applied, plan);
            if schedule.is_empty() {
                return Err(Error::NoChangesRequired);
            }
            let batch = next_batch(&applied);
            let applied_at = Utc::now();

            #[cfg(feature = "tracing")]
            tracing::info!(count = schedule.len(), batch, "refreshing migrations");

            let mut rolled_back = Vec::with_capacity(schedule.len());
            for migration in &schedule {
                revert(tx, hooks, migration)?;
                rolled_back.push((*migration).clone());
            }
            let mut migrated = Vec::with_capacity(schedule.len());
            for migration in schedule.iter().rev() {
                apply(tx, hooks, migration, batch, applied_at)?;
                migrated.push((*migration).clone());
            }
            Ok((rolled_back, migrated))
        });
        log_outcome("refresh", result)
    }

    /// Every applied version, ascending, read in a fresh read-only transaction without the lock.
    pub fn read_versions(&mut self, ctx: &Context) -> Result<Vec<Version>, Error> {
        let dialect = self.dialect.as_ref();
        let conn = self.connector.connect(ctx)?;
        ensure_table(ctx, dialect, &mut *conn)?;
        let mut tx = Transaction::begin(ctx, dialect, conn, true)?;
        let versions = read_applied(&mut tx)?;
        tx.commit()?;
        Ok(versions)
    }

    /// Record `migrations` as applied without running their scripts.
    ///
    /// Rows keep their own batch when they carry one; the rest share the next free batch. Nothing
    /// is written if any insert fails.
    pub fn write_versions(&mut self, ctx: &Context, migrations: &[Migration]) -> Result<(), Error> {
        let dialect = self.dialect.as_ref();
        let conn = self.connector.connect(ctx)?;
        ensure_table(ctx, dialect, &mut *conn)?;
        let mut tx = Transaction::begin(ctx, dialect, conn, false)?;
        let batch = next_batch(&read_applied(&mut tx)?);
        for migration in migrations {
            let mut version = migration.version.clone();
            if version.batch == 0 {
                version.batch = batch;
            }
            let query = dialect.insert_query(&version)?;
            tx.execute(&query)
                .map_err(|err| version_write_failed(migration, err))?;
        }
        tx.commit()
    }

    pub fn create_migrations_table(&mut self, ctx: &Context) -> Result<(), Error> {
        let dialect = self.dialect.as_ref();
        let conn = self.connector.connect(ctx)?;
        ensure_table(ctx, dialect, conn)
    }

    pub fn drop_migrations_table(&mut self, ctx: &Context) -> Result<(), Error> {
        let query = self.dialect.drop_query();
        let conn = self.connector.connect(ctx)?;
        ctx.check()?;
        conn.execute(&query.sql, &query.params)?;
        Ok(())
    }

    /// Names of the user tables in the target database, bookkeeping table included.
    pub fn show_tables(&mut self, ctx: &Context) -> Result<Vec<String>, Error> {
        let query = self.dialect.show_tables_query();
        let conn = self.connector.connect(ctx)?;
        ctx.check()?;
        conn.query(&query.sql, &query.params)?
            .iter()
            .map(|row| row.text(0))
            .collect()
    }

    pub fn close(&mut self) {
        self.connector.close();
    }

    /// Run `work` under the lock and a write transaction.
    fn locked<T, F>(&mut self, ctx: &Context, work: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Transaction<'_>, &Hooks) -> Result<T, Error>,
    {
        let Self {
            connector,
            dialect,
            locker,
            hooks,
        } = self;
        let dialect = dialect.as_ref();
        let conn = connector.connect(ctx)?;
        let mut lock = LockGuard::acquire(ctx, locker.as_ref(), conn)?;

        let result = ensure_table(ctx, dialect, lock.conn()).and_then(|()| {
            let mut tx = Transaction::begin(ctx, dialect, lock.conn(), false)?;
            match work(&mut tx, hooks) {
                Ok(value) => tx.commit().map(|()| value),
                Err(err) => match tx.rollback() {
                    Ok(()) => Err(err),
                    Err(rollback) => Err(err.suppress(rollback)),
                },
            }
        });

        match (result, lock.release()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release)) => Err(release),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release)) => Err(err.suppress(release)),
        }
    }
}

fn ensure_table(ctx: &Context, dialect: &dyn Dialect, conn: &mut dyn Connection) -> Result<(), Error> {
    ctx.check()?;
    let query = dialect.init_query();
    conn.execute(&query.sql, &query.params)?;
    Ok(())
}

fn read_applied(tx: &mut Transaction<'_>) -> Result<Vec<Version>, Error> {
    let query = tx.dialect().read_versions_query(&VersionQuery::all())?;
    tx.query(&query)?.iter().map(decode_version).collect()
}

fn next_batch(applied: &[Version]) -> u64 {
    applied.iter().map(|v| v.batch).max().unwrap_or(0) + 1
}

/// Fail when an applied row the plan would reach has no migration to revert it with.
fn check_known(migrations: &Migrations, applied: &[Version], plan: &Plan) -> Result<(), Error> {
    let mut reached = 0;
    for version in applied.iter().rev() {
        if plan.is_full(reached) {
            break;
        }
        if !plan.allows(version.key) {
            continue;
        }
        if migrations.find(version.key).is_none() {
            return Err(Error::MissingMigration(version.key));
        }
        reached += 1;
    }
    Ok(())
}

fn version_write_failed(migration: &Migration, err: Error) -> Error {
    Error::VersionWriteFailed {
        migration: migration.file_key(),
        source: Box::new(err),
    }
}

fn sql_failed(migration: &Migration, err: Error) -> Error {
    Error::MigrationSqlFailed {
        migration: migration.file_key(),
        source: Box::new(err),
    }
}

fn apply(
    tx: &mut Transaction<'_>,
    hooks: &Hooks,
    migration: &Migration,
    batch: u64,
    applied_at: DateTime<Utc>,
) -> Result<(), Error> {
    run_step(hooks, migration, Direction::Migrate, || {
        for script in &migration.migrate {
            tx.batch_execute(script)
                .map_err(|err| sql_failed(migration, err))?;
        }
        let version = Version {
            batch,
            applied_at: Some(applied_at),
            ..migration.version.clone()
        };
        let query = tx.dialect().insert_query(&version)?;
        tx.execute(&query)
            .map_err(|err| version_write_failed(migration, err))?;
        Ok(())
    })
}

fn revert(tx: &mut Transaction<'_>, hooks: &Hooks, migration: &Migration) -> Result<(), Error> {
    run_step(hooks, migration, Direction::Rollback, || {
        for script in migration.rollback_scripts()? {
            tx.batch_execute(script)
                .map_err(|err| sql_failed(migration, err))?;
        }
        let query = tx.dialect().remove_query(&migration.version)?;
        tx.execute(&query)
            .map_err(|err| version_write_failed(migration, err))?;
        Ok(())
    })
}

/// Wrap one migration step with its span, logs and hooks.
fn run_step<F>(hooks: &Hooks, migration: &Migration, direction: Direction, step: F) -> Result<(), Error>
where
    F: FnOnce() -> Result<(), Error>,
{
    #[cfg(feature = "tracing")]
    let span = match direction {
        Direction::Migrate => tracing::info_span!(
            "stratum_migrate",
            version = migration.key(),
            name = %migration.name()
        ),
        Direction::Rollback => tracing::info_span!(
            "stratum_rollback",
            version = migration.key(),
            name = %migration.name()
        ),
    };
    #[cfg(feature = "tracing")]
    let _entered = span.entered();
    #[cfg(not(feature = "tracing"))]
    let _ = direction;

    hooks.start(migration);
    let started = Instant::now();
    match step() {
        Ok(()) => {
            let duration = started.elapsed();
            #[cfg(feature = "tracing")]
            tracing::info!(duration_ms = duration.as_millis(), ?direction, "migration done");
            hooks.complete(migration, duration);
            Ok(())
        }
        Err(err) => {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %err, ?direction, "migration failed");
            hooks.error(migration, &err);
            Err(err)
        }
    }
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn log_outcome<T>(action: &'static str, result: Result<T, Error>) -> Result<T, Error> {
    match &result {
        Ok(_) => {
            #[cfg(feature = "tracing")]
            tracing::info!(action, "committed");
        }
        Err(err) if err.is_no_changes_required() => {
            #[cfg(feature = "tracing")]
            tracing::info!(action, "no changes required");
        }
        Err(_err) => {
            #[cfg(feature = "tracing")]
            tracing::error!(action, error = %_err, "operation failed");
        }
    }
    result
}

#![cfg_attr(docsrs, feature(doc_cfg))]
//! `stratum` applies, reverts and refreshes versioned SQL schema migrations.
//!
//! Core concepts:
//! - A [Source] supplies migrations: a folder of `<key>_<name>.migrate.sql` files ([FileSource]) or
//!   migrations built in code ([MemorySource] and the [migration!] macro).
//! - A [Gateway] owns the connection to one database. Every invocation runs under an advisory lock
//!   and inside a single transaction, and records what it did in a bookkeeping table.
//! - The [Migrator] ties the two together and is what most applications use.
//!
//! # Batches
//!
//! Migrations applied by the same invocation share a batch number. The bookkeeping table keeps the
//! key, name, batch and application time of every applied migration, so later invocations know
//! what to roll back and in which order.
//!
//! # Plans
//!
//! A [Plan] narrows an invocation. `steps` caps how many migrations are touched and `versions`
//! restricts the invocation to explicit keys. Both can be combined; an empty plan means everything
//! eligible.
//!
//! ```
//! use stratum::{migration, Context, MemorySource, Migrator, Options, Plan};
//!
//! let source = MemorySource::new([
//!     migration!(1596897167, "create users",
//!         migrate: "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
//!         rollback: "DROP TABLE users"
//!     ),
//!     migration!(1596897188, "create posts",
//!         migrate: "CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT)",
//!         rollback: "DROP TABLE posts"
//!     ),
//! ]);
//! let mut migrator = Migrator::from_url("sqlite::memory:", Box::new(source), Options::default())?;
//! let ctx = Context::background();
//!
//! migrator.migrate(&ctx, Plan::steps(1))?;
//! migrator.migrate(&ctx, Plan::all())?;
//! let versions = migrator.read_versions(&ctx)?;
//! assert_eq!(versions.iter().map(|v| v.batch).collect::<Vec<_>>(), vec![1, 2]);
//!
//! let reverted = migrator.rollback(&ctx, Plan::all())?;
//! assert_eq!(reverted[0].key(), 1596897188);
//! # Ok::<(), stratum::Error>(())
//! ```
//!
//! # Benefits
//! - One lock and one transaction per invocation, so concurrent deploys do not race.
//! - Connection attempts are retried with linear backoff under a caller-supplied deadline.
//! - Observability hooks on every migration step.
//! - Tracing integration - available with the `tracing` feature flag.
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag.
//! - [`MySQL`](mysql) - available with the `mysql` feature flag.
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.

#[macro_use]
mod macros;

mod core;
pub use crate::core::{Migration, Migrations, Version, VersionFormat};

mod error;
pub use error::{ContextEnd, Error};

mod context;
pub use context::Context;

mod retry;
pub use retry::{Attempt, Retry};

mod plan;
pub use plan::Plan;

mod connection;
pub use connection::{Connection, Driver, Row, Value};

mod connector;
pub use connector::Connector;

mod dialect;
pub use dialect::{decode_version, BatchRange, Bookkeeping, Dialect, Order, Query, VersionQuery};

mod locker;
pub use locker::{LockGuard, Locker, NullLocker};

mod transaction;
pub use transaction::Transaction;

mod scheduler;
pub use scheduler::{schedule_for_migration, schedule_for_refresh, schedule_for_rollback};

mod source;
pub use source::{FileSource, MemorySource, Source, SourceFilter};

mod gateway;
pub use gateway::{Gateway, Hooks};

mod migrator;
pub use migrator::{Backend, Migrator, Options};

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "mysql")]
#[cfg_attr(docsrs, doc(cfg(feature = "mysql")))]
pub mod mysql;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(all(test, feature = "mysql"))]
pub(crate) mod test_mysql;

#[cfg(all(test, feature = "postgres"))]
pub(crate) mod test_postgres;

//! Convenience macros for defining migrations in code.

/// Build a [`Migration`](crate::Migration) from SQL.
///
/// # Basic Usage
///
/// ```
/// use stratum::migration;
///
/// let m = migration!(1596897167, "create users table",
///     migrate: "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
///     rollback: "DROP TABLE users"
/// );
/// assert_eq!(m.file_key(), "1596897167_create_users_table");
/// ```
///
/// # Multiple Statements
///
/// Each side takes a single script or an array of scripts, run in order:
///
/// ```
/// use stratum::migration;
///
/// let m = migration!(1596897188, "initial schema",
///     migrate: [
///         "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
///         "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER, title TEXT)",
///         "CREATE INDEX idx_posts_user ON posts(user_id)"
///     ],
///     rollback: [
///         "DROP INDEX idx_posts_user",
///         "DROP TABLE posts",
///         "DROP TABLE users"
///     ]
/// );
/// assert_eq!(m.migrate.len(), 3);
/// ```
///
/// # Migrate-Only Migrations
///
/// Omitting `rollback` gives a migration that cannot be rolled back. Rolling it back fails with
/// [`Error::InvalidMigrationFile`](crate::Error::InvalidMigrationFile) and leaves the database
/// untouched.
///
/// ```
/// use stratum::migration;
///
/// let m = migration!(1597897177, "backfill names",
///     migrate: "UPDATE users SET name = 'unknown' WHERE name IS NULL"
/// );
/// assert!(m.rollback.is_none());
/// ```
#[macro_export]
macro_rules! migration {
    ($key:expr, $name:expr,
        migrate: [$($migrate:expr),* $(,)?],
        rollback: [$($rollback:expr),* $(,)?] $(,)?
    ) => {
        $crate::Migration {
            version: $crate::Version::new($key, $name),
            migrate: ::std::vec![$(::std::string::ToString::to_string(&$migrate)),*],
            rollback: ::std::option::Option::Some(
                ::std::vec![$(::std::string::ToString::to_string(&$rollback)),*]
            ),
        }
    };

    ($key:expr, $name:expr,
        migrate: $migrate:expr,
        rollback: $rollback:expr $(,)?
    ) => {
        $crate::migration!($key, $name, migrate: [$migrate], rollback: [$rollback])
    };

    ($key:expr, $name:expr,
        migrate: [$($migrate:expr),* $(,)?] $(,)?
    ) => {
        $crate::Migration {
            version: $crate::Version::new($key, $name),
            migrate: ::std::vec![$(::std::string::ToString::to_string(&$migrate)),*],
            rollback: ::std::option::Option::None,
        }
    };

    ($key:expr, $name:expr,
        migrate: $migrate:expr $(,)?
    ) => {
        $crate::migration!($key, $name, migrate: [$migrate])
    };
}

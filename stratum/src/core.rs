use crate::error::Error;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Identity of a migration, and the row recorded for it once applied.
///
/// Two versions with the same `key` always refer to the same migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// The ordering key stamped into the migration file name (a UNIX timestamp or a `YYYYMMDDhhmmss` datetime).
    pub key: u64,
    /// Human-readable name of the migration.
    pub name: String,
    /// Batch counter assigned when the migration was applied. Zero while not applied.
    pub batch: u64,
    /// When the migration was applied.
    pub applied_at: Option<DateTime<Utc>>,
}

impl Version {
    pub fn new(key: u64, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            batch: 0,
            applied_at: None,
        }
    }

    /// `<key>_<name with underscores for spaces>`, the stem shared by the migration's files.
    pub fn file_key(&self) -> String {
        format!("{}_{}", self.key, snake_name(&self.name))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_key())
    }
}

pub(crate) fn snake_name(name: &str) -> String {
    name.trim().replace(' ', "_")
}

/// A versioned pair of SQL script lists.
///
/// `rollback` is `None` when no rollback script was declared at all, which is different from an
/// empty list (a rollback that intentionally does nothing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: Version,
    pub migrate: Vec<String>,
    pub rollback: Option<Vec<String>>,
}

impl Migration {
    /// Create a migration with no scripts and an empty (no-op) rollback side.
    pub fn new(key: u64, name: impl Into<String>) -> Self {
        Self {
            version: Version::new(key, name),
            migrate: Vec::new(),
            rollback: Some(Vec::new()),
        }
    }

    /// Append a script to the migrate side.
    pub fn with_migrate(mut self, sql: impl Into<String>) -> Self {
        self.migrate.push(sql.into());
        self
    }

    /// Append a script to the rollback side.
    pub fn with_rollback(mut self, sql: impl Into<String>) -> Self {
        self.rollback.get_or_insert_with(Vec::new).push(sql.into());
        self
    }

    /// Mark the migration as having no rollback side.
    pub fn irreversible(mut self) -> Self {
        self.rollback = None;
        self
    }

    pub fn key(&self) -> u64 {
        self.version.key
    }

    pub fn name(&self) -> &str {
        &self.version.name
    }

    pub fn file_key(&self) -> String {
        self.version.file_key()
    }

    /// The rollback scripts, or an error naming the missing rollback file.
    pub fn rollback_scripts(&self) -> Result<&[String], Error> {
        self.rollback
            .as_deref()
            .ok_or_else(|| Error::InvalidMigrationFile {
                file: format!("{}.rollback.sql", self.file_key()),
                reason: "no rollback script is defined for this migration".to_string(),
            })
    }
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.version.fmt(f)
    }
}

/// Migrations sorted ascending by key, without duplicate keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Migrations(Vec<Migration>);

impl Migrations {
    /// Sort the given migrations and check that keys are unique and non-zero.
    pub fn try_new(mut migrations: Vec<Migration>) -> Result<Self, Error> {
        migrations.sort_by_key(|m| m.key());

        for (i, migration) in migrations.iter().enumerate() {
            if migration.key() == 0 {
                return Err(Error::MigrationMalformed(format!(
                    "migration '{}' has no ordering key",
                    migration.name()
                )));
            }
            if i > 0 && migrations[i - 1].key() == migration.key() {
                return Err(Error::DuplicateVersion(migration.key()));
            }
        }

        Ok(Self(migrations))
    }

    pub fn into_vec(self) -> Vec<Migration> {
        self.0
    }

    pub fn find(&self, key: u64) -> Option<&Migration> {
        self.0
            .binary_search_by_key(&key, |m| m.key())
            .ok()
            .map(|idx| &self.0[idx])
    }
}

impl Deref for Migrations {
    type Target = [Migration];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IntoIterator for Migrations {
    type Item = Migration;
    type IntoIter = std::vec::IntoIter<Migration>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Migrations {
    type Item = &'a Migration;
    type IntoIter = std::slice::Iter<'a, Migration>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Shape of the ordering keys generated for new migrations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionFormat {
    /// UNIX seconds, 9 to 11 digits.
    #[default]
    Unix,
    /// `YYYYMMDDhhmmss`, 14 digits.
    Datetime,
}

pub(crate) const DATETIME_KEY_FORMAT: &str = "%Y%m%d%H%M%S";

impl VersionFormat {
    /// The key a migration created at `now` receives.
    pub fn next_key(&self, now: DateTime<Utc>) -> u64 {
        match self {
            VersionFormat::Unix => now.timestamp().max(0) as u64,
            VersionFormat::Datetime => now
                .format(DATETIME_KEY_FORMAT)
                .to_string()
                .parse()
                .unwrap_or_default(),
        }
    }

    /// Check that `key` is a well-formed ordering key.
    ///
    /// Both widths are accepted regardless of the configured format: 9 to 11 digits is read as a
    /// timestamp and 14 digits must be a valid datetime.
    pub fn validate(key: &str) -> Result<u64, Error> {
        let invalid = || Error::InvalidTimestamp(key.to_string());
        if !key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        match key.len() {
            9..=11 => key.parse().map_err(|_| invalid()),
            14 => {
                NaiveDateTime::parse_from_str(key, DATETIME_KEY_FORMAT).map_err(|_| invalid())?;
                key.parse().map_err(|_| invalid())
            }
            _ => Err(invalid()),
        }
    }
}

impl std::str::FromStr for VersionFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unix" | "timestamp" => Ok(VersionFormat::Unix),
            "datetime" => Ok(VersionFormat::Datetime),
            other => Err(Error::Generic(format!("unknown version format '{other}'"))),
        }
    }
}

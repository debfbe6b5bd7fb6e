use std::fmt;

/// Why a [Context](crate::Context) stopped accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEnd {
    DeadlineExceeded,
    Cancelled,
}

impl fmt::Display for ContextEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextEnd::DeadlineExceeded => f.write_str("deadline exceeded"),
            ContextEnd::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Error type for the stratum crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Nothing matched the plan. Not a failure: callers usually report "nothing to migrate".
    #[error("no changes required")]
    NoChangesRequired,
    #[error("unsupported backend '{0}'")]
    UnsupportedBackend(String),
    #[error("invalid database url: {0}")]
    InvalidDatabaseUrl(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] Box<Error>),
    #[error("failed to acquire migration lock: {0}")]
    LockAcquisitionFailed(#[source] Box<Error>),
    #[error("failed to release migration lock (it may be held until the session ends): {0}")]
    LockReleaseFailed(#[source] Box<Error>),
    #[error("failed to begin transaction: {0}")]
    TransactionBeginFailed(#[source] Box<Error>),
    #[error("failed to commit transaction: {0}")]
    TransactionCommitFailed(#[source] Box<Error>),
    #[error("failed to roll back transaction: {0}")]
    TransactionRollbackFailed(#[source] Box<Error>),
    #[error("migration {migration} failed: {source}")]
    MigrationSqlFailed {
        migration: String,
        #[source]
        source: Box<Error>,
    },
    #[error("failed to record version of migration {migration}: {source}")]
    VersionWriteFailed {
        migration: String,
        #[source]
        source: Box<Error>,
    },
    #[error("invalid migration file '{file}': {reason}")]
    InvalidMigrationFile { file: String, reason: String },
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("too many files for version {0}")]
    TooManyFilesForKey(u64),
    #[error("malformed migration: {0}")]
    MigrationMalformed(String),
    #[error("duplicate migration version {0}")]
    DuplicateVersion(u64),
    #[error("version {0} is recorded as applied but no migration defines it")]
    MissingMigration(u64),
    #[error("invalid version query: {0}")]
    InvalidQuery(String),
    #[error("failed to decode row: {0}")]
    Decode(String),
    #[error("context ended: {0}")]
    ContextEnded(ContextEnd),
    #[error("too many attempts ({attempts}): {source}")]
    TooManyAttempts {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
    #[error("{source} (suppressed: {})", join_errors(.suppressed))]
    Suppressed {
        #[source]
        source: Box<Error>,
        suppressed: Vec<Error>,
    },
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[cfg(feature = "mysql")]
    #[error("{0}")]
    Mysql(String),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[error("{0}")]
    Generic(String),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// The error that caused the failure, looking through suppressed cleanup errors.
    pub fn primary(&self) -> &Error {
        match self {
            Error::Suppressed { source, .. } => source.primary(),
            other => other,
        }
    }

    /// Whether this error only signals that the plan selected no migrations.
    pub fn is_no_changes_required(&self) -> bool {
        matches!(self.primary(), Error::NoChangesRequired)
    }

    /// Attach an error raised while cleaning up after `self`, keeping `self` as the primary cause.
    pub(crate) fn suppress(self, other: Error) -> Error {
        match self {
            Error::Suppressed {
                source,
                mut suppressed,
            } => {
                suppressed.push(other);
                Error::Suppressed { source, suppressed }
            }
            primary => Error::Suppressed {
                source: Box::new(primary),
                suppressed: vec![other],
            },
        }
    }
}

#[cfg(feature = "mysql")]
impl From<mysql::Error> for Error {
    fn from(value: mysql::Error) -> Self {
        Self::Mysql(value.to_string())
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppressed_errors_are_appended_to_primary_message() {
        let err = Error::Generic("script failed".to_string())
            .suppress(Error::Generic("rollback failed".to_string()))
            .suppress(Error::Generic("unlock failed".to_string()));
        assert_eq!(
            err.to_string(),
            "script failed (suppressed: rollback failed; unlock failed)"
        );
        assert!(matches!(err.primary(), Error::Generic(msg) if msg == "script failed"));
    }

    #[test]
    fn no_changes_is_detected_through_suppression() {
        let err = Error::NoChangesRequired.suppress(Error::Generic("unlock failed".into()));
        assert!(err.is_no_changes_required());
        assert!(!Error::Generic("x".into()).is_no_changes_required());
    }

    #[test]
    fn context_end_display() {
        assert_eq!(
            Error::ContextEnded(ContextEnd::DeadlineExceeded).to_string(),
            "context ended: deadline exceeded"
        );
        assert_eq!(
            Error::ContextEnded(ContextEnd::Cancelled).to_string(),
            "context ended: cancelled"
        );
    }
}

//! Where migrations come from.
//!
//! The gateway never reads migrations itself; it is handed the [Migrations] a [Source] selected at
//! the start of each operation.

use crate::context::Context;
use crate::core::{Migration, Migrations};
use crate::error::Error;
use std::fmt;

mod fs;
mod memory;

pub use fs::FileSource;
pub use memory::MemorySource;

/// Restricts what [Source::select] returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFilter {
    /// Keys to keep. Empty keeps everything.
    pub versions: Vec<u64>,
}

impl SourceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn versions(versions: impl IntoIterator<Item = u64>) -> Self {
        Self {
            versions: versions.into_iter().collect(),
        }
    }

    pub fn allows(&self, key: u64) -> bool {
        self.versions.is_empty() || self.versions.contains(&key)
    }
}

/// A set of known migrations.
pub trait Source: Send + Sync + fmt::Debug {
    /// Every migration the filter allows, sorted by key.
    fn select(&self, ctx: &Context, filter: &SourceFilter) -> Result<Migrations, Error>;

    /// Whether the source can be read at all.
    fn is_valid(&self) -> bool;

    /// Whether a migration with this key, or with this name, is already known.
    fn already_exists(&self, key: u64, name: &str) -> Result<bool, Error>;

    /// Add an empty migration, with an empty rollback side when `with_rollback` is set.
    fn create(&self, key: u64, name: &str, with_rollback: bool) -> Result<Migration, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_allows() {
        assert!(SourceFilter::all().allows(1596897167));
        let filter = SourceFilter::versions([1596897167]);
        assert!(filter.allows(1596897167));
        assert!(!filter.allows(1596897188));
    }
}

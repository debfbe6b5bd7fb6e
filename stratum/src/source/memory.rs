use super::{Source, SourceFilter};
use crate::context::Context;
use crate::core::{snake_name, Migration, Migrations};
use crate::error::Error;
use std::sync::RwLock;

/// Migrations held in memory, typically built with [migration!](crate::migration).
#[derive(Debug, Default)]
pub struct MemorySource {
    migrations: RwLock<Vec<Migration>>,
}

impl MemorySource {
    pub fn new(migrations: impl IntoIterator<Item = Migration>) -> Self {
        Self {
            migrations: RwLock::new(migrations.into_iter().collect()),
        }
    }

    fn poisoned() -> Error {
        Error::Generic("memory source lock poisoned".to_string())
    }
}

impl Source for MemorySource {
    fn select(&self, ctx: &Context, filter: &SourceFilter) -> Result<Migrations, Error> {
        ctx.check()?;
        let migrations = self.migrations.read().map_err(|_| Self::poisoned())?;
        Migrations::try_new(
            migrations
                .iter()
                .filter(|m| filter.allows(m.key()))
                .cloned()
                .collect(),
        )
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn already_exists(&self, key: u64, name: &str) -> Result<bool, Error> {
        let snake = snake_name(name);
        let migrations = self.migrations.read().map_err(|_| Self::poisoned())?;
        Ok(migrations
            .iter()
            .any(|m| m.key() == key || snake_name(m.name()) == snake))
    }

    fn create(&self, key: u64, name: &str, with_rollback: bool) -> Result<Migration, Error> {
        let mut migrations = self.migrations.write().map_err(|_| Self::poisoned())?;
        if migrations.iter().any(|m| m.key() == key) {
            return Err(Error::DuplicateVersion(key));
        }
        let mut migration = Migration::new(key, name);
        if !with_rollback {
            migration = migration.irreversible();
        }
        migrations.push(migration.clone());
        Ok(migration)
    }
}

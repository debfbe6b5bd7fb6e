use super::{Source, SourceFilter};
use crate::context::Context;
use crate::core::{snake_name, Migration, Migrations, Version, VersionFormat};
use crate::error::Error;
use crossbeam_channel::bounded;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;

const DEFAULT_WORKERS: usize = 4;

fn file_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{9,11}|\d{14})_(\w+)\.(migrate|rollback)\.sql$")
            .unwrap_or_else(|err| unreachable!("migration file pattern: {err}"))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Migrate,
    Rollback,
}

/// One parsed migration file name.
#[derive(Debug, PartialEq, Eq)]
struct FileName {
    key: u64,
    name: String,
    side: Side,
}

fn parse_file_name(file: &str) -> Result<FileName, Error> {
    let captures = file_name_pattern()
        .captures(file)
        .ok_or_else(|| Error::InvalidMigrationFile {
            file: file.to_string(),
            reason: "expected <key>_<name>.(migrate|rollback).sql".to_string(),
        })?;
    let key = VersionFormat::validate(&captures[1])?;
    let side = if &captures[3] == "migrate" {
        Side::Migrate
    } else {
        Side::Rollback
    };
    Ok(FileName {
        key,
        name: captures[2].to_string(),
        side,
    })
}

/// The files found for one key.
#[derive(Debug)]
struct Pending {
    key: u64,
    name: String,
    migrate: Option<PathBuf>,
    rollback: Option<PathBuf>,
}

impl Pending {
    fn read(&self, ctx: &Context) -> Result<Migration, Error> {
        ctx.check()?;
        let migrate = match &self.migrate {
            Some(path) => read_script(path)?,
            None => {
                return Err(Error::InvalidMigrationFile {
                    file: format!("{}_{}.migrate.sql", self.key, self.name),
                    reason: "rollback file has no matching migrate file".to_string(),
                })
            }
        };
        let rollback = self.rollback.as_deref().map(read_script).transpose()?;
        Ok(Migration {
            version: Version::new(self.key, self.name.replace('_', " ")),
            migrate,
            rollback,
        })
    }
}

/// A file's content as a single script; a blank file is no script at all.
fn read_script(path: &Path) -> Result<Vec<String>, Error> {
    let content = fs::read_to_string(path)?;
    Ok(if content.trim().is_empty() {
        Vec::new()
    } else {
        vec![content]
    })
}

fn is_hidden(file: &str) -> bool {
    file.starts_with('.')
}

/// Migrations stored as `<key>_<name>.migrate.sql` / `<key>_<name>.rollback.sql` pairs in one folder.
#[derive(Debug, Clone)]
pub struct FileSource {
    folder: PathBuf,
    workers: usize,
}

impl FileSource {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            workers: DEFAULT_WORKERS,
        }
    }

    /// Number of threads reading files in [Source::select].
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Names of the visible files in the folder.
    fn file_names(&self) -> Result<Vec<(String, PathBuf)>, Error> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.folder)? {
            let entry = entry?;
            let file = entry.file_name().to_string_lossy().into_owned();
            if is_hidden(&file) || entry.file_type()?.is_dir() {
                continue;
            }
            files.push((file, entry.path()));
        }
        Ok(files)
    }

    /// Group the folder's files by key, rejecting anything that does not pair up.
    fn scan(&self, filter: &SourceFilter) -> Result<Vec<Pending>, Error> {
        let mut by_key: BTreeMap<u64, Pending> = BTreeMap::new();
        for (file, path) in self.file_names()? {
            let parsed = parse_file_name(&file)?;
            let pending = by_key.entry(parsed.key).or_insert_with(|| Pending {
                key: parsed.key,
                name: parsed.name.clone(),
                migrate: None,
                rollback: None,
            });
            if pending.name != parsed.name {
                return Err(Error::TooManyFilesForKey(parsed.key));
            }
            let slot = match parsed.side {
                Side::Migrate => &mut pending.migrate,
                Side::Rollback => &mut pending.rollback,
            };
            if slot.replace(path).is_some() {
                return Err(Error::TooManyFilesForKey(parsed.key));
            }
        }
        Ok(by_key
            .into_values()
            .filter(|pending| filter.allows(pending.key))
            .collect())
    }
}

impl Source for FileSource {
    fn select(&self, ctx: &Context, filter: &SourceFilter) -> Result<Migrations, Error> {
        ctx.check()?;
        let pending = self.scan(filter)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(folder = %self.folder.display(), count = pending.len(), "reading migration files");

        let workers = self.workers.min(pending.len()).max(1);
        let (job_tx, job_rx) = bounded::<&Pending>(workers);
        let (result_tx, result_rx) = bounded::<Result<Migration, Error>>(workers);

        let results = thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for job in job_rx {
                        if result_tx.send(job.read(ctx)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(result_tx);

            let jobs = &pending;
            scope.spawn(move || {
                for job in jobs {
                    if job_tx.send(job).is_err() {
                        break;
                    }
                }
            });

            result_rx.iter().collect::<Vec<_>>()
        });

        let migrations = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Migrations::try_new(migrations)
    }

    fn is_valid(&self) -> bool {
        self.folder.is_dir()
    }

    fn already_exists(&self, key: u64, name: &str) -> Result<bool, Error> {
        let snake = snake_name(name);
        for (file, _) in self.file_names()? {
            if let Some(captures) = file_name_pattern().captures(&file) {
                if captures[1].parse::<u64>().ok() == Some(key) || captures[2] == snake {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn create(&self, key: u64, name: &str, with_rollback: bool) -> Result<Migration, Error> {
        VersionFormat::validate(&key.to_string())?;
        let snake = snake_name(name);
        if snake.is_empty() || !snake.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(Error::InvalidMigrationFile {
                file: format!("{key}_{snake}.migrate.sql"),
                reason: "migration names may only hold letters, digits, spaces and underscores"
                    .to_string(),
            });
        }
        fs::create_dir_all(&self.folder)?;

        let stem = format!("{key}_{snake}");
        write_new(
            &self.folder.join(format!("{stem}.migrate.sql")),
            &format!("-- {stem}: migrate\n"),
        )?;
        let mut migration = Migration::new(key, snake.replace('_', " "));
        if with_rollback {
            write_new(
                &self.folder.join(format!("{stem}.rollback.sql")),
                &format!("-- {stem}: rollback\n"),
            )?;
        } else {
            migration = migration.irreversible();
        }

        #[cfg(feature = "tracing")]
        tracing::info!(migration = %stem, with_rollback, "created migration files");
        Ok(migration)
    }
}

/// Write `content` to a file that must not exist yet.
fn write_new(path: &Path, content: &str) -> Result<(), Error> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

//! The `stratum.yml` configuration file.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use stratum::VersionFormat;

pub const DEFAULT_CONFIG_PATH: &str = "stratum.yml";

const CONFIG_VERSION: u32 = 1;

const TEMPLATE: &str = "\
version: 1
migrations:
  # folder holding <key>_<name>.migrate.sql / .rollback.sql files
  local_folder: ./migrations
  # values wrapped in double percent signs are read from the environment
  database_url: \"%%DATABASE_URL%%\"
  # unix (seconds) or datetime (YYYYMMDDhhmmss)
  version_format: unix
";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{0} already exists")]
    AlreadyExists(PathBuf),

    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("unsupported configuration version {0}")]
    UnsupportedVersion(u32),

    #[error("environment variable {0} is not set")]
    MissingVariable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    pub migrations: MigrationsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationsConfig {
    pub local_folder: PathBuf,
    pub database_url: String,
    #[serde(default)]
    pub version_format: VersionFormat,
}

impl Config {
    /// Read `path` and resolve its `%%NAME%%` placeholders from the environment.
    ///
    /// A relative `local_folder` is taken relative to the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    pub fn load_with<F>(path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if config.version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(config.version));
        }

        config.migrations.database_url = resolve(&config.migrations.database_url, &lookup)?;
        let folder = resolve(&config.migrations.local_folder.to_string_lossy(), &lookup)?;
        config.migrations.local_folder = match path.parent() {
            Some(dir) if Path::new(&folder).is_relative() => dir.join(folder),
            _ => PathBuf::from(folder),
        };

        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Write the default configuration to `path`. An existing file is left alone.
    pub fn init(path: &Path) -> Result<(), ConfigError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::AlreadyExists => ConfigError::AlreadyExists(path.to_path_buf()),
                _ => ConfigError::Write {
                    path: path.to_path_buf(),
                    source,
                },
            })?;
        file.write_all(TEMPLATE.as_bytes())
            .map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })
    }
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"%%([A-Za-z_][A-Za-z0-9_]*)%%")
            .unwrap_or_else(|err| unreachable!("placeholder pattern: {err}"))
    })
}

/// Replace every `%%NAME%%` in `value` with `lookup(NAME)`.
fn resolve<F>(value: &str, lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = None;
    let resolved = placeholder().replace_all(value, |caps: &Captures<'_>| {
        let name = &caps[1];
        lookup(name).unwrap_or_else(|| {
            missing.get_or_insert_with(|| name.to_string());
            String::new()
        })
    });
    match missing {
        Some(name) => Err(ConfigError::MissingVariable(name)),
        None => Ok(resolved.into_owned()),
    }
}

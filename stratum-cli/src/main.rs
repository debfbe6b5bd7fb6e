//! The `stratum` command: applies, reverts and refreshes the migrations configured in
//! `stratum.yml`.

mod config;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use colored::Colorize;
use config::{Config, DEFAULT_CONFIG_PATH};
use stratum::{Context, FileSource, Migration, Migrator, Options, Plan, Version};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stratum", version, about = "Versioned SQL schema migrations")]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["init", "create", "migrate", "rollback", "refresh", "status"])
))]
struct Cli {
    /// Write a default configuration file
    #[arg(long)]
    init: bool,

    /// Configuration file
    #[arg(long = "cfg", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Create a new migration with this name
    #[arg(long, value_name = "NAME")]
    create: Option<String>,

    /// With --create, skip the rollback file
    #[arg(long, requires = "create")]
    no_rollback: bool,

    /// Apply pending migrations
    #[arg(long)]
    migrate: bool,

    /// Revert applied migrations
    #[arg(long)]
    rollback: bool,

    /// Revert then re-apply applied migrations
    #[arg(long)]
    refresh: bool,

    /// List applied migrations
    #[arg(long)]
    status: bool,

    /// Touch at most this many migrations
    #[arg(long, default_value_t = 0)]
    steps: usize,

    /// Only touch these migration keys
    #[arg(long, value_delimiter = ',', value_name = "KEYS")]
    versions: Vec<u64>,

    /// Give up after this many seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    timeout: u64,
}

impl Cli {
    fn plan(&self) -> Plan {
        Plan::all()
            .with_steps(self.steps)
            .with_versions(self.versions.iter().copied())
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", "error:".red().bold(), err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if cli.init {
        Config::init(&cli.config)?;
        println!("{} wrote {}", "✓".green(), cli.config.display());
        return Ok(());
    }

    let config = Config::load(&cli.config)?;
    let folder = &config.migrations.local_folder;
    let options = Options::default().with_version_format(config.migrations.version_format);
    let mut migrator = Migrator::from_url(
        &config.migrations.database_url,
        Box::new(FileSource::new(folder)),
        options,
    )?;

    if let Some(name) = &cli.create {
        fs::create_dir_all(folder)?;
        let migration = migrator.create(name, !cli.no_rollback)?;
        println!("{} created {}", "✓".green(), migration.file_key().cyan());
        return Ok(());
    }

    let ctx = Context::with_timeout(Duration::from_secs(cli.timeout));
    let plan = cli.plan();
    let result = if cli.migrate {
        migrator
            .migrate(&ctx, plan)
            .map(|migrated| report("migrated", &migrated))
    } else if cli.rollback {
        migrator
            .rollback(&ctx, plan)
            .map(|rolled_back| report("rolled back", &rolled_back))
    } else if cli.refresh {
        migrator.refresh(&ctx, plan).map(|(rolled_back, migrated)| {
            report("rolled back", &rolled_back);
            report("migrated", &migrated);
        })
    } else {
        migrator.read_versions(&ctx).map(|versions| status(&versions))
    };
    migrator.close();

    match result {
        Err(err) if err.is_no_changes_required() => {
            println!("{}", "nothing to migrate".yellow());
            Ok(())
        }
        other => other.map_err(Into::into),
    }
}

fn report(action: &str, migrations: &[Migration]) {
    for migration in migrations {
        println!("{} {action} {}", "✓".green(), migration.file_key().cyan());
    }
}

fn status(versions: &[Version]) {
    if versions.is_empty() {
        println!("{}", "no migrations applied".dimmed());
        return;
    }
    for version in versions {
        let applied_at = version
            .applied_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "{:>14}  batch {:<4} {}  {}",
            version.key.to_string().cyan(),
            version.batch,
            applied_at.dimmed(),
            version.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("stratum").chain(args.iter().copied()))
    }

    #[test]
    fn clap_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn exactly_one_action() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--migrate", "--rollback"]).is_err());
        assert!(parse(&["--status"]).is_ok());
    }

    #[test]
    fn plan_from_flags() {
        let cli = parse(&["--rollback", "--steps", "2", "--versions", "1596897167,1596897188"])
            .unwrap();
        assert_eq!(
            cli.plan(),
            Plan::versions([1596897167, 1596897188]).with_steps(2)
        );
        assert_eq!(cli.timeout, 60);
        assert_eq!(cli.config, PathBuf::from("stratum.yml"));
    }

    #[test]
    fn no_rollback_needs_create() {
        assert!(parse(&["--migrate", "--no-rollback"]).is_err());
        let cli = parse(&["--create", "add users", "--no-rollback"]).unwrap();
        assert_eq!(cli.create.as_deref(), Some("add users"));
        assert!(cli.no_rollback);
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn end_to_end_against_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("stratum.yml");
        fs::write(
            &cfg,
            format!(
                "version: 1\nmigrations:\n  local_folder: migrations\n  database_url: \"sqlite:{}\"\n",
                dir.path().join("app.db").display()
            ),
        )
        .unwrap();
        let cfg = cfg.to_string_lossy().into_owned();

        run(&parse(&["--cfg", &cfg, "--create", "add users"]).unwrap()).unwrap();
        let migrate_file = fs::read_dir(dir.path().join("migrations"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .find(|path| path.to_string_lossy().ends_with(".migrate.sql"))
            .unwrap();
        fs::write(&migrate_file, "CREATE TABLE users (id INTEGER PRIMARY KEY);").unwrap();

        run(&parse(&["--cfg", &cfg, "--migrate"]).unwrap()).unwrap();
        // nothing left to apply still succeeds
        run(&parse(&["--cfg", &cfg, "--migrate"]).unwrap()).unwrap();
        run(&parse(&["--cfg", &cfg, "--status"]).unwrap()).unwrap();
        // the generated rollback file is a comment only, so reverting succeeds
        run(&parse(&["--cfg", &cfg, "--rollback"]).unwrap()).unwrap();
    }
}

// knobs - per-owner settings maintenance from the command line

mod commands;
mod exit_codes;
mod prompt;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use knobs_migrate::MigrateError;
use knobs_store::{ConfigError, SettingsError};

use exit_codes::{migrate_exit_code, settings_exit_code, EXIT_CONFIG, EXIT_SUCCESS, EXIT_USAGE};

#[derive(Parser)]
#[command(name = "knobs")]
#[command(about = "Migrate and maintain per-owner dynamic settings")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// Configuration file; relative paths inside it resolve against its directory
    #[arg(long, short = 'c', global = true, env = "KNOBS_CONFIG", default_value = "knobs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize settings metadata and owner settings with the manifests
    #[command(after_help = "\
Examples:
  knobs migrate
  knobs migrate --manifest settings/users.toml --manifest settings/billing.toml
  knobs migrate --refresh --force
  knobs migrate --flush-cache --json")]
    Migrate {
        /// Manifest file (repeatable). Defaults to every *.toml under settings/
        #[arg(long, short = 'm')]
        manifest: Vec<PathBuf>,

        /// Delete all settings and metadata before migrating
        #[arg(long)]
        refresh: bool,

        /// Flush the whole cache store before migrating
        #[arg(long)]
        flush_cache: bool,

        /// Skip confirmation prompts in production
        #[arg(long)]
        force: bool,

        /// Print the migration report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete settings whose owner or metadata no longer exists
    Clean {
        /// Print the number of deleted settings as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a sample settings manifest
    Publish {
        /// Target path (default: settings/users.toml next to the config file)
        path: Option<PathBuf>,

        /// Overwrite an existing manifest without asking
        #[arg(long)]
        force: bool,
    },
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("GIT_COMMIT_HASH"), ")",
        "\nstore:   knobs-store ", env!("CARGO_PKG_VERSION"),
        "\nmigrate: knobs-migrate ", env!("CARGO_PKG_VERSION"),
    )
}

/// Log records from the library crates go to stderr. `KNOBS_LOG` takes
/// precedence over `RUST_LOG`.
fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_env("KNOBS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let result = match cli.command {
        Commands::Migrate { manifest, refresh, flush_cache, force, json } => {
            commands::migrate::run(&cli.config, manifest, refresh, flush_cache, force, json)
        }
        Commands::Clean { json } => commands::clean::run(&cli.config, json),
        Commands::Publish { path, force } => commands::publish::run(&cli.config, path, force),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self { code: EXIT_CONFIG, message: msg.into(), hint: None }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn settings(err: SettingsError) -> Self {
        Self { code: settings_exit_code(&err), message: err.to_string(), hint: None }
    }

    /// Create error from a migration error with the matching exit code.
    pub fn migrate(err: MigrateError) -> Self {
        let code = migrate_exit_code(&err);
        let hint = match &err {
            MigrateError::Rejected(_) => Some("pass --force to skip confirmations".to_string()),
            MigrateError::CacheDisabled => Some("set [cache] enable = true in the config file".to_string()),
            MigrateError::DuplicateOwnerTables(_) => {
                Some("each [[owners]] entry needs its own table".to_string())
            }
            MigrateError::UnresolvedTargets(_) => {
                Some("`from` must name an existing setting or another declared one".to_string())
            }
            _ => None,
        };
        Self { code, message: err.to_string(), hint }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        Self::config(err.to_string())
    }
}

impl From<SettingsError> for CliError {
    fn from(err: SettingsError) -> Self {
        Self::settings(err)
    }
}

impl From<MigrateError> for CliError {
    fn from(err: MigrateError) -> Self {
        Self::migrate(err)
    }
}

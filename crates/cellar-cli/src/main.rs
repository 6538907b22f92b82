//! `cellar` binary: migrations, scripts and pool checks from the command line.

use std::path::PathBuf;
use std::process::ExitCode;

use cellar_cli::config::{self, DEFAULT_CONFIG_PATH};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "cellar", version, about = "Embedded SQLite pool and migration tool")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending migrations from a directory of `.sql` files.
    Migrate {
        /// Directory holding the migration scripts.
        dir: PathBuf,
    },
    /// Run a SQL script once, without recording it.
    Script {
        /// Script file to run.
        file: PathBuf,
    },
    /// Open the pool, lease every connection and report pool statistics.
    Check,
}

fn resolve_config_path(cli: &Cli) -> (String, &'static str) {
    if let Some(path) = cli.config.as_ref().filter(|value| !value.trim().is_empty()) {
        return (path.clone(), "cli-arg");
    }

    if let Ok(path) = std::env::var("CELLAR_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (path, "env-var");
        }
    }

    (DEFAULT_CONFIG_PATH.to_string(), "default")
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config_path, config_source) = resolve_config_path(&cli);

    let config = match config::load_config(Some(&config_path)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration from {config_path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    cellar_cli::init_tracing(&config.logging);
    tracing::info!(
        source = config_source,
        path = %config_path,
        "resolved startup configuration path"
    );

    match run(&cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: &Command, config: &config::Config) -> Result<(), cellar_cli::CliError> {
    let db = cellar_cli::open_database(config)?;

    let result = match command {
        Command::Migrate { dir } => cellar_cli::migrate(&db, dir).map(|report| {
            println!(
                "applied {} migration(s), {} already applied",
                report.applied.len(),
                report.skipped
            );
            for id in &report.applied {
                println!("  {id}");
            }
        }),
        Command::Script { file } => {
            cellar_cli::script(&db, file).map(|()| println!("ran {}", file.display()))
        }
        Command::Check => cellar_cli::check(&db, config).map(|report| {
            println!("sqlite {}", report.sqlite_version);
            println!(
                "pool size {}, leased {} at once, {} worker task(s) ok",
                report.pool_size, report.connections, report.worker_tasks
            );
        }),
    };

    db.close()?;
    result
}

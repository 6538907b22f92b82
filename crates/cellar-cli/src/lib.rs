//! Command-line front end for `cellar-db`.
//!
//! Loads a [`config::Config`], opens a pool from it, and runs one command
//! against the database: apply migrations, run a script, or check that
//! every pooled connection and worker thread is usable.

pub mod config;

use std::path::Path;
use std::time::Duration;

use cellar_db::{Database, LeaseContext, MigrationReport, Worker};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, ConfigError, LoggingConfig};

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A database operation failed.
    #[error(transparent)]
    Database(#[from] cellar_db::Error),

    /// A script file could not be read.
    #[error("failed to read {path}: {source}")]
    ReadScript {
        /// Path of the script.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Installs the global tracing subscriber.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Opens the pool described by `config`.
pub fn open_database(config: &Config) -> Result<Database, CliError> {
    Ok(Database::builder().config(&config.database).open()?)
}

/// Applies pending migrations from `dir`.
pub fn migrate(db: &Database, dir: &Path) -> Result<MigrationReport, CliError> {
    let report = cellar_db::migrate_dir(db, &LeaseContext::background(), dir)?;
    if !report.applied.is_empty() {
        tracing::info!(count = report.applied.len(), "applied database migrations");
    }
    Ok(report)
}

/// Runs the script at `path` once.
pub fn script(db: &Database, path: &Path) -> Result<(), CliError> {
    let sql = std::fs::read_to_string(path).map_err(|source| CliError::ReadScript {
        path: path.display().to_string(),
        source,
    })?;
    cellar_db::run_script(db, &LeaseContext::background(), &sql)?;
    Ok(())
}

/// Pool and worker statistics gathered by [`check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    /// Configured pool size.
    pub pool_size: usize,
    /// Distinct connections leased at the same time.
    pub connections: usize,
    /// Tasks completed by the worker queue.
    pub worker_tasks: usize,
    /// SQLite library version.
    pub sqlite_version: String,
}

/// Leases every connection at once, runs one query on each, then pushes a
/// task per worker thread through a [`Worker`].
pub fn check(db: &Database, config: &Config) -> Result<CheckReport, CliError> {
    let ctx = LeaseContext::background().with_timeout(Duration::from_secs(5));
    let mut leases = Vec::with_capacity(db.pool_size());
    for _ in 0..db.pool_size() {
        let conn = db.lease(&ctx)?;
        conn.exec("SELECT 1", &[])?;
        leases.push(conn);
    }
    let connections = leases.len();
    drop(leases);

    let worker = Worker::new(db.clone(), config.worker.queue_size, config.worker.workers)?;
    let mut worker_tasks = 0;
    for _ in 0..config.worker.workers {
        worker.submit(|conn| conn.exec("SELECT 1", &[]))??;
        worker_tasks += 1;
    }
    worker.join();

    Ok(CheckReport {
        pool_size: db.pool_size(),
        connections,
        worker_tasks,
        sqlite_version: cellar_db::rusqlite::version().to_string(),
    })
}

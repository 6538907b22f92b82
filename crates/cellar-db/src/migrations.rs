//! SQL migration runner.
//!
//! Migrations are `.sql` scripts, read from a directory or compiled into the
//! binary with `include_str!`. They run in lexicographic order of their
//! file names, tracked by the `_cellar_migrations` table. Each script runs
//! exactly once, inside its own savepoint, together with its bookkeeping
//! row: either both land or neither does.

use std::fs;
use std::path::{Path, PathBuf};

use crate::conn::Conn;
use crate::context::LeaseContext;
use crate::error::{Error, Result};
use crate::pool::Database;
use crate::statement::RowExt;

/// Name of the bookkeeping table.
pub const MIGRATIONS_TABLE: &str = "_cellar_migrations";

/// A single migration script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// Identifier recorded once applied: the file name, extension included.
    pub id: String,
    /// Script body.
    pub sql: String,
}

/// Somewhere migration scripts come from.
pub trait ScriptSource {
    /// Returns every script, in any order.
    fn scripts(&self) -> Result<Vec<Script>>;
}

/// Every `*.sql` file directly inside a directory.
#[derive(Debug, Clone)]
pub struct DirSource(pub PathBuf);

impl DirSource {
    /// Reads scripts from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self(dir.into())
    }
}

impl ScriptSource for DirSource {
    fn scripts(&self) -> Result<Vec<Script>> {
        let mut scripts = Vec::new();
        for path in sql_files(&self.0)? {
            let id = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let sql = fs::read_to_string(&path)?;
            scripts.push(Script { id, sql });
        }
        Ok(scripts)
    }
}

/// Scripts compiled into the binary.
///
/// ```
/// use cellar_db::EmbeddedSource;
///
/// static MIGRATIONS: EmbeddedSource = EmbeddedSource(&[
///     ("001_users.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);"),
///     ("002_posts.sql", "CREATE TABLE posts (id INTEGER PRIMARY KEY);"),
/// ]);
/// # let _ = &MIGRATIONS;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedSource(pub &'static [(&'static str, &'static str)]);

impl ScriptSource for EmbeddedSource {
    fn scripts(&self) -> Result<Vec<Script>> {
        Ok(self
            .0
            .iter()
            .map(|(id, sql)| Script {
                id: (*id).to_string(),
                sql: (*sql).to_string(),
            })
            .collect())
    }
}

/// Outcome of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Identifiers applied by this run, in order.
    pub applied: Vec<String>,
    /// Scripts skipped because they were already recorded.
    pub skipped: usize,
}

/// Applies every pending script from `source`.
///
/// Already-recorded scripts are skipped. Pending scripts run in sorted
/// order; the first failure stops the run and is reported as
/// [`Error::MigrationFailed`]. Scripts applied before the failure stay
/// applied.
///
/// # Errors
///
/// [`Error::MigrationFailed`] naming the failing script, or the error from
/// leasing a connection, listing the scripts, or reading the bookkeeping
/// table.
pub fn migrate(
    db: &Database,
    ctx: &LeaseContext,
    source: &dyn ScriptSource,
) -> Result<MigrationReport> {
    let conn = db.lease(ctx)?;
    migrate_conn(&conn, source)
}

/// Applies every script in `dir` that has not been applied yet.
pub fn migrate_dir(db: &Database, ctx: &LeaseContext, dir: impl AsRef<Path>) -> Result<MigrationReport> {
    migrate(db, ctx, &DirSource::new(dir.as_ref()))
}

/// Same as [`migrate`], on a connection the caller already holds.
pub fn migrate_conn(conn: &Conn, source: &dyn ScriptSource) -> Result<MigrationReport> {
    let mut scripts = source.scripts()?;
    scripts.sort_by(|a, b| a.id.cmp(&b.id));

    conn.exec_script(&format!(
        "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (id TEXT PRIMARY KEY NOT NULL);"
    ))?;
    let applied = applied_ids(conn)?;

    let mut report = MigrationReport::default();
    for script in scripts {
        if applied.binary_search(&script.id).is_ok() {
            tracing::debug!(migration = %script.id, "migration already applied, skipping");
            report.skipped += 1;
            continue;
        }

        tracing::info!(migration = %script.id, "applying migration");
        conn.save(|conn| {
            conn.exec(
                &format!("INSERT INTO {MIGRATIONS_TABLE} (id) VALUES (?)"),
                &crate::params![script.id.clone()],
            )?;
            conn.exec_script(&script.sql)
        })
        .map_err(|source| Error::MigrationFailed {
            script: script.id.clone(),
            source: Box::new(source),
        })?;
        report.applied.push(script.id);
    }

    Ok(report)
}

/// Identifiers already recorded, sorted.
pub fn applied_ids(conn: &Conn) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("SELECT id FROM {MIGRATIONS_TABLE} ORDER BY id"), &[])?;
    stmt.collect_rows(|row| row.get_text(0))
}

/// `*.sql` files directly inside `dir`, sorted by file name.
pub(crate) fn sql_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_sql = path.extension().is_some_and(|ext| ext == "sql");
        if is_sql && entry.file_type()?.is_file() {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

//! Unconditional script execution, without migration bookkeeping.

use std::fs;
use std::path::Path;

use crate::context::LeaseContext;
use crate::error::Result;
use crate::migrations::sql_files;
use crate::pool::Database;

/// Leases a connection and runs `sql` as a script.
pub fn run_script(db: &Database, ctx: &LeaseContext, sql: &str) -> Result<()> {
    let conn = db.lease(ctx)?;
    conn.exec_script(sql)
}

/// Leases a connection and runs every `*.sql` file in `dir`, in file name
/// order, stopping at the first failure.
///
/// Files run every time this is called; nothing is recorded.
pub fn run_script_files(db: &Database, ctx: &LeaseContext, dir: impl AsRef<Path>) -> Result<usize> {
    let conn = db.lease(ctx)?;
    let files = sql_files(dir.as_ref())?;
    for path in &files {
        let sql = fs::read_to_string(path)?;
        tracing::debug!(script = %path.display(), "running script");
        conn.exec_script(&sql)?;
    }
    Ok(files.len())
}

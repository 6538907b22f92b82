//! Embedded SQLite access layer.
//!
//! Provides a fixed-size connection pool with cancellable leases, a
//! per-connection statement cache behind a prepare/bind/exec pipeline, a
//! serde-driven value binder, a bounded worker queue for serialized writes,
//! and an idempotent migration runner.
//!
//! # Design decisions
//!
//! - **Handles live for the life of the pool**: `open` creates every
//!   connection up front and `close` destroys them. Leasing only moves a
//!   handle through a bounded channel, so the pool can never grow past its
//!   size.
//! - **Ownership ends leases**: a [`Conn`] returns to its pool when dropped,
//!   and a [`Savepoint`] rolls back when dropped unless committed.
//! - **Parameters are encoded by rule order**: see [`binder`] for the
//!   precedence table.
//! - **In-memory pools share one database**: every connection of a
//!   [`Target::Memory`] pool opens the same shared-cache database, private
//!   to that pool.
//!
//! ```
//! use cellar_db::{params, Database, RowExt};
//!
//! let db = Database::builder().memory().pool_size(2).open()?;
//! let conn = db.lease_blocking()?;
//! conn.exec_script("CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER);")?;
//! conn.exec("INSERT INTO kv (k, v) VALUES (?, ?)", &params!["answer", 42])?;
//!
//! let v = conn
//!     .prepare("SELECT v FROM kv WHERE k = ?", &params!["answer"])?
//!     .first_row(|row| row.get_int64(0))?;
//! assert_eq!(v, Some(42));
//! # Ok::<(), cellar_db::Error>(())
//! ```

pub mod binder;
mod config;
mod conn;
mod context;
mod error;
mod migrations;
mod pool;
mod probe;
mod script;
mod sql;
mod statement;
mod worker;

pub use binder::{Param, Rendered};
pub use config::{DatabaseBuilder, DatabaseConfig, ScalarFunction, Target};
pub use conn::{Conn, Savepoint};
pub use context::{CancelHandle, LeaseContext};
pub use error::{Error, Result, Unavailable};
pub use migrations::{
    applied_ids, migrate, migrate_conn, migrate_dir, DirSource, EmbeddedSource, MigrationReport,
    Script, ScriptSource, MIGRATIONS_TABLE,
};
pub use pool::Database;
pub use script::{run_script, run_script_files};
pub use sql::{group_placeholders, placeholders, push_group_placeholders};
pub use statement::{RowExt, Rows, Statement};
pub use worker::Worker;

pub use rusqlite;

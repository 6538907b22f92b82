//! Error types for the database access layer.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// A type alias for results returned by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a lease could not be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    /// The lease context was cancelled before a connection freed up.
    Cancelled,
    /// The lease context's deadline passed before a connection freed up.
    TimedOut {
        /// How long the caller waited before giving up.
        waited: Duration,
    },
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("lease cancelled"),
            Self::TimedOut { waited } => write!(
                f,
                "timed out after {}ms waiting for a pooled connection",
                waited.as_millis()
            ),
        }
    }
}

/// Errors that can occur when working with the pool, its connections, the
/// worker queue, or migrations.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine rejected the SQL text, or a parameter could not be bound.
    #[error("database failed to prepare sql: {source}")]
    PrepareFailed {
        /// The (trimmed) SQL text that failed.
        sql: String,
        /// The underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },

    /// A prepared statement failed while stepping.
    #[error("database failed to exec sql: {source}")]
    ExecFailed {
        /// The (trimmed) SQL text that failed.
        sql: String,
        /// The underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },

    /// No binder rule accepted the parameter.
    #[error("database failed to bind parameter {index}: unknown type `{type_name}`")]
    UnknownParameterType {
        /// One-based position of the parameter.
        index: usize,
        /// Rust type name of the rejected value.
        type_name: &'static str,
    },

    /// A sequence, map or record parameter could not be encoded as JSON.
    #[error("failed to encode parameter {index} (`{type_name}`) as json: {message}")]
    Encode {
        /// One-based position of the parameter.
        index: usize,
        /// Rust type name of the value.
        type_name: &'static str,
        /// Message reported by the JSON encoder.
        message: String,
    },

    /// The lease context ended before a connection became available.
    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(Unavailable),

    /// The pool configuration is invalid.
    #[error("pool misconfigured: {0}")]
    PoolMisconfigured(String),

    /// A migration script failed; nothing from it was recorded.
    #[error("migration '{script}' failed: {source}")]
    MigrationFailed {
        /// Identifier (file name) of the failing script.
        script: String,
        /// The first error raised while applying the script.
        #[source]
        source: Box<Error>,
    },

    /// `Conn::warmup` was called a second time on the same physical handle.
    #[error("connection {conn_id} is already warmed up")]
    AlreadyWarmedUp {
        /// Index of the physical handle.
        conn_id: usize,
    },

    /// A column value could not be decoded into the requested type.
    #[error("failed to decode column: {0}")]
    Decode(String),

    /// The pool or worker has been closed.
    #[error("database has been closed")]
    Closed,

    /// IO error while preparing a database path or reading scripts.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from SQLite outside the prepare/exec pipeline (open, pragmas,
    /// savepoints, close).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Returns `true` when a lease gave up because of its context.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ConnectionUnavailable(_))
    }

    /// Returns `true` for the timeout flavour of [`Error::ConnectionUnavailable`].
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable(Unavailable::TimedOut { .. })
        )
    }
}

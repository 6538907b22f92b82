//! Pool configuration: the serde-facing [`DatabaseConfig`] and the
//! [`DatabaseBuilder`] that turns it, plus code-only options, into a
//! [`Database`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::pool::Database;

/// Where the pool's connections point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// A private in-memory database shared by every connection of one pool.
    Memory,
    /// A database file. Parent directories are created on open.
    File(PathBuf),
    /// A raw SQLite URI such as `file:app.db?mode=ro`.
    Uri(String),
}

/// Serializable pool settings, usually read from a TOML file.
///
/// ```
/// let config: cellar_db::DatabaseConfig = toml::from_str(
///     r#"
///     target = { file = "data/app.db" }
///     pool_size = 4
///     "#,
/// ).unwrap();
/// assert_eq!(config.pool_size, 4);
/// assert_eq!(config.busy_timeout_ms, 5_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database target. Required before the pool can open.
    #[serde(default)]
    pub target: Option<Target>,

    /// Number of connections to open.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// SQLite busy timeout, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Per-connection statement cache capacity.
    #[serde(default = "default_statement_cache_capacity")]
    pub statement_cache_capacity: usize,
}

fn default_pool_size() -> usize {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_statement_cache_capacity() -> usize {
    64
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            target: None,
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            statement_cache_capacity: default_statement_cache_capacity(),
        }
    }
}

type ScalarFn = dyn Fn(&Context<'_>) -> rusqlite::Result<Value> + Send + Sync;

/// A user-defined scalar SQL function.
#[derive(Clone)]
pub struct ScalarFunction {
    name: String,
    n_args: i32,
    deterministic: bool,
    func: Arc<ScalarFn>,
}

impl ScalarFunction {
    /// Wraps `func` as the SQL function `name` taking `n_args` arguments
    /// (`-1` for variadic).
    pub fn new<F>(name: impl Into<String>, n_args: i32, deterministic: bool, func: F) -> Self
    where
        F: Fn(&Context<'_>) -> rusqlite::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            n_args,
            deterministic,
            func: Arc::new(func),
        }
    }

    /// SQL name of the function.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn register(&self, conn: &rusqlite::Connection) -> Result<()> {
        let mut flags = FunctionFlags::SQLITE_UTF8;
        if self.deterministic {
            flags |= FunctionFlags::SQLITE_DETERMINISTIC;
        }
        let func = AssertUnwindSafe(Arc::clone(&self.func));
        conn.create_scalar_function(self.name.as_str(), self.n_args, flags, move |ctx| {
            let AssertUnwindSafe(func) = &func;
            (**func)(ctx)
        })?;
        Ok(())
    }
}

impl fmt::Debug for ScalarFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarFunction")
            .field("name", &self.name)
            .field("n_args", &self.n_args)
            .field("deterministic", &self.deterministic)
            .finish()
    }
}

pub(crate) type ConnectHook = Box<dyn Fn(&mut Conn) -> Result<()> + Send + Sync>;

/// Everything the pool needs to open its handles, after validation.
pub(crate) struct Settings {
    pub(crate) target: Target,
    pub(crate) pool_size: usize,
    pub(crate) busy_timeout: Duration,
    pub(crate) cache_capacity: usize,
    pub(crate) functions: Vec<ScalarFunction>,
    pub(crate) on_connect: Option<ConnectHook>,
}

/// Builds a [`Database`].
///
/// Option errors are deferred: the first invalid option is reported by
/// [`DatabaseBuilder::open`].
///
/// ```
/// use std::time::Duration;
///
/// let db = cellar_db::Database::builder()
///     .memory()
///     .pool_size(2)
///     .busy_timeout(Duration::from_secs(1))
///     .open()?;
/// assert_eq!(db.pool_size(), 2);
/// # Ok::<(), cellar_db::Error>(())
/// ```
#[derive(Default)]
pub struct DatabaseBuilder {
    target: Option<Target>,
    pool_size: Option<usize>,
    busy_timeout: Option<Duration>,
    cache_capacity: Option<usize>,
    functions: Vec<ScalarFunction>,
    on_connect: Option<ConnectHook>,
    error: Option<Error>,
}

impl DatabaseBuilder {
    /// A builder with nothing configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets a fresh in-memory database, private to the opened pool.
    pub fn memory(self) -> Self {
        self.target(Target::Memory)
    }

    /// Targets a database file.
    pub fn file(self, path: impl AsRef<Path>) -> Self {
        self.target(Target::File(path.as_ref().to_path_buf()))
    }

    /// Targets a raw SQLite URI.
    pub fn uri(self, uri: impl Into<String>) -> Self {
        self.target(Target::Uri(uri.into()))
    }

    fn target(mut self, target: Target) -> Self {
        if let Some(previous) = &self.target {
            tracing::warn!(?previous, replacement = ?target, "database target set twice, overwriting");
        }
        self.target = Some(target);
        self
    }

    /// Number of connections the pool opens. Must be positive and set at
    /// most once.
    pub fn pool_size(mut self, size: usize) -> Self {
        if size == 0 {
            self.fail("pool size must be greater than zero");
        } else if self.pool_size.is_some() {
            self.fail("pool size already set");
        } else {
            self.pool_size = Some(size);
        }
        self
    }

    /// How long SQLite waits on a locked database before giving up.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = Some(timeout);
        self
    }

    /// Capacity of each connection's prepared statement cache.
    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }

    /// Runs `hook` once on every connection after pragmas and functions are
    /// set up, before the connection joins the pool. An error aborts the
    /// open.
    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Conn) -> Result<()> + Send + Sync + 'static,
    {
        self.on_connect = Some(Box::new(hook));
        self
    }

    /// Registers a scalar SQL function on every connection.
    pub fn function<F>(mut self, name: &str, n_args: i32, deterministic: bool, func: F) -> Self
    where
        F: Fn(&Context<'_>) -> rusqlite::Result<Value> + Send + Sync + 'static,
    {
        self.functions
            .push(ScalarFunction::new(name, n_args, deterministic, func));
        self
    }

    /// Applies a [`DatabaseConfig`].
    pub fn config(mut self, config: &DatabaseConfig) -> Self {
        if let Some(target) = &config.target {
            self = self.target(target.clone());
        }
        self = self.pool_size(config.pool_size);
        self.busy_timeout = Some(Duration::from_millis(config.busy_timeout_ms));
        self.cache_capacity = Some(config.statement_cache_capacity);
        self
    }

    fn fail(&mut self, message: &str) {
        if self.error.is_none() {
            self.error = Some(Error::PoolMisconfigured(message.to_string()));
        }
    }

    pub(crate) fn into_settings(self) -> Result<Settings> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let target = self
            .target
            .ok_or_else(|| Error::PoolMisconfigured("no database target configured".into()))?;
        Ok(Settings {
            target,
            pool_size: self.pool_size.unwrap_or_else(default_pool_size),
            busy_timeout: self
                .busy_timeout
                .unwrap_or(Duration::from_millis(default_busy_timeout_ms())),
            cache_capacity: self
                .cache_capacity
                .unwrap_or_else(default_statement_cache_capacity),
            functions: self.functions,
            on_connect: self.on_connect,
        })
    }

    /// Opens the pool.
    ///
    /// # Errors
    ///
    /// [`Error::PoolMisconfigured`] for invalid options, or the first error
    /// raised while opening and initializing a connection. Connections
    /// opened before the failure are closed.
    pub fn open(self) -> Result<Database> {
        Database::open(self.into_settings()?)
    }
}

impl fmt::Debug for DatabaseBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseBuilder")
            .field("target", &self.target)
            .field("pool_size", &self.pool_size)
            .field("busy_timeout", &self.busy_timeout)
            .field("cache_capacity", &self.cache_capacity)
            .field("functions", &self.functions)
            .field("on_connect", &self.on_connect.is_some())
            .field("error", &self.error)
            .finish()
    }
}

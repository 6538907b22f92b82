//! Leased connections, savepoints and the statement pipeline.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use rusqlite::functions::Context;
use rusqlite::types::Value;

use crate::binder::Param;
use crate::config::ScalarFunction;
use crate::error::{Error, Result};
use crate::pool::Shared;
use crate::sql::{compact, quote_ident};
use crate::statement::Statement;

/// One physical engine handle owned by a pool.
pub(crate) struct Handle {
    pub(crate) id: usize,
    conn: rusqlite::Connection,
    warmed: bool,
    cache_capacity: usize,
}

impl Handle {
    pub(crate) fn new(id: usize, conn: rusqlite::Connection, cache_capacity: usize) -> Self {
        conn.set_prepared_statement_cache_capacity(cache_capacity);
        Self {
            id,
            conn,
            warmed: false,
            cache_capacity,
        }
    }

    pub(crate) fn raw(&self) -> &rusqlite::Connection {
        &self.conn
    }

    /// Finalizes every cached statement, then closes the handle.
    pub(crate) fn close(self) -> Result<()> {
        let id = self.id;
        self.conn.flush_prepared_statement_cache();
        self.conn.close().map_err(|(_, err)| {
            tracing::error!(conn_id = id, error = %err, "failed to close connection");
            Error::Sqlite(err)
        })
    }
}

/// A connection leased from a [`Database`](crate::Database).
///
/// The lease ends when the `Conn` is dropped or passed to
/// [`Conn::release`]; the handle then goes back to its pool.
pub struct Conn {
    handle: Option<Handle>,
    pool: Option<Arc<Shared>>,
    savepoints: Cell<u64>,
}

impl Conn {
    pub(crate) fn leased(handle: Handle, pool: Arc<Shared>) -> Self {
        Self {
            handle: Some(handle),
            pool: Some(pool),
            savepoints: Cell::new(0),
        }
    }

    /// A connection that belongs to no pool yet, as seen by the
    /// `on_connect` hook.
    pub(crate) fn detached(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
            pool: None,
            savepoints: Cell::new(0),
        }
    }

    pub(crate) fn into_handle(mut self) -> Option<Handle> {
        self.pool = None;
        self.handle.take()
    }

    fn handle(&self) -> &Handle {
        match &self.handle {
            Some(handle) => handle,
            None => unreachable!("connection handle is only taken when the lease ends"),
        }
    }

    /// Stable index of the physical handle within its pool.
    pub fn id(&self) -> usize {
        self.handle().id
    }

    /// The underlying rusqlite connection.
    pub fn raw(&self) -> &rusqlite::Connection {
        self.handle().raw()
    }

    /// Prepares `sql` through the statement cache and binds `params` from
    /// position 1.
    ///
    /// Every parameter is encoded before any is bound, so an unsupported
    /// parameter leaves the statement untouched.
    pub fn prepare(&self, sql: &str, params: &[Param]) -> Result<Statement<'_>> {
        let sql = sql.trim();
        tracing::debug!(conn_id = self.id(), sql = %compact(sql), "prepare sql");

        let values = params
            .iter()
            .enumerate()
            .map(|(i, param)| param.encode(i + 1))
            .collect::<Result<Vec<Value>>>()?;

        let prepare_failed = |source| Error::PrepareFailed {
            sql: sql.to_owned(),
            source,
        };
        let mut stmt = self.raw().prepare_cached(sql).map_err(prepare_failed)?;

        let expected = stmt.parameter_count();
        if values.len() > expected {
            return Err(prepare_failed(rusqlite::Error::InvalidParameterCount(
                values.len(),
                expected,
            )));
        }
        for (i, value) in values.iter().enumerate() {
            stmt.raw_bind_parameter(i + 1, value)
                .map_err(prepare_failed)?;
        }
        Ok(Statement::new(stmt, sql.to_owned()))
    }

    /// Prepares `sql` and steps it exactly once, discarding any row.
    pub fn exec(&self, sql: &str, params: &[Param]) -> Result<()> {
        let mut stmt = self.prepare(sql, params)?;
        stmt.step_once()
    }

    /// Runs a script of `;`-separated statements, stopping at the first
    /// failure. Script statements bypass the statement cache.
    pub fn exec_script(&self, sql: &str) -> Result<()> {
        let sql = sql.trim();
        self.raw()
            .execute_batch(sql)
            .map_err(|source| Error::ExecFailed {
                sql: compact(sql),
                source,
            })
    }

    /// Opens a savepoint. It rolls back when dropped unless
    /// [`Savepoint::commit`] is called.
    pub fn savepoint(&self) -> Result<Savepoint<'_>> {
        let n = self.savepoints.get() + 1;
        self.savepoints.set(n);
        let name = quote_ident(&format!("cellar_sp_{n}"));
        self.raw().execute_batch(&format!("SAVEPOINT {name}"))?;
        Ok(Savepoint {
            conn: self,
            name,
            done: false,
        })
    }

    /// Runs `f` inside a savepoint, committing if it returns `Ok` and
    /// rolling back if it returns `Err` or panics. Calls nest.
    pub fn save<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Conn) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let savepoint = self.savepoint()?;
        match f(self) {
            Ok(value) => {
                savepoint.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = savepoint.rollback() {
                    tracing::error!(error = %rollback, "failed to roll back savepoint");
                }
                Err(err)
            }
        }
    }

    /// Prepares `sqls` into this handle's statement cache.
    ///
    /// Warmup happens once per physical handle: a second call on the same
    /// handle, from any lease, fails with [`Error::AlreadyWarmedUp`]. The
    /// cache grows to hold the warmed statements on top of its configured
    /// capacity.
    pub fn warmup(&mut self, sqls: &[&str]) -> Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(Error::Closed);
        };
        if handle.warmed {
            return Err(Error::AlreadyWarmedUp { conn_id: handle.id });
        }

        handle
            .conn
            .set_prepared_statement_cache_capacity(handle.cache_capacity + sqls.len());
        for sql in sqls {
            let sql = sql.trim();
            handle
                .conn
                .prepare_cached(sql)
                .map_err(|source| Error::PrepareFailed {
                    sql: sql.to_owned(),
                    source,
                })?;
        }
        handle.warmed = true;
        tracing::debug!(conn_id = handle.id, count = sqls.len(), "warmed statement cache");
        Ok(())
    }

    /// Registers a scalar SQL function on this handle only.
    ///
    /// Functions that every handle needs belong on the
    /// [`DatabaseBuilder`](crate::DatabaseBuilder) instead.
    pub fn function<F>(&self, name: &str, n_args: i32, deterministic: bool, f: F) -> Result<()>
    where
        F: Fn(&Context<'_>) -> rusqlite::Result<Value> + Send + Sync + 'static,
    {
        ScalarFunction::new(name, n_args, deterministic, f).register(self.raw())
    }

    /// Ends the lease, returning the handle to its pool.
    pub fn release(self) {}
}

impl Drop for Conn {
    fn drop(&mut self) {
        if let (Some(handle), Some(pool)) = (self.handle.take(), self.pool.take()) {
            pool.put(handle);
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.handle.as_ref().map(|h| h.id))
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

/// An open savepoint on a [`Conn`].
#[must_use = "a savepoint rolls back when dropped"]
pub struct Savepoint<'conn> {
    conn: &'conn Conn,
    name: String,
    done: bool,
}

impl Savepoint<'_> {
    /// Releases the savepoint, keeping its changes. If the release fails
    /// the savepoint is rolled back.
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        let released = self
            .conn
            .raw()
            .execute_batch(&format!("RELEASE {}", self.name));
        if let Err(err) = released {
            if let Err(rollback) = self.roll_back() {
                tracing::error!(error = %rollback, "failed to roll back savepoint");
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Rolls back and releases the savepoint.
    pub fn rollback(mut self) -> Result<()> {
        self.done = true;
        self.roll_back()
    }

    fn roll_back(&self) -> Result<()> {
        self.conn.raw().execute_batch(&format!(
            "ROLLBACK TO {name}; RELEASE {name}",
            name = self.name
        ))?;
        Ok(())
    }
}

impl Drop for Savepoint<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(err) = self.roll_back() {
                tracing::error!(error = %err, "failed to roll back savepoint");
            }
        }
    }
}

//! Connection pool creation, leasing and shutdown.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use rusqlite::OpenFlags;

use crate::config::{DatabaseBuilder, Settings, Target};
use crate::conn::{Conn, Handle};
use crate::context::LeaseContext;
use crate::error::{Error, Result, Unavailable};

static MEMORY_DATABASES: AtomicU64 = AtomicU64::new(0);

/// State shared by a [`Database`] and every [`Conn`] leased from it.
pub(crate) struct Shared {
    size: usize,
    available_tx: Sender<Handle>,
    available_rx: Receiver<Handle>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    leased: AtomicUsize,
    closed: AtomicBool,
}

impl Shared {
    /// Takes back a handle at the end of a lease.
    pub(crate) fn put(&self, handle: Handle) {
        let id = handle.id;
        let leased = self.leased.fetch_sub(1, Ordering::SeqCst) - 1;

        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!(conn_id = id, "pool closed, closing released connection");
            let _ = handle.close();
            return;
        }

        if let Err(err) = self.available_tx.send(handle) {
            let _ = err.into_inner().close();
            return;
        }
        tracing::debug!(conn_id = id, leased, "released connection");

        // close() may have drained the channel between the check above and
        // the send.
        if self.closed.load(Ordering::SeqCst) {
            let _ = self.drain();
        }
    }

    /// Closes every handle currently in the available set, returning the
    /// first error.
    fn drain(&self) -> Result<()> {
        let mut first = None;
        while let Ok(handle) = self.available_rx.try_recv() {
            if let Err(err) = handle.close() {
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// A fixed-size pool of connections to one database.
///
/// Cloning a `Database` is cheap; clones share the same pool.
#[derive(Clone)]
pub struct Database {
    shared: Arc<Shared>,
}

impl Database {
    /// Starts configuring a pool.
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    pub(crate) fn open(settings: Settings) -> Result<Self> {
        let size = settings.pool_size;
        let location = Location::resolve(&settings.target)?;

        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            match open_handle(id, &location, &settings) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    tracing::error!(conn_id = id, error = %err, "failed to open connection");
                    for handle in handles {
                        let _ = handle.close();
                    }
                    return Err(err);
                }
            }
        }

        let (available_tx, available_rx) = crossbeam_channel::bounded(size);
        for handle in handles {
            if let Err(err) = available_tx.try_send(handle) {
                let _ = err.into_inner().close();
                return Err(Error::PoolMisconfigured(
                    "connection channel is smaller than the pool".into(),
                ));
            }
        }
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);

        tracing::info!(database = %location.label, pool_size = size, "database pool opened");

        Ok(Self {
            shared: Arc::new(Shared {
                size,
                available_tx,
                available_rx,
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_rx,
                leased: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Leases a connection, blocking until one is available or `ctx` is
    /// cancelled or past its deadline.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionUnavailable`] when `ctx` ends first. A context
    ///   that has already ended fails without waiting.
    /// - [`Error::Closed`] once the pool has been closed, including for
    ///   callers already waiting when [`Database::close`] runs.
    pub fn lease(&self, ctx: &LeaseContext) -> Result<Conn> {
        let started = Instant::now();
        if let Some(err) = ctx.err(started) {
            return Err(err);
        }
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let shared = &self.shared;
        let cancelled = ctx.cancelled();
        let expired = ctx.expired();
        let handle = select! {
            recv(shared.available_rx) -> handle => handle.map_err(|_| Error::Closed)?,
            recv(shared.shutdown_rx) -> _ => return Err(Error::Closed),
            recv(cancelled) -> _ => {
                return Err(Error::ConnectionUnavailable(Unavailable::Cancelled));
            }
            recv(expired) -> _ => {
                return Err(Error::ConnectionUnavailable(Unavailable::TimedOut {
                    waited: started.elapsed(),
                }));
            }
        };

        let leased = shared.leased.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = Conn::leased(handle, Arc::clone(shared));
        if self.is_closed() {
            drop(conn);
            return Err(Error::Closed);
        }
        tracing::debug!(conn_id = conn.id(), leased, "leased connection");
        Ok(conn)
    }

    /// Leases a connection, waiting at most `timeout`.
    pub fn lease_timeout(&self, timeout: Duration) -> Result<Conn> {
        self.lease(&LeaseContext::background().with_timeout(timeout))
    }

    /// Leases a connection, waiting as long as it takes.
    pub fn lease_blocking(&self) -> Result<Conn> {
        self.lease(&LeaseContext::background())
    }

    /// Number of connections the pool was opened with.
    pub fn pool_size(&self) -> usize {
        self.shared.size
    }

    /// Number of connections currently leased.
    pub fn leased(&self) -> usize {
        self.shared.leased.load(Ordering::SeqCst)
    }

    /// Number of connections waiting in the pool.
    pub fn available(&self) -> usize {
        self.shared.available_rx.len()
    }

    /// Returns `true` once [`Database::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Shuts the pool down.
    ///
    /// New leases fail with [`Error::Closed`] and waiting callers wake with
    /// it. Every idle connection is closed; connections still leased are
    /// closed when their lease ends. All connections are attempted and the
    /// first error is returned. Calling `close` again is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut shutdown) = self.shared.shutdown_tx.lock() {
            shutdown.take();
        }

        let outstanding = self.leased();
        if outstanding > 0 {
            tracing::warn!(outstanding, "closing database with leased connections");
        }

        let result = self.shared.drain();
        tracing::info!("database pool closed");
        result
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("pool_size", &self.pool_size())
            .field("leased", &self.leased())
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A resolved connection target.
struct Location {
    path: String,
    flags: OpenFlags,
    label: String,
}

impl Location {
    fn resolve(target: &Target) -> Result<Self> {
        let base = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        Ok(match target {
            Target::Memory => {
                let n = MEMORY_DATABASES.fetch_add(1, Ordering::Relaxed);
                let name = format!("cellar-mem-{}-{n}", std::process::id());
                Self {
                    path: format!("file:{name}?mode=memory&cache=shared"),
                    flags: base | OpenFlags::SQLITE_OPEN_URI,
                    label: format!("memory:{name}"),
                }
            }
            Target::File(path) => {
                create_parent_dirs(path)?;
                Self {
                    path: path.to_string_lossy().into_owned(),
                    flags: base,
                    label: path.display().to_string(),
                }
            }
            Target::Uri(uri) => Self {
                path: uri.clone(),
                flags: base | OpenFlags::SQLITE_OPEN_URI,
                label: uri.clone(),
            },
        })
    }
}

fn create_parent_dirs(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Opens one handle and runs the per-connection setup.
fn open_handle(id: usize, location: &Location, settings: &Settings) -> Result<Handle> {
    let conn = rusqlite::Connection::open_with_flags(&location.path, location.flags)?;
    let handle = Handle::new(id, conn, settings.cache_capacity);

    if let Err(err) = configure(&handle, settings) {
        let _ = handle.close();
        return Err(err);
    }

    let Some(hook) = &settings.on_connect else {
        return Ok(handle);
    };
    let mut conn = Conn::detached(handle);
    let hooked = hook(&mut conn);
    match (hooked, conn.into_handle()) {
        (Ok(()), Some(handle)) => Ok(handle),
        (Err(err), Some(handle)) => {
            let _ = handle.close();
            Err(err)
        }
        (result, None) => result.and(Err(Error::Closed)),
    }
}

/// Applies the baseline pragmas and registers user functions.
fn configure(handle: &Handle, settings: &Settings) -> Result<()> {
    let conn = handle.raw();

    // In-memory databases report "memory", which is expected.
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if journal_mode != "wal" && journal_mode != "memory" {
        return Err(Error::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!(
                "failed to set WAL journal mode, got: {journal_mode}"
            )),
        )));
    }
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    conn.busy_timeout(settings.busy_timeout)?;

    for function in &settings.functions {
        function.register(conn)?;
    }
    Ok(())
}

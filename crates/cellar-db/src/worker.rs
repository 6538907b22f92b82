//! Bounded task queue that runs closures on pooled connections.
//!
//! A [`Worker`] owns a fixed set of OS threads. Each thread takes a task
//! from a bounded queue, leases a connection, runs the task, releases the
//! connection and only then signals the submitter. A full queue blocks
//! [`Worker::submit`], which is the only form of backpressure.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::pool::Database;

type Outcome<T> = std::result::Result<T, Box<dyn Any + Send + 'static>>;

/// A queued job: runs on a leased connection and hands back a closure that
/// delivers the result to the submitter.
type Task = Box<dyn FnOnce(&mut Conn) -> Box<dyn FnOnce() + Send> + Send>;

/// Runs closures against a [`Database`] on a fixed pool of threads.
pub struct Worker {
    queue: RwLock<Option<Sender<Task>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Starts `workers` threads fed by a queue holding up to `queue_size`
    /// pending tasks.
    ///
    /// # Errors
    ///
    /// [`Error::PoolMisconfigured`] when `workers` is zero, or
    /// [`Error::Io`] if a thread cannot be spawned.
    pub fn new(db: Database, queue_size: usize, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::PoolMisconfigured(
                "worker count must be greater than zero".into(),
            ));
        }

        let (tx, rx) = crossbeam_channel::bounded::<Task>(queue_size);
        let worker = Self {
            queue: RwLock::new(Some(tx)),
            threads: Mutex::new(Vec::with_capacity(workers)),
        };

        for i in 0..workers {
            let db = db.clone();
            let rx = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("cellar-worker-{i}"))
                .spawn(move || run(i, &db, &rx));
            match spawned {
                Ok(handle) => worker.push_thread(handle),
                Err(err) => {
                    worker.join();
                    return Err(Error::Io(err));
                }
            }
        }

        tracing::info!(workers, queue_size, "worker started");
        Ok(worker)
    }

    fn push_thread(&self, handle: JoinHandle<()>) {
        if let Ok(mut threads) = self.threads.lock() {
            threads.push(handle);
        }
    }

    /// Queues `f` and blocks until a worker has run it, returning its
    /// value.
    ///
    /// Blocks while the queue is full. A panic inside `f` is resumed on the
    /// calling thread.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] if the worker has been closed, or if the pool was
    /// closed before a connection could be leased for the task.
    pub fn submit<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Conn) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = crossbeam_channel::bounded::<Outcome<T>>(1);
        let task: Task = Box::new(move |conn: &mut Conn| -> Box<dyn FnOnce() + Send> {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(conn)));
            Box::new(move || {
                let _ = done_tx.send(outcome);
            })
        });

        let sender = match self.queue.read() {
            Ok(queue) => queue.clone(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            return Err(Error::Closed);
        };
        sender.send(task).map_err(|_| Error::Closed)?;
        drop(sender);

        match done_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(Error::Closed),
        }
    }

    /// Stops accepting tasks. Tasks already queued still run.
    pub fn close(&self) {
        if let Ok(mut queue) = self.queue.write() {
            if queue.take().is_some() {
                tracing::debug!("worker queue closed");
            }
        }
    }

    /// Closes the queue and waits for every thread to finish.
    pub fn join(&self) {
        self.close();
        let threads = match self.threads.lock() {
            Ok(mut threads) => std::mem::take(&mut *threads),
            Err(_) => return,
        };
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.join();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self.queue.read().map(|q| q.is_some()).unwrap_or(false);
        f.debug_struct("Worker").field("open", &open).finish()
    }
}

fn run(id: usize, db: &Database, rx: &Receiver<Task>) {
    for task in rx.iter() {
        let mut conn = match db.lease_blocking() {
            Ok(conn) => conn,
            Err(err) => {
                // Dropping the task disconnects its completion channel.
                tracing::error!(worker = id, error = %err, "failed to lease connection for task");
                continue;
            }
        };
        let complete = task(&mut conn);
        conn.release();
        complete();
    }
    tracing::debug!(worker = id, "worker thread exiting");
}

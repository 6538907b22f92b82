use cellar_db::{Database, Error, LeaseContext, Unavailable};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn memory_pool(size: usize) -> Database {
    Database::builder()
        .memory()
        .pool_size(size)
        .open()
        .expect("failed to open in-memory pool")
}

#[test]
fn never_more_leases_than_connections() {
    for size in [1, 2, 3, 4, 10] {
        let db = memory_pool(size);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..size * 4)
            .map(|_| {
                let db = db.clone();
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let conn = db.lease_blocking().expect("failed to lease");
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert!(db.leased() <= db.pool_size());
                        thread::yield_now();
                        current.fetch_sub(1, Ordering::SeqCst);
                        conn.release();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("lease thread panicked");
        }

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= size, "pool of {size} handed out {peak} leases");
        assert_eq!(db.leased(), 0);
        assert_eq!(db.available(), size);
    }
}

#[test]
fn cancelled_context_fails_without_leasing() {
    let db = memory_pool(1);
    let (ctx, cancel) = LeaseContext::background().with_cancel();
    cancel.cancel();

    let err = db.lease(&ctx).expect_err("cancelled context should fail");
    assert!(matches!(
        err,
        Error::ConnectionUnavailable(Unavailable::Cancelled)
    ));
    assert_eq!(db.leased(), 0);
    assert_eq!(db.available(), 1);
}

#[test]
fn expired_context_fails_even_when_connections_are_free() {
    let db = memory_pool(2);
    let ctx = LeaseContext::background().with_deadline(Instant::now() - Duration::from_millis(1));

    let err = db.lease(&ctx).expect_err("expired context should fail");
    assert!(err.is_timeout(), "unexpected error: {err:?}");
    assert_eq!(db.available(), 2);
}

#[test]
fn lease_times_out_when_pool_is_exhausted() {
    let db = memory_pool(1);
    let _held = db.lease_blocking().expect("failed to lease");

    let started = Instant::now();
    let err = db
        .lease_timeout(Duration::from_millis(50))
        .expect_err("exhausted pool should time out");
    assert!(err.is_timeout(), "unexpected error: {err:?}");
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(err.to_string().contains("timed out"), "{err}");
}

#[test]
fn cancelling_wakes_a_waiter() {
    let db = memory_pool(1);
    let held = db.lease_blocking().expect("failed to lease");
    let (ctx, cancel) = LeaseContext::background().with_cancel();

    let waiter = {
        let db = db.clone();
        thread::spawn(move || db.lease(&ctx).map(|conn| conn.id()))
    };
    thread::sleep(Duration::from_millis(30));
    cancel.cancel();

    let outcome = waiter.join().expect("waiter panicked");
    assert!(matches!(
        outcome,
        Err(Error::ConnectionUnavailable(Unavailable::Cancelled))
    ));
    drop(held);
    assert_eq!(db.available(), 1);
}

#[test]
fn released_connection_wakes_a_waiter() {
    let db = memory_pool(1);
    let held = db.lease_blocking().expect("failed to lease");
    let held_id = held.id();

    let waiter = {
        let db = db.clone();
        thread::spawn(move || db.lease_blocking().map(|conn| conn.id()))
    };
    thread::sleep(Duration::from_millis(30));
    held.release();

    let id = waiter
        .join()
        .expect("waiter panicked")
        .expect("waiter should get the released connection");
    assert_eq!(id, held_id);
}

#[test]
fn close_wakes_every_waiter() {
    let db = memory_pool(1);
    let held = db.lease_blocking().expect("failed to lease");
    let barrier = Arc::new(Barrier::new(4));

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let db = db.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                db.lease_blocking().map(|conn| conn.id())
            })
        })
        .collect();
    barrier.wait();
    thread::sleep(Duration::from_millis(30));

    db.close().expect("close should succeed");
    for waiter in waiters {
        let outcome = waiter.join().expect("waiter panicked");
        assert!(matches!(outcome, Err(Error::Closed)), "{outcome:?}");
    }

    drop(held);
    assert_eq!(db.leased(), 0);
    assert_eq!(db.available(), 0);
}

#[test]
fn file_pool_shares_data_across_connections() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db = Database::builder()
        .file(dir.path().join("app.db"))
        .pool_size(3)
        .open()
        .expect("failed to open file pool");

    let writer = db.lease_blocking().expect("failed to lease writer");
    writer
        .exec_script("CREATE TABLE notes (body TEXT NOT NULL);")
        .expect("failed to create table");
    writer
        .exec("INSERT INTO notes (body) VALUES (?)", &cellar_db::params!["hello"])
        .expect("failed to insert");

    let reader = db.lease_blocking().expect("failed to lease reader");
    assert_ne!(reader.id(), writer.id());
    let body = reader
        .prepare("SELECT body FROM notes", &[])
        .expect("failed to prepare")
        .first_row(|row| cellar_db::RowExt::get_text(row, 0))
        .expect("failed to read")
        .expect("row should exist");
    assert_eq!(body, "hello");

    drop(reader);
    drop(writer);
    db.close().expect("close should succeed");
}

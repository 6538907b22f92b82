use cellar_db::{Conn, Database, RowExt};

fn database(capacity: usize) -> Database {
    Database::builder()
        .memory()
        .pool_size(1)
        .statement_cache_capacity(capacity)
        .open()
        .expect("failed to open in-memory pool")
}

/// Prepared statements still alive on the handle, cached or in use.
fn live_statements(conn: &Conn) -> Vec<usize> {
    let mut found = Vec::new();
    // SAFETY: the handle stays open for the lease and the statements are only
    // enumerated, never used.
    unsafe {
        let db = conn.raw().handle();
        let mut stmt = rusqlite::ffi::sqlite3_next_stmt(db, std::ptr::null_mut());
        while !stmt.is_null() {
            found.push(stmt as usize);
            stmt = rusqlite::ffi::sqlite3_next_stmt(db, stmt);
        }
    }
    found
}

fn select(conn: &Conn, sql: &str) -> i64 {
    conn.prepare(sql, &[])
        .expect("failed to prepare")
        .first_row(|row| row.get_int64(0))
        .expect("failed to read")
        .expect("row should exist")
}

#[test]
fn repeated_sql_reuses_the_cached_statement() {
    let db = database(4);
    let conn = db.lease_blocking().expect("failed to lease");

    assert_eq!(select(&conn, "SELECT 1"), 1);
    let cached = live_statements(&conn);
    assert_eq!(cached.len(), 1);

    let stmt = conn
        .prepare("  SELECT 1\n", &[])
        .expect("failed to prepare again");
    assert_eq!(
        live_statements(&conn),
        cached,
        "the cached statement should be handed out, not a new one"
    );
    drop(stmt);

    assert_eq!(select(&conn, "SELECT 2"), 2);
    assert_eq!(live_statements(&conn).len(), 2);
}

#[test]
fn cache_evicts_beyond_capacity() {
    let db = database(1);
    let conn = db.lease_blocking().expect("failed to lease");

    select(&conn, "SELECT 1");
    select(&conn, "SELECT 2");
    select(&conn, "SELECT 3");
    assert_eq!(live_statements(&conn).len(), 1);
}

#[test]
fn warmup_grows_the_cache_to_hold_warmed_statements() {
    let db = database(1);
    let mut conn = db.lease_blocking().expect("failed to lease");

    conn.warmup(&["SELECT 1", "SELECT 2"])
        .expect("failed to warm up");
    let warmed = live_statements(&conn);
    assert_eq!(warmed.len(), 2, "both warmed statements stay cached");

    select(&conn, "SELECT 3");
    assert_eq!(live_statements(&conn).len(), 3);

    let stmt = conn.prepare("SELECT 1", &[]).expect("failed to prepare");
    assert_eq!(
        live_statements(&conn).len(),
        3,
        "the warmed statement should be reused"
    );
    drop(stmt);
}

use cellar_db::{applied_ids, migrate_dir, Database, Error, LeaseContext, RowExt};
use std::fs;
use std::path::Path;

fn write_script(dir: &Path, name: &str, sql: &str) {
    fs::write(dir.join(name), sql).expect("failed to write migration script");
}

fn open(path: &Path) -> Database {
    Database::builder()
        .file(path)
        .pool_size(2)
        .open()
        .expect("failed to open database")
}

fn table_count(db: &Database) -> i64 {
    db.lease_blocking()
        .expect("failed to lease")
        .prepare(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 't%'",
            &[],
        )
        .expect("failed to prepare")
        .first_row(|row| row.get_int64(0))
        .expect("failed to count tables")
        .expect("count returns a row")
}

#[test]
fn db_initialization_works() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let scripts = dir.path().join("migrations");
    fs::create_dir(&scripts).expect("failed to create migrations dir");
    write_script(&scripts, "001_t1.sql", "CREATE TABLE t1 (id INTEGER PRIMARY KEY);");

    let db = open(&dir.path().join("app.db"));
    let report = migrate_dir(&db, &LeaseContext::background(), &scripts)
        .expect("failed to run migrations");
    assert_eq!(report.applied, ["001_t1.sql"]);

    let conn = db.lease_blocking().expect("failed to lease");
    let tables = conn
        .prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            &[],
        )
        .expect("failed to prepare table query")
        .collect_rows(|row| row.get_text(0))
        .expect("failed to list tables");
    assert_eq!(tables, ["_cellar_migrations", "t1"]);
}

#[test]
fn applies_only_new_scripts_across_reopens() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let scripts = dir.path().join("migrations");
    let db_path = dir.path().join("app.db");
    fs::create_dir(&scripts).expect("failed to create migrations dir");
    write_script(&scripts, "001_t1.sql", "CREATE TABLE t1 (id INTEGER);");
    write_script(&scripts, "002_t2.sql", "CREATE TABLE t2 (id INTEGER);");

    let ctx = LeaseContext::background();
    {
        let db = open(&db_path);
        let first = migrate_dir(&db, &ctx, &scripts).expect("first run failed");
        assert_eq!(first.applied.len(), 2);
        let again = migrate_dir(&db, &ctx, &scripts).expect("second run failed");
        assert!(again.applied.is_empty());
        assert_eq!(again.skipped, 2);
        db.close().expect("failed to close");
    }

    write_script(&scripts, "003_t3.sql", "CREATE TABLE t3 (id INTEGER);");
    let db = open(&db_path);
    let report = migrate_dir(&db, &ctx, &scripts).expect("third run failed");
    assert_eq!(report.applied, ["003_t3.sql"]);
    assert_eq!(report.skipped, 2);
    assert_eq!(table_count(&db), 3);
}

#[test]
fn failure_stops_the_run_and_resumes_after_fix() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let scripts = dir.path().join("migrations");
    fs::create_dir(&scripts).expect("failed to create migrations dir");
    write_script(&scripts, "001_t1.sql", "CREATE TABLE t1 (id INTEGER);");
    write_script(&scripts, "002_t2.sql", "CREATE TABLE t2 (id INTEGER);");
    write_script(
        &scripts,
        "003_t3.sql",
        "CREATE TABLE t3 (id INTEGER);\nINSERT INTO no_such_table VALUES (1);",
    );
    write_script(&scripts, "004_t4.sql", "CREATE TABLE t4 (id INTEGER);");
    write_script(&scripts, "005_t5.sql", "CREATE TABLE t5 (id INTEGER);");

    let db = open(&dir.path().join("app.db"));
    let ctx = LeaseContext::background();
    let err = migrate_dir(&db, &ctx, &scripts).expect_err("third script should fail");
    match &err {
        Error::MigrationFailed { script, source } => {
            assert_eq!(script, "003_t3.sql");
            assert!(matches!(**source, Error::ExecFailed { .. }), "{source:?}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    {
        let conn = db.lease_blocking().expect("failed to lease");
        assert_eq!(
            applied_ids(&conn).expect("failed to read bookkeeping"),
            ["001_t1.sql", "002_t2.sql"]
        );
    }
    assert_eq!(table_count(&db), 2, "t3 must be rolled back, t4 and t5 never run");

    write_script(&scripts, "003_t3.sql", "CREATE TABLE t3 (id INTEGER);");
    let report = migrate_dir(&db, &ctx, &scripts).expect("resumed run failed");
    assert_eq!(report.applied, ["003_t3.sql", "004_t4.sql", "005_t5.sql"]);
    assert_eq!(report.skipped, 2);
    assert_eq!(table_count(&db), 5);
}

#[test]
fn non_sql_files_are_ignored() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let scripts = dir.path().join("migrations");
    fs::create_dir(&scripts).expect("failed to create migrations dir");
    write_script(&scripts, "001_t1.sql", "CREATE TABLE t1 (id INTEGER);");
    write_script(&scripts, "README.md", "not a migration");

    let db = open(&dir.path().join("app.db"));
    let report = migrate_dir(&db, &LeaseContext::background(), &scripts)
        .expect("failed to run migrations");
    assert_eq!(report.applied, ["001_t1.sql"]);
}

//! End-to-end behavior of the driver against real databases.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use litebridge_core::error::{ConnectionErrorKind, MisuseErrorKind, ResourceErrorKind};
use litebridge_core::{EngineErrorClass, StoredDateTime};
use litebridge_sqlite::{
    BatchStatus, Connection, DateTimeConfig, DateTimeFormat, Error, Hook, HookKind, OpenFlags,
    ResultClass, SqliteConfig, StepResult, UpdateAction, Value, result_code_name,
};

fn memory_with(sql: &str) -> Connection {
    let conn = Connection::open_memory().unwrap();
    conn.execute(sql).unwrap();
    conn
}

fn count(conn: &Connection, table: &str) -> i64 {
    let rows = conn
        .query_rows(&format!("SELECT count(*) FROM {}", table), &[])
        .unwrap();
    rows[0].get_as::<i64>(0).unwrap()
}

#[test]
fn multi_statement_execute_then_query() {
    let conn = memory_with("CREATE TABLE t (x TEXT); INSERT INTO t VALUES ('a'); INSERT INTO t VALUES ('b');");
    let mut stmt = conn.prepare("SELECT x FROM t ORDER BY rowid").unwrap();
    assert_eq!(stmt.step().unwrap(), StepResult::Row);
    let mut seen = Vec::new();
    {
        let mut rows = stmt.execute_query().unwrap();
        while rows.next().unwrap() {
            seen.push(rows.get_string(0).unwrap().unwrap());
        }
    }
    assert_eq!(seen, vec!["a", "b"]);

    stmt.reset().unwrap();
    assert_eq!(stmt.step().unwrap(), StepResult::Row);
    assert_eq!(stmt.step().unwrap(), StepResult::Row);
    assert_eq!(stmt.step().unwrap(), StepResult::Done);
}

#[test]
fn reset_and_rebind_reproduces_rows() {
    let conn = memory_with(
        "CREATE TABLE t (g INTEGER, v TEXT);
         INSERT INTO t VALUES (1, 'a'), (1, 'b'), (2, 'c');",
    );
    let mut stmt = conn.prepare("SELECT v FROM t WHERE g = ? ORDER BY v").unwrap();
    let collect = |stmt: &mut litebridge_sqlite::Statement, g: i64| {
        stmt.set_long(1, g).unwrap();
        let mut rows = stmt.execute_query().unwrap();
        let mut out = Vec::new();
        while rows.next().unwrap() {
            out.push(rows.get_string(0).unwrap().unwrap());
        }
        out
    };
    let first = collect(&mut stmt, 1);
    assert_eq!(collect(&mut stmt, 2), vec!["c"]);
    assert_eq!(collect(&mut stmt, 1), first);
    assert_eq!(first, vec!["a", "b"]);
}

#[test]
fn unbound_parameters_are_misuse() {
    let conn = memory_with("CREATE TABLE t (a, b)");
    let mut stmt = conn.prepare("INSERT INTO t VALUES (?, ?)").unwrap();
    stmt.set_int(1, 1).unwrap();
    match stmt.execute() {
        Err(Error::Misuse(m)) => assert_eq!(m.kind, MisuseErrorKind::UnboundParameter),
        other => panic!("unexpected: {:?}", other),
    }
    stmt.set_null(2).unwrap();
    assert!(!stmt.execute().unwrap());
    assert_eq!(count(&conn, "t"), 1);
}

#[test]
fn closing_connection_finalizes_statements() {
    let mut conn = memory_with("CREATE TABLE t (x); INSERT INTO t VALUES (1), (2);");
    let mut running = conn.prepare("SELECT x FROM t").unwrap();
    assert_eq!(running.step().unwrap(), StepResult::Row);
    let mut idle = conn.prepare("INSERT INTO t VALUES (3)").unwrap();
    let handle = conn.interrupt_handle();

    conn.close().unwrap();
    assert!(conn.is_closed());

    for err in [
        running.step().unwrap_err(),
        idle.execute_update().unwrap_err(),
        conn.prepare("SELECT 1").unwrap_err(),
        conn.last_insert_rowid().unwrap_err(),
    ] {
        assert!(err.is_closed(), "{}", err);
        assert!(err.to_string().contains("closed"));
    }
    // statements only forget their handles now
    running.close();
    idle.close();
    // no-op after close
    handle.interrupt();
    conn.interrupt();
}

#[test]
fn batch_continues_past_failures() {
    let conn = memory_with("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT CHECK (v <> 'bad'))");
    let mut stmt = conn.prepare("INSERT INTO t (v) VALUES (?)").unwrap();
    for v in ["ok1", "bad", "ok2"] {
        stmt.set_text(1, v).unwrap();
        stmt.add_batch().unwrap();
    }
    let err = stmt.execute_batch().unwrap_err();
    let Error::Batch(batch) = &err else {
        panic!("unexpected: {:?}", err);
    };
    assert_eq!(
        batch.statuses,
        vec![BatchStatus::Updated(1), BatchStatus::Failed, BatchStatus::Updated(1)]
    );
    assert_eq!(batch.failed_count(), 1);
    match &batch.errors[0].1 {
        Error::Statement(s) => assert_eq!(s.class(), EngineErrorClass::Constraint),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(std::error::Error::source(&err).is_some());
    assert_eq!(count(&conn, "t"), 2);
}

#[test]
fn zero_blob_written_in_chunks_reads_back() {
    let conn = memory_with("CREATE TABLE files (id INTEGER PRIMARY KEY, data BLOB)");
    let mut insert = conn.prepare("INSERT INTO files (data) VALUES (?)").unwrap();
    insert.set_zero_blob(1, 10_000).unwrap();
    insert.execute_update().unwrap();
    let rowid = conn.last_insert_rowid().unwrap();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    {
        let mut blob = conn.open_blob("main", "files", "data", rowid, true).unwrap();
        for chunk in payload.chunks(777) {
            blob.write_all(chunk).unwrap();
        }
        assert_eq!(
            blob.write(&[0]).unwrap_err().kind(),
            std::io::ErrorKind::WriteZero
        );
        blob.close().unwrap();
    }

    let mut blob = conn.open_blob("main", "files", "data", rowid, false).unwrap();
    let mut back = Vec::new();
    blob.read_to_end(&mut back).unwrap();
    assert_eq!(back, payload);

    blob.seek(SeekFrom::Start(9_998)).unwrap();
    let mut tail = [0u8; 4];
    assert_eq!(blob.read(&mut tail).unwrap(), 2);
    let mut window = [0u8; 8];
    match blob.read_at(&mut window, 9_995) {
        Err(Error::Resource(r)) => assert_eq!(r.kind, ResourceErrorKind::OutOfRange),
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn mismatched_storage_classes_read_back_unchanged() {
    let conn = memory_with(
        "CREATE TABLE m (i INTEGER, s TEXT, r REAL);
         INSERT INTO m VALUES (1.5, x'FF00', 'abc');
         INSERT INTO m VALUES ('abc', 1, x'01');
         INSERT INTO m VALUES (2.0, 2.5, 3);",
    );
    let mut stmt = conn.prepare("SELECT i, s, r FROM m ORDER BY rowid").unwrap();
    let mut rows = stmt.execute_query().unwrap();
    let mut seen = Vec::new();
    while rows.next().unwrap() {
        seen.push((
            rows.get_value(0).unwrap(),
            rows.get_value(1).unwrap(),
            rows.get_value(2).unwrap(),
        ));
    }
    assert_eq!(
        seen,
        vec![
            (
                Value::Double(1.5),
                Value::Bytes(vec![0xFF, 0x00]),
                Value::Text("abc".to_string()),
            ),
            (
                Value::Text("abc".to_string()),
                Value::Text("1".to_string()),
                Value::Bytes(vec![0x01]),
            ),
            (
                Value::BigInt(2),
                Value::Text("2.5".to_string()),
                Value::Double(3.0),
            ),
        ]
    );
}

#[test]
fn blob_reopen_across_rows() {
    let conn = memory_with(
        "CREATE TABLE b (id INTEGER PRIMARY KEY, data BLOB);
         INSERT INTO b VALUES (1, x'01'), (2, x'0202'), (3, x'030303');",
    );
    let mut blob = conn.open_blob("main", "b", "data", 1, false).unwrap();
    for (rowid, len) in [(2, 2), (3, 3), (1, 1)] {
        blob.reopen(rowid).unwrap();
        assert_eq!(blob.len(), len);
        let mut buf = vec![0u8; len];
        blob.read_at(&mut buf, 0).unwrap();
        assert!(buf.iter().all(|b| i64::from(*b) == rowid));
    }
}

#[test]
fn date_time_round_trip_under_every_format() {
    let date = Value::Date(19_782); // 2024-02-29
    let time = Value::Time(45_296_789_000); // 12:34:56.789
    let timestamp = Value::Timestamp(1_709_210_096_789_000); // 2024-02-29 12:34:56.789

    for format in [
        DateTimeFormat::UnixEpoch,
        DateTimeFormat::JulianDay,
        DateTimeFormat::Text,
    ] {
        let conn = Connection::open(
            &SqliteConfig::memory().date_time(DateTimeConfig::uniform(format)),
        )
        .unwrap();
        conn.execute("CREATE TABLE d (a, b, c)").unwrap();
        let mut insert = conn.prepare("INSERT INTO d VALUES (?, ?, ?)").unwrap();
        insert.set(1, date.clone()).unwrap();
        insert.set(2, time.clone()).unwrap();
        insert.set(3, timestamp.clone()).unwrap();
        insert.execute_update().unwrap();

        let mut select = conn.prepare("SELECT a, b, c, typeof(c) FROM d").unwrap();
        let mut rows = select.execute_query().unwrap();
        assert!(rows.next().unwrap());
        assert_eq!(rows.get_date(0).unwrap(), date, "{:?}", format);
        assert_eq!(rows.get_time(1).unwrap(), time, "{:?}", format);
        assert_eq!(rows.get_timestamp(2).unwrap(), timestamp, "{:?}", format);
        let stored_type = rows.get_string(3).unwrap().unwrap();
        let expected = match conn.date_time_config().encode(&timestamp) {
            Some(StoredDateTime::Integer(_)) => "integer",
            Some(StoredDateTime::Real(_)) => "real",
            Some(StoredDateTime::Text(_)) => "text",
            None => unreachable!(),
        };
        assert_eq!(stored_type, expected);
    }
}

#[test]
fn opening_missing_file_read_only_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.db");
    let config = SqliteConfig::file(path.to_string_lossy().into_owned()).flags(OpenFlags::read_only());
    match Connection::open(&config) {
        Err(Error::Connection(c)) => {
            assert_eq!(c.kind, ConnectionErrorKind::Open);
            assert!(c.message.contains("missing.db"));
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn file_database_persists_and_reports_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db").to_string_lossy().into_owned();
    {
        let conn = Connection::open_file(path.clone()).unwrap();
        conn.execute("CREATE TABLE t (x); INSERT INTO t VALUES (42);").unwrap();
    }
    let conn = Connection::open(&SqliteConfig::file(path).flags(OpenFlags::read_only())).unwrap();
    assert!(conn.is_read_only());
    assert_eq!(count(&conn, "t"), 1);
    let err = conn.execute("INSERT INTO t VALUES (1)").unwrap_err();
    assert_eq!(err.code().map(ResultClass::of), Some(ResultClass::Error));
    assert_eq!(result_code_name(err.code().unwrap()), "SQLITE_READONLY");
}

#[test]
fn savepoints_nest_and_quote_names() {
    let conn = memory_with("CREATE TABLE t (x)");
    conn.set_auto_commit(false).unwrap();
    let outer = conn.savepoint().unwrap();
    let inner = conn.savepoint().unwrap();
    assert_eq!(outer.id(), Some(0));
    assert_eq!(inner.name(), "1");

    conn.execute("INSERT INTO t VALUES (1)").unwrap();
    let named = conn.savepoint_named("it's named").unwrap();
    assert_eq!(named.id(), None);
    conn.execute("INSERT INTO t VALUES (2)").unwrap();
    conn.rollback_to(&named).unwrap();
    assert_eq!(count(&conn, "t"), 1);
    conn.release(&named).unwrap();

    conn.rollback_to(&inner).unwrap();
    assert_eq!(count(&conn, "t"), 0);
    conn.release(&outer).unwrap();
    conn.set_auto_commit(true).unwrap();
    assert!(conn.engine_auto_commit().unwrap());
}

#[test]
fn commit_and_rollback_reopen_transactions() {
    let conn = memory_with("CREATE TABLE t (x)");
    match conn.commit() {
        Err(Error::Misuse(m)) => assert_eq!(m.message, "database in auto-commit mode"),
        other => panic!("unexpected: {:?}", other),
    }
    conn.set_auto_commit(false).unwrap();
    conn.execute("INSERT INTO t VALUES (1)").unwrap();
    conn.rollback().unwrap();
    assert_eq!(count(&conn, "t"), 0);
    conn.execute("INSERT INTO t VALUES (2)").unwrap();
    conn.commit().unwrap();
    assert!(!conn.engine_auto_commit().unwrap());
    conn.set_auto_commit(true).unwrap();
    assert_eq!(count(&conn, "t"), 1);
}

#[test]
fn update_hook_reports_changes() {
    let conn = memory_with("CREATE TABLE t (id INTEGER PRIMARY KEY, v)");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    conn.set_hook(Hook::Update(Box::new(move |action: UpdateAction, db: &str, table: &str, rowid: i64| {
        sink.lock()
            .unwrap()
            .push((action, db.to_string(), table.to_string(), rowid));
    })))
    .unwrap();
    assert!(conn.has_hook(HookKind::Update));

    conn.execute("INSERT INTO t VALUES (7, 'a'); UPDATE t SET v = 'b'; DELETE FROM t;")
        .unwrap();
    conn.remove_hook(HookKind::Update).unwrap();
    conn.execute("INSERT INTO t VALUES (8, 'c')").unwrap();

    let seen = seen.lock().unwrap();
    let actions: Vec<_> = seen.iter().map(|(a, _, _, r)| (*a, *r)).collect();
    assert_eq!(
        actions,
        vec![
            (UpdateAction::Insert, 7),
            (UpdateAction::Update, 7),
            (UpdateAction::Delete, 7)
        ]
    );
    assert!(seen.iter().all(|(_, db, table, _)| db == "main" && table == "t"));
}

#[test]
fn trace_and_profile_share_registration() {
    let conn = Connection::open_memory().unwrap();
    let traced = Arc::new(Mutex::new(Vec::new()));
    let profiled = Arc::new(AtomicUsize::new(0));
    let t = Arc::clone(&traced);
    let p = Arc::clone(&profiled);
    conn.set_hook(Hook::Trace(Box::new(move |sql: &str| t.lock().unwrap().push(sql.to_string()))))
        .unwrap();
    conn.set_hook(Hook::Profile(Box::new(move |_sql: &str, _elapsed: Duration| {
        p.fetch_add(1, Ordering::SeqCst);
    })))
    .unwrap();

    conn.execute("SELECT 1").unwrap();
    conn.remove_hook(HookKind::Trace).unwrap();
    assert!(conn.has_hook(HookKind::Profile));
    conn.execute("SELECT 2").unwrap();
    conn.remove_hook(HookKind::Profile).unwrap();
    conn.execute("SELECT 3").unwrap();

    assert_eq!(*traced.lock().unwrap(), vec!["SELECT 1".to_string()]);
    assert_eq!(profiled.load(Ordering::SeqCst), 2);
}

#[test]
fn progress_handler_can_interrupt() {
    let conn = Connection::open_memory().unwrap();
    conn.set_hook(Hook::Progress {
        period: 100,
        handler: Box::new(|| true),
    })
    .unwrap();
    let err = conn
        .execute("WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c WHERE n < 1000000) SELECT count(*) FROM c")
        .unwrap_err();
    match err {
        Error::Statement(s) => assert_eq!(s.class(), EngineErrorClass::Interrupted),
        other => panic!("unexpected: {:?}", other),
    }
    conn.remove_hook(HookKind::Progress).unwrap();
    conn.execute("SELECT 1").unwrap();
}

#[test]
fn scalar_functions_receive_values() {
    let conn = Connection::open_memory().unwrap();
    conn.create_scalar_function("add_one", 1, true, |args: &[Value]| {
        match &args[0] {
            Value::BigInt(n) => Ok(Value::BigInt(n + 1)),
            Value::Text(s) => Ok(Value::Text(format!("{}1", s))),
            Value::Null => Ok(Value::Null),
            other => Err(Error::misuse(
                MisuseErrorKind::UnsupportedValue,
                format!("cannot add one to {}", other.type_name()),
            )),
        }
    })
    .unwrap();

    let rows = conn
        .query_rows("SELECT add_one(41), add_one('x'), add_one(NULL)", &[])
        .unwrap();
    assert_eq!(rows[0].get(0), Some(&Value::BigInt(42)));
    assert_eq!(rows[0].get(1), Some(&Value::Text("x1".to_string())));
    assert_eq!(rows[0].get(2), Some(&Value::Null));

    let err = conn.query_rows("SELECT add_one(x'00')", &[]).unwrap_err();
    assert!(err.to_string().contains("cannot add one to"));
}

#[test]
fn interrupt_from_another_thread() {
    let conn = Connection::open_memory().unwrap();
    let handle = conn.interrupt_handle();
    let done = Arc::new(AtomicBool::new(false));
    let stop = Arc::clone(&done);
    let interrupter = std::thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            handle.interrupt();
            std::thread::sleep(Duration::from_millis(5));
        }
    });
    let result = conn.execute(
        "WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c) SELECT max(n) FROM c",
    );
    done.store(true, Ordering::SeqCst);
    interrupter.join().unwrap();
    match result {
        Err(Error::Statement(s)) => assert_eq!(s.class(), EngineErrorClass::Interrupted),
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn connection_is_shareable_across_threads() {
    let conn = Arc::new(memory_with("CREATE TABLE t (x)"));
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let conn = Arc::clone(&conn);
            std::thread::spawn(move || {
                for j in 0..25 {
                    conn.execute_update("INSERT INTO t VALUES (?)", &[Value::BigInt(i * 100 + j)])
                        .unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(count(&conn, "t"), 100);
}

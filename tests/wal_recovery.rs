//! Write-ahead log recovery: crash simulation (a handle dropped without a
//! checkpoint), clean close, and corrupted-tail tolerance.

mod common;

use common::*;
use sawitdb::{Command, Options, QueryOutput, SawitDB, SyncMode, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn wal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(".wal");
    PathBuf::from(name)
}

fn open_wal_db(dir: &TempDir, sync: SyncMode) -> (PathBuf, SawitDB) {
    let path = dir.path().join("test.db");
    let db = SawitDB::open_with(
        &path,
        Options {
            wal: Some(sync),
            ..Options::default()
        },
    )
    .expect("open database with wal");
    (path, db)
}

fn insert_n(db: &mut SawitDB, table: &str, n: i64) {
    let rows = (0..n)
        .map(|i| {
            rec(&[
                ("id", Value::Int(i)),
                ("payload", Value::Str(format!("row-{}", i))),
            ])
        })
        .collect();
    insert(db, table, rows);
}

#[test]
fn crash_before_close_recovers_all_rows() {
    let dir = TempDir::new().unwrap();
    let (path, mut db) = open_wal_db(&dir, SyncMode::Normal);

    create_table(&mut db, "t");
    insert_n(&mut db, "t", 100);

    // simulate a crash: the handle disappears without close()
    std::mem::forget(db);

    let mut db = SawitDB::open_with(
        &path,
        Options {
            wal: Some(SyncMode::Normal),
            ..Options::default()
        },
    )
    .unwrap();
    assert_eq!(select_where(&mut db, "t", None).len(), 100);
    // recovery truncates the log
    assert_eq!(fs::metadata(wal_path(&path)).unwrap().len(), 0);
}

#[test]
fn clean_close_checkpoints_and_truncates() {
    let dir = TempDir::new().unwrap();
    let (path, mut db) = open_wal_db(&dir, SyncMode::Normal);

    create_table(&mut db, "t");
    insert_n(&mut db, "t", 10);
    db.close().unwrap();
    assert_eq!(fs::metadata(wal_path(&path)).unwrap().len(), 0);

    let mut db = SawitDB::open(&path).unwrap();
    assert_eq!(select_where(&mut db, "t", None).len(), 10);
}

#[test]
fn recovery_replays_updates_and_deletes() {
    let dir = TempDir::new().unwrap();
    let (path, mut db) = open_wal_db(&dir, SyncMode::Normal);

    create_table(&mut db, "t");
    insert_n(&mut db, "t", 5);
    db.query(
        Command::Update {
            table: "t".into(),
            updates: rec(&[("payload", Value::Str("new".into()))]),
            criteria: Some(eq("id", Value::Int(1))),
        },
        "UPDATE t SET payload = 'new' WHERE id = 1",
    );
    db.query(
        Command::Delete {
            table: "t".into(),
            criteria: Some(eq("id", Value::Int(3))),
        },
        "DELETE FROM t WHERE id = 3",
    );
    std::mem::forget(db);

    let mut db = SawitDB::open(&path).unwrap();
    let all = select_where(&mut db, "t", None);
    assert_eq!(all.len(), 4);
    let updated = select_where(&mut db, "t", Some(eq("id", Value::Int(1))));
    assert_eq!(updated[0].get("payload"), Some(&Value::Str("new".into())));
    assert!(select_where(&mut db, "t", Some(eq("id", Value::Int(3)))).is_empty());
}

#[test]
fn corrupted_tail_keeps_earlier_operations() {
    let dir = TempDir::new().unwrap();
    let (path, mut db) = open_wal_db(&dir, SyncMode::Full);

    create_table(&mut db, "t");
    insert_n(&mut db, "t", 20);
    std::mem::forget(db);

    // garbage appended after the last valid frame
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(wal_path(&path))
        .unwrap();
    file.write_all(&[0xBA, 0xD0, 0xBA, 0xD0, 0x01]).unwrap();
    drop(file);

    let mut db = SawitDB::open(&path).unwrap();
    assert_eq!(select_where(&mut db, "t", None).len(), 20);
}

#[test]
fn recovery_restores_index_definitions_and_contents() {
    let dir = TempDir::new().unwrap();
    let (path, mut db) = open_wal_db(&dir, SyncMode::Normal);

    create_table(&mut db, "t");
    insert_n(&mut db, "t", 8);
    let out = db.query(
        Command::CreateIndex {
            table: "t".into(),
            field: "id".into(),
        },
        "CREATE INDEX ON t (id)",
    );
    assert!(matches!(&out, QueryOutput::Message(m) if m.starts_with("Index created")));
    std::mem::forget(db);

    let mut db = SawitDB::open(&path).unwrap();
    let indexes = rows(db.query(
        Command::ShowIndexes {
            table: Some("t".into()),
        },
        "SHOW INDEXES FROM t",
    ));
    assert_eq!(indexes.len(), 1);
    assert_eq!(indexes[0].get("keyField"), Some(&Value::Str("id".into())));
    assert_eq!(indexes[0].get("size"), Some(&Value::Int(8)));
}

#[test]
fn without_wal_writes_go_straight_through() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let mut db = SawitDB::open(&path).unwrap();
    create_table(&mut db, "t");
    insert_n(&mut db, "t", 7);
    // no close, no wal: the write-through pager already persisted pages
    std::mem::forget(db);

    let mut db = SawitDB::open(&path).unwrap();
    assert_eq!(select_where(&mut db, "t", None).len(), 7);
}

#[test]
fn reopen_after_reopen_is_stable() {
    let dir = TempDir::new().unwrap();
    let (path, mut db) = open_wal_db(&dir, SyncMode::Normal);
    create_table(&mut db, "t");
    insert_n(&mut db, "t", 30);
    std::mem::forget(db);

    // first reopen recovers, second reopen must see identical state
    let mut db = SawitDB::open_with(
        &path,
        Options {
            wal: Some(SyncMode::Normal),
            ..Options::default()
        },
    )
    .unwrap();
    let first = select_where(&mut db, "t", None);
    db.close().unwrap();

    let mut db = SawitDB::open(&path).unwrap();
    assert_eq!(select_where(&mut db, "t", None), first);
}

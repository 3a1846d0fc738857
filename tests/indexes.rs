//! Secondary indexes: probe correctness, lockstep maintenance through
//! insert/update/delete, idempotent creation, and the `_indexes` rows.

mod common;

use common::*;
use sawitdb::{Command, QueryOutput, Value};

fn create_index(db: &mut sawitdb::SawitDB, table: &str, field: &str) -> String {
    message(db.query(
        Command::CreateIndex {
            table: table.to_string(),
            field: field.to_string(),
        },
        &format!("CREATE INDEX ON {} ({})", table, field),
    ))
}

fn seed(db: &mut sawitdb::SawitDB) {
    create_table(db, "t");
    insert(
        db,
        "t",
        vec![
            rec(&[("id", Value::Int(1)), ("loc", Value::Str("A".into()))]),
            rec(&[("id", Value::Int(2)), ("loc", Value::Str("A".into()))]),
            rec(&[("id", Value::Int(3)), ("loc", Value::Str("B".into()))]),
            rec(&[("id", Value::Int(4)), ("loc", Value::Str("C".into()))]),
        ],
    );
}

#[test]
fn probe_equals_full_scan() {
    let (_dir, mut db) = open_db();
    seed(&mut db);
    let scanned = select_where(&mut db, "t", Some(eq("loc", Value::Str("A".into()))));

    assert!(create_index(&mut db, "t", "loc").starts_with("Index created"));
    let probed = select_where(&mut db, "t", Some(eq("loc", Value::Str("A".into()))));
    assert_eq!(probed, scanned);
    assert_eq!(probed.len(), 2);
}

#[test]
fn create_index_is_idempotent() {
    let (_dir, mut db) = open_db();
    seed(&mut db);
    assert!(create_index(&mut db, "t", "loc").starts_with("Index created"));
    assert!(create_index(&mut db, "t", "loc").contains("already exists"));

    // exactly one definition row persisted
    let definitions = select_where(
        &mut db,
        "_indexes",
        Some(eq("table", Value::Str("t".into()))),
    );
    assert_eq!(definitions.len(), 1);
}

#[test]
fn index_follows_inserts_updates_and_deletes() {
    let (_dir, mut db) = open_db();
    seed(&mut db);
    create_index(&mut db, "t", "loc");

    insert(
        &mut db,
        "t",
        vec![rec(&[("id", Value::Int(5)), ("loc", Value::Str("B".into()))])],
    );
    assert_eq!(
        select_where(&mut db, "t", Some(eq("loc", Value::Str("B".into())))).len(),
        2
    );

    // moving a record's key relocates its entry
    db.query(
        Command::Update {
            table: "t".into(),
            updates: rec(&[("loc", Value::Str("B".into()))]),
            criteria: Some(eq("id", Value::Int(4))),
        },
        "UPDATE t SET loc = 'B' WHERE id = 4",
    );
    assert_eq!(
        select_where(&mut db, "t", Some(eq("loc", Value::Str("B".into())))).len(),
        3
    );
    assert!(select_where(&mut db, "t", Some(eq("loc", Value::Str("C".into())))).is_empty());

    db.query(
        Command::Delete {
            table: "t".into(),
            criteria: Some(eq("loc", Value::Str("B".into()))),
        },
        "DELETE FROM t WHERE loc = 'B'",
    );
    assert!(select_where(&mut db, "t", Some(eq("loc", Value::Str("B".into())))).is_empty());
    assert_eq!(select_where(&mut db, "t", None).len(), 2);
}

#[test]
fn updating_an_unindexed_field_keeps_the_probe_fresh() {
    let (_dir, mut db) = open_db();
    seed(&mut db);
    create_index(&mut db, "t", "loc");

    db.query(
        Command::Update {
            table: "t".into(),
            updates: rec(&[("id", Value::Int(30))]),
            criteria: Some(eq("id", Value::Int(3))),
        },
        "UPDATE t SET id = 30 WHERE id = 3",
    );

    // the indexed entry must reflect the record's new content
    let probed = select_where(&mut db, "t", Some(eq("loc", Value::Str("B".into()))));
    assert_eq!(probed.len(), 1);
    assert_eq!(probed[0].get("id"), Some(&Value::Int(30)));

    // and a later delete through the index still finds it
    db.query(
        Command::Delete {
            table: "t".into(),
            criteria: Some(eq("loc", Value::Str("B".into()))),
        },
        "DELETE FROM t WHERE loc = 'B'",
    );
    assert!(select_where(&mut db, "t", Some(eq("loc", Value::Str("B".into())))).is_empty());
    assert_eq!(select_where(&mut db, "t", None).len(), 3);
}

#[test]
fn each_record_appears_exactly_once_per_key() {
    let (_dir, mut db) = open_db();
    seed(&mut db);
    create_index(&mut db, "t", "loc");

    // churn: moves, rewrites, reinserts
    db.query(
        Command::Update {
            table: "t".into(),
            updates: rec(&[("loc", Value::Str("A".into()))]),
            criteria: None,
        },
        "UPDATE t SET loc = 'A'",
    );
    let probed = select_where(&mut db, "t", Some(eq("loc", Value::Str("A".into()))));
    assert_eq!(probed.len(), 4);
    let mut ids: Vec<&Value> = probed.iter().map(|r| r.get("id").unwrap()).collect();
    ids.sort_by(|a, b| a.total_cmp(b));
    ids.dedup();
    assert_eq!(ids.len(), 4, "every record indexed exactly once");

    let stats = rows(db.query(
        Command::ShowIndexes {
            table: Some("t".into()),
        },
        "SHOW INDEXES FROM t",
    ));
    assert_eq!(stats[0].get("size"), Some(&Value::Int(4)));
}

#[test]
fn index_survives_reopen_via_rebuild() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let mut db = sawitdb::SawitDB::open(&path).unwrap();
    seed(&mut db);
    create_index(&mut db, "t", "loc");
    db.close().unwrap();
    drop(db);

    let mut db = sawitdb::SawitDB::open(&path).unwrap();
    let stats = rows(db.query(
        Command::ShowIndexes { table: None },
        "SHOW INDEXES",
    ));
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].get("name"), Some(&Value::Str("t.loc".into())));
    assert_eq!(stats[0].get("size"), Some(&Value::Int(4)));

    let probed = select_where(&mut db, "t", Some(eq("loc", Value::Str("A".into()))));
    assert_eq!(probed.len(), 2);
}

#[test]
fn dropping_a_table_purges_its_index_rows() {
    let (_dir, mut db) = open_db();
    seed(&mut db);
    create_index(&mut db, "t", "loc");
    create_index(&mut db, "t", "id");

    let out = db.query(
        Command::DropTable { table: "t".into() },
        "DROP TABLE t",
    );
    assert!(matches!(&out, QueryOutput::Message(m) if m.contains("dropped")));

    assert!(rows(db.query(
        Command::ShowIndexes { table: None },
        "SHOW INDEXES"
    ))
    .is_empty());
    assert!(select_where(&mut db, "_indexes", None).is_empty());
}

#[test]
fn create_index_on_missing_table_fails() {
    let (_dir, mut db) = open_db();
    let out = create_index(&mut db, "ghost", "id");
    assert!(out.starts_with("Error:"));
}

#[test]
fn numeric_keys_probe_across_int_and_float() {
    let (_dir, mut db) = open_db();
    seed(&mut db);
    create_index(&mut db, "t", "id");

    let probed = select_where(&mut db, "t", Some(eq("id", Value::Float(2.0))));
    assert_eq!(probed.len(), 1);
    assert_eq!(probed[0].get("loc"), Some(&Value::Str("A".into())));
}

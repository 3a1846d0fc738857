//! Shared helpers for the integration suites.
#![allow(dead_code)]

use sawitdb::{
    CmpOp, Command, Condition, Criteria, Operand, QueryOutput, Record, SawitDB, Value,
};
use tempfile::TempDir;

/// Fresh on-disk database in a temp directory. Keep the `TempDir` alive
/// for the test's duration.
pub fn open_db() -> (TempDir, SawitDB) {
    let dir = TempDir::new().expect("temp dir");
    let db = SawitDB::open(dir.path().join("test.db")).expect("open database");
    (dir, db)
}

pub fn rec(pairs: &[(&str, Value)]) -> Record {
    Record::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())))
}

pub fn eq(key: &str, val: Value) -> Criteria {
    Criteria::Cmp(Condition {
        key: key.to_string(),
        op: CmpOp::Eq,
        val: Operand::One(val),
    })
}

pub fn cmp(key: &str, op: CmpOp, val: Value) -> Criteria {
    Criteria::Cmp(Condition {
        key: key.to_string(),
        op,
        val: Operand::One(val),
    })
}

pub fn create_table(db: &mut SawitDB, table: &str) {
    let out = db.query(
        Command::CreateTable {
            table: table.to_string(),
        },
        &format!("CREATE TABLE {}", table),
    );
    assert!(
        matches!(&out, QueryOutput::Message(m) if !m.starts_with("Error:")),
        "create table failed: {:?}",
        out
    );
}

pub fn insert(db: &mut SawitDB, table: &str, rows: Vec<Record>) {
    let out = db.query(
        Command::Insert {
            table: table.to_string(),
            rows,
        },
        &format!("INSERT INTO {}", table),
    );
    assert!(
        matches!(&out, QueryOutput::Message(m) if m.starts_with("Inserted")),
        "insert failed: {:?}",
        out
    );
}

/// Bare `SELECT *` with an optional WHERE.
pub fn select_where(db: &mut SawitDB, table: &str, criteria: Option<Criteria>) -> Vec<Record> {
    let out = db.query(
        Command::Select {
            table: table.to_string(),
            cols: vec!["*".to_string()],
            criteria,
            sort: None,
            limit: None,
            offset: None,
            joins: Vec::new(),
            distinct: false,
        },
        "SELECT *",
    );
    rows(out)
}

pub fn rows(out: QueryOutput) -> Vec<Record> {
    match out {
        QueryOutput::Rows(rows) => rows,
        other => panic!("expected rows, got {:?}", other),
    }
}

pub fn message(out: QueryOutput) -> String {
    match out {
        QueryOutput::Message(message) => message,
        other => panic!("expected a message, got {:?}", other),
    }
}

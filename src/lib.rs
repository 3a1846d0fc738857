//! SawitDB: an embedded single-file relational store.
//!
//! The database lives in one paged file: page 0 is the table directory,
//! every other page is a heap-data page in some table's linked list.
//! Records are runtime-typed field maps stored as length-prefixed JSON.
//! Secondary indexes are rebuilt in memory at open and kept in lockstep
//! with heap mutations; an optional write-ahead log makes operations
//! durable across crashes.
//!
//! The tokenizer/parser, CLI, and network layers live outside this crate.
//! They hand the executor a typed [`Command`] and receive a
//! [`QueryOutput`]; committed mutations are observable through an
//! [`EventSink`].
//!
//! # Examples
//! ```no_run
//! use sawitdb::{Command, Record, SawitDB, Value};
//!
//! let mut db = SawitDB::open("app.db").unwrap();
//! db.query(
//!     Command::CreateTable { table: "users".into() },
//!     "CREATE TABLE users",
//! );
//! db.query(
//!     Command::Insert {
//!         table: "users".into(),
//!         rows: vec![Record::from_pairs([
//!             ("id", Value::Int(1)),
//!             ("name", Value::Str("ayu".into())),
//!         ])],
//!     },
//!     "INSERT INTO users ...",
//! );
//! ```

pub mod cache;
pub mod command;
pub mod engine;
pub mod event;
pub mod index;
pub mod record;
pub mod storage;
pub mod wal;

pub use cache::QueryCache;
pub use command::{
    AggregateFunc, CmpOp, Command, Condition, Criteria, Having, JoinClause, JoinType, Logic,
    OnClause, Operand, SortDir, SortSpec,
};
pub use engine::{EngineError, Options, Plan, PlanStep, QueryOutput, SawitDB, ScanMethod};
pub use event::{EventSink, NoopSink};
pub use record::{Record, Value};
pub use storage::{CatalogEntry, StorageError, MAX_RECORD_LEN, MAX_TABLES, PAGE_SIZE};
pub use wal::SyncMode;

//! Post-commit lifecycle hooks.
//!
//! External collaborators (change-data-capture, replication, the CLI)
//! observe committed mutations through this capability set. Hooks run
//! synchronously after the mutation and before `query()` returns; they are
//! observers only and must not reach back into the database. A panicking
//! hook is caught and logged by the engine — the mutation it observed has
//! already committed.

use crate::record::Record;
use crate::storage::CatalogEntry;

/// Capability set fired after each committed operation. Every method has a
/// no-op default, so implementors override only what they watch.
pub trait EventSink {
    fn on_table_created(&self, _name: &str, _entry: &CatalogEntry, _raw_query: &str) {}

    fn on_table_dropped(&self, _name: &str, _entry: &CatalogEntry, _raw_query: &str) {}

    fn on_insert(&self, _table: &str, _records: &[Record], _raw_query: &str) {}

    fn on_update(&self, _table: &str, _records: &[Record], _raw_query: &str) {}

    fn on_delete(&self, _table: &str, _records: &[Record], _raw_query: &str) {}

    fn on_select(&self, _table: &str, _records: &[Record], _raw_query: &str) {}
}

/// The default sink: observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {}

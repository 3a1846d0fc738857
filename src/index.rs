//! In-memory secondary indexes.
//!
//! An index maps one field of one table to the records carrying each key.
//! Index existence is persisted as a row in the `_indexes` system table;
//! contents are rebuilt by a full scan at open, so entries live purely in
//! memory. Each entry carries the heap page the record was last seen on —
//! a hint, not an invariant: callers must tolerate stale hints.

use crate::record::{Record, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
/// Ordered index key: null < number < string < bool. Integers and floats
/// share the numeric rank so `1` and `1.0` collide as index keys.
pub struct IndexKey(Value);

impl IndexKey {
    pub fn from_value(value: &Value) -> Self {
        IndexKey(value.clone())
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone)]
/// One indexed record plus the page it was last seen on.
pub struct IndexEntry {
    pub record: Record,
    pub page_hint: u32,
}

#[derive(Debug)]
/// Ordered key → record-list map over one field of one table.
pub struct FieldIndex {
    table: String,
    field: String,
    map: BTreeMap<IndexKey, Vec<IndexEntry>>,
    len: usize,
}

impl FieldIndex {
    pub fn new(table: impl Into<String>, field: impl Into<String>) -> Self {
        FieldIndex {
            table: table.into(),
            field: field.into(),
            map: BTreeMap::new(),
            len: 0,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// `<table>.<field>`, the index's reported name.
    pub fn name(&self) -> String {
        format!("{}.{}", self.table, self.field)
    }

    /// Total number of entries across all keys.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a record under its key. The caller passes the heap page the
    /// record was just written to.
    pub fn insert(&mut self, key: &Value, record: Record, page_hint: u32) {
        self.map
            .entry(IndexKey::from_value(key))
            .or_default()
            .push(IndexEntry { record, page_hint });
        self.len += 1;
    }

    /// Remove the first entry under `key` that deep-equals `record`.
    /// Dropping the last entry removes the key. Returns whether an entry
    /// was removed.
    pub fn remove(&mut self, key: &Value, record: &Record) -> bool {
        let map_key = IndexKey::from_value(key);
        let Some(bucket) = self.map.get_mut(&map_key) else {
            return false;
        };
        let Some(idx) = bucket.iter().position(|entry| entry.record == *record) else {
            return false;
        };
        bucket.remove(idx);
        self.len -= 1;
        if bucket.is_empty() {
            self.map.remove(&map_key);
        }
        true
    }

    /// Refresh the entry whose record deep-equals `old`: the key stays,
    /// the stored record content and page hint are replaced. Returns
    /// whether an entry was found.
    pub fn replace(&mut self, key: &Value, old: &Record, new: Record, page_hint: u32) -> bool {
        let Some(bucket) = self.map.get_mut(&IndexKey::from_value(key)) else {
            return false;
        };
        let Some(entry) = bucket.iter_mut().find(|entry| entry.record == *old) else {
            return false;
        };
        entry.record = new;
        entry.page_hint = page_hint;
        true
    }

    /// All records whose indexed field equals `key`.
    pub fn search(&self, key: &Value) -> Vec<Record> {
        self.map
            .get(&IndexKey::from_value(key))
            .map(|bucket| bucket.iter().map(|entry| entry.record.clone()).collect())
            .unwrap_or_default()
    }

    /// Entries (with page hints) whose indexed field equals `key`.
    pub fn entries(&self, key: &Value) -> &[IndexEntry] {
        self.map
            .get(&IndexKey::from_value(key))
            .map(|bucket| bucket.as_slice())
            .unwrap_or(&[])
    }

    /// Drop all entries, keeping the definition.
    pub fn clear(&mut self) {
        self.map.clear();
        self.len = 0;
    }

    /// Stats row: `{name, keyField, size}` plus the owning table.
    pub fn stats(&self) -> Record {
        Record::from_pairs([
            ("name", Value::Str(self.name())),
            ("table", Value::Str(self.table.clone())),
            ("keyField", Value::Str(self.field.clone())),
            ("size", Value::Int(self.len as i64)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: i64, v: &str) -> Record {
        Record::from_pairs([("id", Value::Int(id)), ("v", Value::Str(v.into()))])
    }

    #[test]
    fn insert_search_remove() {
        let mut index = FieldIndex::new("t", "v");
        index.insert(&Value::Str("a".into()), rec(1, "a"), 1);
        index.insert(&Value::Str("a".into()), rec(2, "a"), 1);
        index.insert(&Value::Str("b".into()), rec(3, "b"), 2);

        assert_eq!(index.len(), 3);
        assert_eq!(index.search(&Value::Str("a".into())).len(), 2);

        assert!(index.remove(&Value::Str("a".into()), &rec(1, "a")));
        assert_eq!(index.search(&Value::Str("a".into())).len(), 1);
        // removing the last bucket entry drops the key
        assert!(index.remove(&Value::Str("b".into()), &rec(3, "b")));
        assert!(index.search(&Value::Str("b".into())).is_empty());
        assert!(!index.remove(&Value::Str("b".into()), &rec(3, "b")));
    }

    #[test]
    fn numeric_keys_unify_int_and_float() {
        let mut index = FieldIndex::new("t", "id");
        index.insert(&Value::Int(1), rec(1, "x"), 1);
        assert_eq!(index.search(&Value::Float(1.0)).len(), 1);
    }

    #[test]
    fn cross_type_keys_do_not_panic() {
        let mut index = FieldIndex::new("t", "k");
        index.insert(&Value::Int(2), rec(1, "n"), 1);
        index.insert(&Value::Str("2".into()), rec(2, "s"), 1);
        index.insert(&Value::Bool(true), rec(3, "b"), 1);
        index.insert(&Value::Null, rec(4, "z"), 1);
        assert_eq!(index.len(), 4);
        // number, string, and bool land under distinct keys
        assert_eq!(index.search(&Value::Int(2)).len(), 1);
        assert_eq!(index.search(&Value::Str("2".into())).len(), 1);
        assert_eq!(index.search(&Value::Bool(true)).len(), 1);
    }

    #[test]
    fn stats_reports_size_and_field() {
        let mut index = FieldIndex::new("users", "email");
        index.insert(&Value::Str("a@x".into()), rec(1, "a@x"), 3);
        let stats = index.stats();
        assert_eq!(stats.get("name"), Some(&Value::Str("users.email".into())));
        assert_eq!(stats.get("keyField"), Some(&Value::Str("email".into())));
        assert_eq!(stats.get("size"), Some(&Value::Int(1)));
    }
}

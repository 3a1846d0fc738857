//! LRU cache of parsed command templates, keyed by the raw query string.
//!
//! Hits hand back a clone, so a caller binding parameters into the
//! returned template can never mutate the cached copy. Bound commands are
//! never inserted; the cache only ever holds the template form the parser
//! produced.

use crate::command::Command;
use std::collections::HashMap;

pub const DEFAULT_QUERY_CACHE_CAPACITY: usize = 1000;

#[derive(Debug)]
struct CachedCommand {
    command: Command,
    last_used: u64,
}

#[derive(Debug)]
/// Fixed-capacity least-recently-used command cache.
pub struct QueryCache {
    entries: HashMap<String, CachedCommand>,
    counter: u64,
    capacity: usize,
}

impl Default for QueryCache {
    fn default() -> Self {
        QueryCache::new(DEFAULT_QUERY_CACHE_CAPACITY)
    }
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        QueryCache {
            entries: HashMap::new(),
            counter: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetch a template, refreshing its recency. The returned command is a
    /// clone the caller owns outright.
    pub fn get(&mut self, raw: &str) -> Option<Command> {
        let entry = self.entries.get_mut(raw)?;
        self.counter = self.counter.wrapping_add(1);
        entry.last_used = self.counter;
        Some(entry.command.clone())
    }

    /// Store a template, evicting least-recently-used entries until the
    /// cache fits its capacity.
    pub fn insert(&mut self, raw: impl Into<String>, command: Command) {
        if self.capacity == 0 {
            return;
        }
        self.counter = self.counter.wrapping_add(1);
        self.entries.insert(
            raw.into(),
            CachedCommand {
                command,
                last_used: self.counter,
            },
        );
        while self.entries.len() > self.capacity {
            let mut lru_key: Option<String> = None;
            let mut lru_used = u64::MAX;
            for (key, entry) in self.entries.iter() {
                if entry.last_used < lru_used {
                    lru_used = entry.last_used;
                    lru_key = Some(key.clone());
                }
            }
            match lru_key {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(table: &str) -> Command {
        Command::CreateTable {
            table: table.to_string(),
        }
    }

    #[test]
    fn eviction_removes_least_recently_used() {
        let mut cache = QueryCache::new(2);
        cache.insert("a", cmd("a"));
        cache.insert("b", cmd("b"));
        // touch "a" so "b" becomes the eviction victim
        assert!(cache.get("a").is_some());
        cache.insert("c", cmd("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn hit_returns_an_independent_clone() {
        let mut cache = QueryCache::new(4);
        cache.insert("q", cmd("t"));
        let mut first = cache.get("q").unwrap();
        if let Command::CreateTable { table } = &mut first {
            *table = "mutated".to_string();
        }
        // the cached template is untouched
        assert_eq!(cache.get("q"), Some(cmd("t")));
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let mut cache = QueryCache::new(0);
        cache.insert("q", cmd("t"));
        assert!(cache.is_empty());
    }
}

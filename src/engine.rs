//! Query executor and database handle.
//!
//! [`SawitDB`] is the unit of state: it owns the storage engine, the query
//! cache, and the event sink, and serializes every operation. The public
//! entry point is [`SawitDB::query`], which never panics past its dispatch:
//! every internal failure is converted to an `Error: `-prefixed message in
//! the returned output.

use crate::cache::QueryCache;
use crate::command::{
    compare_op, AggregateFunc, CmpOp, Command, Criteria, Having, JoinClause, JoinType, SortDir,
    SortSpec,
};
use crate::event::{EventSink, NoopSink};
use crate::index::FieldIndex;
use crate::record::{Record, Value};
use crate::storage::{StorageError, Store, INDEX_TABLE};
use crate::wal::{SyncMode, Wal, WalOp, WalRecord};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug)]
/// Top-level engine error; carries the message surfaced to the caller.
pub struct EngineError {
    message: String,
}

impl EngineError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EngineError {}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::new(err.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
/// Handle configuration.
pub struct Options {
    /// Attach the write-ahead log with this sync policy. `None` disables
    /// logging; the pager then writes through on every mutation.
    pub wal: Option<SyncMode>,
    /// Query-template cache capacity.
    pub query_cache_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            wal: None,
            query_cache_capacity: crate::cache::DEFAULT_QUERY_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a table is read.
pub enum ScanMethod {
    IndexLookup,
    FullTableScan,
}

impl ScanMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMethod::IndexLookup => "Index Lookup",
            ScanMethod::FullTableScan => "Full Table Scan",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One step of an EXPLAIN plan, in execution order.
pub enum PlanStep {
    Scan {
        table: String,
        method: ScanMethod,
    },
    Join {
        table: String,
        join_type: &'static str,
        method: &'static str,
    },
    Sort {
        key: String,
        dir: &'static str,
    },
    Offset {
        count: usize,
    },
    Limit {
        count: usize,
    },
    Project {
        cols: Vec<String>,
    },
    Distinct,
    Group {
        key: String,
    },
    Aggregate {
        func: &'static str,
        field: Option<String>,
    },
    Having {
        column: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
/// Structured query plan returned by EXPLAIN.
pub struct Plan {
    pub command: &'static str,
    pub table: String,
    pub steps: Vec<PlanStep>,
    /// Names of every available index on the involved tables.
    pub indexes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
/// Result of one `query()` call.
pub enum QueryOutput {
    /// Confirmation or error text. Errors are prefixed `Error: `.
    Message(String),
    /// SELECT result rows, or grouped aggregate rows.
    Rows(Vec<Record>),
    /// Ungrouped aggregate result: `{count|sum|avg|min|max, field?}`.
    Aggregate(Record),
    /// EXPLAIN plan.
    Plan(Plan),
}

impl QueryOutput {
    fn error(message: impl std::fmt::Display) -> Self {
        QueryOutput::Message(format!("Error: {}", message))
    }
}

/// Embedded single-file database handle.
pub struct SawitDB {
    store: Store,
    cache: QueryCache,
    events: Box<dyn EventSink>,
    closed: bool,
}

impl SawitDB {
    /// Open or create a database with default options (WAL disabled).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        Self::open_with(path, Options::default())
    }

    /// Open or create a database. Any non-empty sibling WAL left by a
    /// previous handle is replayed and truncated before the handle is
    /// usable, regardless of whether this handle enables logging.
    pub fn open_with(path: impl AsRef<Path>, options: Options) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let mut store = Store::open(path)?;

        // the system table is created lazily on first open
        if store.find_table(INDEX_TABLE)?.is_none() {
            store.create_table(INDEX_TABLE, true)?;
        }

        // index definitions persist as rows; contents rebuild by scan
        let definitions = store.scan(INDEX_TABLE, None, None)?;
        for row in &definitions {
            let (Some(Value::Str(table)), Some(Value::Str(field))) =
                (row.get("table"), row.get("field"))
            else {
                warn!("skipping malformed _indexes row");
                continue;
            };
            if store.find_table(table)?.is_some() {
                store.register_index(table, field);
            }
        }
        let defs: Vec<(String, String)> = store
            .all_indexes()
            .iter()
            .map(|idx| (idx.table().to_string(), idx.field().to_string()))
            .collect();
        for (table, field) in defs {
            store.rebuild_index(&table, &field)?;
        }

        let replayed = Wal::replay(path).map_err(|e| EngineError::new(e.to_string()))?;
        if !replayed.is_empty() {
            info!(records = replayed.len(), "replaying write-ahead log");
            for record in replayed {
                apply_wal_record(&mut store, record);
            }
            store.clear_caches();
        }
        store.truncate_sibling_wal()?;

        if let Some(sync) = options.wal {
            let wal = Wal::open(path, sync).map_err(|e| EngineError::new(e.to_string()))?;
            store.attach_wal(wal);
        }

        Ok(SawitDB {
            store,
            cache: QueryCache::new(options.query_cache_capacity),
            events: Box::new(NoopSink),
            closed: false,
        })
    }

    /// Install the post-commit event sink.
    pub fn set_event_sink(&mut self, sink: Box<dyn EventSink>) {
        self.events = sink;
    }

    /// The handle's query-template cache, for the parser collaborator.
    pub fn query_cache(&mut self) -> &mut QueryCache {
        &mut self.cache
    }

    /// Checkpoint and invalidate the handle. Further queries fail with
    /// `Error: handle closed`.
    pub fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.store.commit()?;
        self.store.checkpoint()?;
        self.closed = true;
        Ok(())
    }

    /// Execute one command. Effects are visible atomically when this
    /// returns; errors come back as `Error: `-prefixed messages and never
    /// as panics.
    pub fn query(&mut self, command: Command, raw_query: &str) -> QueryOutput {
        if self.closed {
            return QueryOutput::error("handle closed");
        }
        let output = match self.execute(command, raw_query) {
            Ok(output) => output,
            Err(err) => return QueryOutput::error(err),
        };
        if let Err(err) = self.store.commit() {
            return QueryOutput::error(err);
        }
        output
    }

    fn execute(&mut self, command: Command, raw: &str) -> Result<QueryOutput, EngineError> {
        match command {
            Command::Error { message } => Err(EngineError::new(message)),
            Command::CreateTable { table } => self.create_table(&table, raw),
            Command::ShowTables => self.show_tables(),
            Command::ShowIndexes { table } => Ok(self.show_indexes(table.as_deref())),
            Command::Insert { table, rows } => self.insert(&table, rows, raw),
            Command::Select {
                table,
                cols,
                criteria,
                sort,
                limit,
                offset,
                joins,
                distinct,
            } => {
                let rows = self.run_select(
                    &table,
                    &cols,
                    criteria.as_ref(),
                    sort.as_ref(),
                    limit,
                    offset,
                    &joins,
                    distinct,
                )?;
                self.notify(|sink| sink.on_select(&table, &rows, raw));
                Ok(QueryOutput::Rows(rows))
            }
            Command::Delete { table, criteria } => self.delete(&table, criteria.as_ref(), raw),
            Command::Update {
                table,
                updates,
                criteria,
            } => self.update(&table, &updates, criteria.as_ref(), raw),
            Command::DropTable { table } => self.drop_table(&table, raw),
            Command::CreateIndex { table, field } => self.create_index(&table, &field),
            Command::Aggregate {
                table,
                func,
                field,
                criteria,
                group_by,
                having,
            } => self.run_aggregate(
                &table,
                func,
                field.as_deref(),
                criteria.as_ref(),
                group_by.as_deref(),
                having.as_ref(),
            ),
            Command::Explain(inner) => Ok(QueryOutput::Plan(self.build_plan(&inner)?)),
        }
    }

    // ── DDL / DML ──────────────────────────────────────────────────────

    fn create_table(&mut self, table: &str, raw: &str) -> Result<QueryOutput, EngineError> {
        if self.store.find_table(table)?.is_some() {
            // existing table is informational, not an error
            return Ok(QueryOutput::Message(format!(
                "Table '{}' already exists",
                table
            )));
        }
        let entry = self.store.create_table(table, false)?;
        self.notify(|sink| sink.on_table_created(table, &entry, raw));
        Ok(QueryOutput::Message(format!("Table '{}' created", table)))
    }

    fn drop_table(&mut self, table: &str, raw: &str) -> Result<QueryOutput, EngineError> {
        if table == INDEX_TABLE {
            return Err(EngineError::new(format!(
                "cannot drop system table '{}'",
                INDEX_TABLE
            )));
        }
        if self.store.find_table(table)?.is_none() {
            return Ok(QueryOutput::Message(format!(
                "Table '{}' does not exist",
                table
            )));
        }
        let entry = self.store.drop_table(table)?;
        self.store.drop_indexes_for_table(table)?;
        self.notify(|sink| sink.on_table_dropped(table, &entry, raw));
        Ok(QueryOutput::Message(format!("Table '{}' dropped", table)))
    }

    fn show_tables(&self) -> Result<QueryOutput, EngineError> {
        let rows = self
            .store
            .list_tables()?
            .into_iter()
            .filter(|entry| !entry.name.starts_with('_'))
            .map(|entry| Record::from_pairs([("name", Value::Str(entry.name))]))
            .collect();
        Ok(QueryOutput::Rows(rows))
    }

    fn show_indexes(&self, table: Option<&str>) -> QueryOutput {
        let rows = self
            .store
            .all_indexes()
            .iter()
            .filter(|index| table.map(|t| index.table() == t).unwrap_or(true))
            .map(FieldIndex::stats)
            .collect();
        QueryOutput::Rows(rows)
    }

    fn insert(
        &mut self,
        table: &str,
        rows: Vec<Record>,
        raw: &str,
    ) -> Result<QueryOutput, EngineError> {
        if rows.is_empty() || rows.iter().any(Record::is_empty) {
            return Err(EngineError::new("cannot insert an empty record"));
        }
        let count = self.store.insert_many(table, &rows)?;
        self.notify(|sink| sink.on_insert(table, &rows, raw));
        Ok(QueryOutput::Message(format!(
            "Inserted {} record(s) into '{}'",
            count, table
        )))
    }

    fn delete(
        &mut self,
        table: &str,
        criteria: Option<&Criteria>,
        raw: &str,
    ) -> Result<QueryOutput, EngineError> {
        let deleted = self.store.delete_matching(table, criteria)?;
        self.notify(|sink| sink.on_delete(table, &deleted, raw));
        Ok(QueryOutput::Message(format!(
            "Deleted {} record(s) from '{}'",
            deleted.len(),
            table
        )))
    }

    fn update(
        &mut self,
        table: &str,
        updates: &Record,
        criteria: Option<&Criteria>,
        raw: &str,
    ) -> Result<QueryOutput, EngineError> {
        self.store.find_table(table)?.ok_or_else(|| {
            EngineError::new(StorageError::TableMissing(table.to_string()).to_string())
        })?;
        let updated = self.store.update_matching(table, updates, criteria)?;
        self.notify(|sink| sink.on_update(table, &updated, raw));
        Ok(QueryOutput::Message(format!(
            "Updated {} record(s) in '{}'",
            updated.len(),
            table
        )))
    }

    fn create_index(&mut self, table: &str, field: &str) -> Result<QueryOutput, EngineError> {
        let created = self.store.create_index(table, field)?;
        if created {
            Ok(QueryOutput::Message(format!(
                "Index created on '{}.{}'",
                table, field
            )))
        } else {
            Ok(QueryOutput::Message(format!(
                "Index on '{}.{}' already exists",
                table, field
            )))
        }
    }

    // ── SELECT pipeline ────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn run_select(
        &self,
        table: &str,
        cols: &[String],
        criteria: Option<&Criteria>,
        sort: Option<&SortSpec>,
        limit: Option<usize>,
        offset: Option<usize>,
        joins: &[JoinClause],
        distinct: bool,
    ) -> Result<Vec<Record>, EngineError> {
        let mut rows = if joins.is_empty() {
            match self.pick_index(table, criteria, sort) {
                Some((index, key)) => index.search(key),
                None => {
                    // limit can push down only when no sort reorders rows
                    let pushdown = match sort {
                        None => limit.map(|l| l + offset.unwrap_or(0)),
                        Some(_) => None,
                    };
                    self.store.scan(table, criteria, pushdown)?
                }
            }
        } else {
            let mut rows = self.scan_aliased(table)?;
            for join in joins {
                rows = self.apply_join(rows, join)?;
            }
            if let Some(tree) = criteria {
                rows.retain(|row| tree.matches(row));
            }
            rows
        };

        if let Some(spec) = sort {
            sort_records(&mut rows, spec);
        }
        let skip = offset.unwrap_or(0);
        if skip > 0 {
            rows.drain(..skip.min(rows.len()));
        }
        if let Some(limit) = limit {
            rows.truncate(limit);
        }

        let mut rows = project(rows, cols);
        if distinct {
            let mut seen = HashSet::new();
            rows.retain(|row| seen.insert(row.to_json_string()));
        }
        Ok(rows)
    }

    /// The index probe decision: a single top-level equality on an indexed
    /// field, with no ORDER BY. EXPLAIN calls the same function, so the
    /// reported method always matches the executed one.
    fn pick_index<'a>(
        &'a self,
        table: &str,
        criteria: Option<&'a Criteria>,
        sort: Option<&SortSpec>,
    ) -> Option<(&'a FieldIndex, &'a Value)> {
        if sort.is_some() {
            return None;
        }
        let (field, value) = criteria?.as_equality()?;
        let index = self.store.index_on(table, field)?;
        Some((index, value))
    }

    /// Full scan with every column additionally aliased as `table.column`.
    fn scan_aliased(&self, table: &str) -> Result<Vec<Record>, EngineError> {
        let rows = self.store.scan(table, None, None)?;
        Ok(rows
            .into_iter()
            .map(|row| alias_record(table, &row))
            .collect())
    }

    fn apply_join(
        &self,
        left_rows: Vec<Record>,
        join: &JoinClause,
    ) -> Result<Vec<Record>, EngineError> {
        let right_rows = self.scan_aliased(&join.table)?;
        let left_fields = field_union(&left_rows);
        let right_fields = field_union(&right_rows);

        match join.join_type {
            JoinType::Cross => {
                let mut out = Vec::with_capacity(left_rows.len() * right_rows.len());
                for left in &left_rows {
                    for right in &right_rows {
                        out.push(combine(left, right));
                    }
                }
                Ok(out)
            }
            JoinType::Inner | JoinType::Left | JoinType::Full => {
                let on = join
                    .on
                    .as_ref()
                    .ok_or_else(|| EngineError::new("join requires an ON clause"))?;
                let mut out = Vec::new();
                let mut right_matched = vec![false; right_rows.len()];

                if on.op == CmpOp::Eq {
                    // hash join: build on the right side's join column
                    let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();
                    for (idx, right) in right_rows.iter().enumerate() {
                        if let Some(value) = right.get(&on.right) {
                            if *value != Value::Null {
                                buckets.entry(value.key_string()).or_default().push(idx);
                            }
                        }
                    }
                    for left in &left_rows {
                        let matches = left
                            .get(&on.left)
                            .filter(|value| **value != Value::Null)
                            .and_then(|value| buckets.get(&value.key_string()));
                        match matches {
                            Some(indices) => {
                                for &idx in indices {
                                    right_matched[idx] = true;
                                    out.push(combine(left, &right_rows[idx]));
                                }
                            }
                            None => {
                                if join.join_type != JoinType::Inner {
                                    out.push(pad_right(left, &right_fields));
                                }
                            }
                        }
                    }
                } else {
                    for left in &left_rows {
                        let mut matched = false;
                        for (idx, right) in right_rows.iter().enumerate() {
                            if on_matches(on, left, right) {
                                matched = true;
                                right_matched[idx] = true;
                                out.push(combine(left, right));
                            }
                        }
                        if !matched && join.join_type != JoinType::Inner {
                            out.push(pad_right(left, &right_fields));
                        }
                    }
                }

                if join.join_type == JoinType::Full {
                    for (idx, right) in right_rows.iter().enumerate() {
                        if !right_matched[idx] {
                            out.push(pad_left(&left_fields, right));
                        }
                    }
                }
                Ok(out)
            }
            JoinType::Right => {
                let on = join
                    .on
                    .as_ref()
                    .ok_or_else(|| EngineError::new("join requires an ON clause"))?;
                let mut out = Vec::new();

                if on.op == CmpOp::Eq {
                    // symmetric: hash the left side, drive from the right
                    let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();
                    for (idx, left) in left_rows.iter().enumerate() {
                        if let Some(value) = left.get(&on.left) {
                            if *value != Value::Null {
                                buckets.entry(value.key_string()).or_default().push(idx);
                            }
                        }
                    }
                    for right in &right_rows {
                        let matches = right
                            .get(&on.right)
                            .filter(|value| **value != Value::Null)
                            .and_then(|value| buckets.get(&value.key_string()));
                        match matches {
                            Some(indices) => {
                                for &idx in indices {
                                    out.push(combine(&left_rows[idx], right));
                                }
                            }
                            None => out.push(pad_left(&left_fields, right)),
                        }
                    }
                } else {
                    for right in &right_rows {
                        let mut matched = false;
                        for left in &left_rows {
                            if on_matches(on, left, right) {
                                matched = true;
                                out.push(combine(left, right));
                            }
                        }
                        if !matched {
                            out.push(pad_left(&left_fields, right));
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    // ── Aggregation ────────────────────────────────────────────────────

    fn run_aggregate(
        &self,
        table: &str,
        func: AggregateFunc,
        field: Option<&str>,
        criteria: Option<&Criteria>,
        group_by: Option<&str>,
        having: Option<&Having>,
    ) -> Result<QueryOutput, EngineError> {
        let rows = self.store.scan(table, criteria, None)?;

        let Some(group_key) = group_by else {
            let value = compute_aggregate(&rows, func, field);
            let mut result = Record::new();
            result.insert(func.column(), value);
            if let Some(field) = field {
                result.insert("field", Value::Str(field.to_string()));
            }
            return Ok(QueryOutput::Aggregate(result));
        };

        // bucket on the stringified group key, first-seen order
        let mut order: Vec<String> = Vec::new();
        let mut buckets: HashMap<String, (Value, Vec<Record>)> = HashMap::new();
        for row in rows {
            let key_value = row.get(group_key).cloned().unwrap_or(Value::Null);
            let key = key_value.key_string();
            if !buckets.contains_key(&key) {
                order.push(key.clone());
            }
            buckets.entry(key).or_insert_with(|| (key_value, Vec::new())).1.push(row);
        }

        let mut out = Vec::new();
        for key in order {
            let (key_value, bucket) = buckets.remove(&key).unwrap_or((Value::Null, Vec::new()));
            if let Some(having) = having {
                let aggregated = aggregate_by_name(&bucket, &having.key, field);
                if !compare_op(having.op, &aggregated, &having.val) {
                    continue;
                }
            }
            let mut row = Record::new();
            row.insert(group_key, key_value);
            row.insert(func.column(), compute_aggregate(&bucket, func, field));
            out.push(row);
        }
        Ok(QueryOutput::Rows(out))
    }

    // ── EXPLAIN ────────────────────────────────────────────────────────

    fn build_plan(&self, inner: &Command) -> Result<Plan, EngineError> {
        match inner {
            Command::Select {
                table,
                cols,
                criteria,
                sort,
                limit,
                offset,
                joins,
                distinct,
            } => {
                let mut steps = Vec::new();
                let method = if joins.is_empty()
                    && self
                        .pick_index(table, criteria.as_ref(), sort.as_ref())
                        .is_some()
                {
                    ScanMethod::IndexLookup
                } else {
                    ScanMethod::FullTableScan
                };
                steps.push(PlanStep::Scan {
                    table: table.clone(),
                    method,
                });
                for join in joins {
                    let method = match (&join.join_type, &join.on) {
                        (JoinType::Cross, _) => "Nested Loop",
                        (_, Some(on)) if on.op == CmpOp::Eq => "Hash Join",
                        _ => "Nested Loop",
                    };
                    steps.push(PlanStep::Join {
                        table: join.table.clone(),
                        join_type: join.join_type.as_str(),
                        method,
                    });
                }
                if let Some(spec) = sort {
                    steps.push(PlanStep::Sort {
                        key: spec.key.clone(),
                        dir: match spec.dir {
                            SortDir::Asc => "asc",
                            SortDir::Desc => "desc",
                        },
                    });
                }
                if let Some(offset) = offset {
                    steps.push(PlanStep::Offset { count: *offset });
                }
                if let Some(limit) = limit {
                    steps.push(PlanStep::Limit { count: *limit });
                }
                steps.push(PlanStep::Project { cols: cols.to_vec() });
                if *distinct {
                    steps.push(PlanStep::Distinct);
                }

                let mut indexes = self.index_names(table);
                for join in joins {
                    indexes.extend(self.index_names(&join.table));
                }
                Ok(Plan {
                    command: "SELECT",
                    table: table.clone(),
                    steps,
                    indexes,
                })
            }
            Command::Aggregate {
                table,
                func,
                field,
                group_by,
                having,
                ..
            } => {
                let mut steps = vec![PlanStep::Scan {
                    table: table.clone(),
                    method: ScanMethod::FullTableScan,
                }];
                if let Some(key) = group_by {
                    steps.push(PlanStep::Group { key: key.clone() });
                }
                steps.push(PlanStep::Aggregate {
                    func: func.as_str(),
                    field: field.clone(),
                });
                if let Some(having) = having {
                    steps.push(PlanStep::Having {
                        column: having.key.clone(),
                    });
                }
                Ok(Plan {
                    command: "AGGREGATE",
                    table: table.clone(),
                    steps,
                    indexes: self.index_names(table),
                })
            }
            Command::Explain(nested) => self.build_plan(nested),
            _ => Err(EngineError::new(
                "EXPLAIN supports SELECT and AGGREGATE commands",
            )),
        }
    }

    fn index_names(&self, table: &str) -> Vec<String> {
        self.store
            .indexes_for_table(table)
            .iter()
            .map(|index| index.name())
            .collect()
    }

    /// Run a hook, shielding the committed mutation from a panicking sink.
    fn notify(&self, f: impl FnOnce(&dyn EventSink)) {
        let sink = self.events.as_ref();
        if catch_unwind(AssertUnwindSafe(|| f(sink))).is_err() {
            warn!("event hook panicked; the mutation is already committed");
        }
    }
}

impl Drop for SawitDB {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                warn!(%err, "checkpoint on drop failed");
            }
        }
    }
}

/// Replay one logical operation against the store. Application failures
/// are logged and skipped so recovery always reaches the log tail.
fn apply_wal_record(store: &mut Store, record: WalRecord) {
    let WalRecord { seq, table, op } = record;
    let outcome: Result<(), StorageError> = (|| {
        match op {
            WalOp::CreateTable => {
                if store.find_table(&table)?.is_none() {
                    store.create_table(&table, true)?;
                }
            }
            WalOp::DropTable => {
                if store.find_table(&table)?.is_some() {
                    store.drop_table(&table)?;
                }
            }
            WalOp::Insert { row } => {
                store.insert_many(&table, std::slice::from_ref(&row))?;
            }
            WalOp::Update { old, new } => {
                if store.delete_exact(&table, &old)? {
                    store.insert_many(&table, std::slice::from_ref(&new))?;
                } else {
                    warn!(seq, %table, "update pre-image not found during replay");
                }
            }
            WalOp::Delete { old } => {
                store.delete_exact(&table, &old)?;
            }
            WalOp::CreateIndex { field } => {
                if store.index_on(&table, &field).is_none() {
                    store.register_index(&table, &field);
                    store.rebuild_index(&table, &field)?;
                }
            }
        }
        Ok(())
    })();
    if let Err(err) = outcome {
        warn!(seq, %err, "skipping unapplicable wal record");
    }
}

// ── Row composition ────────────────────────────────────────────────────

/// Duplicate every column under its qualified `table.column` name; WHERE
/// and projection may reference either form.
fn alias_record(table: &str, row: &Record) -> Record {
    let mut aliased = row.clone();
    for (name, value) in row.iter() {
        aliased.insert(format!("{}.{}", table, name), value.clone());
    }
    aliased
}

/// Joined row: left fields then right fields, right winning bare-name
/// collisions.
fn combine(left: &Record, right: &Record) -> Record {
    let mut out = left.clone();
    for (name, value) in right.iter() {
        out.insert(name, value.clone());
    }
    out
}

/// Left row with every right-side column null (unmatched LEFT/FULL row).
/// Bare-name collisions resolve right-side-wins, exactly as matched rows
/// do in [`combine`]; the left value stays reachable under its qualified
/// name.
fn pad_right(left: &Record, right_fields: &[String]) -> Record {
    let mut out = left.clone();
    for name in right_fields {
        out.insert(name.clone(), Value::Null);
    }
    out
}

/// Right row with every left-side column null (unmatched RIGHT/FULL row).
fn pad_left(left_fields: &[String], right: &Record) -> Record {
    let mut out = Record::new();
    for name in left_fields {
        out.insert(name.clone(), Value::Null);
    }
    for (name, value) in right.iter() {
        out.insert(name, value.clone());
    }
    out
}

/// Union of field names across rows, first-seen order.
fn field_union(rows: &[Record]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        for name in row.field_names() {
            if seen.insert(name.to_string()) {
                out.push(name.to_string());
            }
        }
    }
    out
}

fn on_matches(on: &crate::command::OnClause, left: &Record, right: &Record) -> bool {
    let (Some(lval), Some(rval)) = (left.get(&on.left), right.get(&on.right)) else {
        return false;
    };
    compare_op(on.op, lval, rval)
}

/// Stable sort on one key; a missing field sorts as null.
fn sort_records(rows: &mut [Record], spec: &SortSpec) {
    rows.sort_by(|a, b| {
        let left = a.get(&spec.key).unwrap_or(&Value::Null);
        let right = b.get(&spec.key).unwrap_or(&Value::Null);
        let ordering = left.total_cmp(right);
        match spec.dir {
            SortDir::Asc => ordering,
            SortDir::Desc => ordering.reverse(),
        }
    });
}

/// Column projection: `*` (or no columns) keeps the full row; explicit
/// columns fill missing fields with null.
fn project(rows: Vec<Record>, cols: &[String]) -> Vec<Record> {
    if cols.is_empty() || cols.iter().any(|c| c == "*") {
        return rows;
    }
    rows.into_iter()
        .map(|row| {
            let mut projected = Record::new();
            for col in cols {
                projected.insert(col.clone(), row.get(col).cloned().unwrap_or(Value::Null));
            }
            projected
        })
        .collect()
}

// ── Aggregate math ─────────────────────────────────────────────────────

/// A whole result collapses to an integer, mirroring how the values were
/// coerced in.
fn number_value(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Int(n as i64)
    } else {
        Value::Float(n)
    }
}

fn field_number(row: &Record, field: Option<&str>) -> Option<f64> {
    let field = field?;
    row.get(field).and_then(Value::as_number)
}

fn compute_aggregate(rows: &[Record], func: AggregateFunc, field: Option<&str>) -> Value {
    match func {
        AggregateFunc::Count => match field {
            // COUNT(field) counts present, non-null values; COUNT(*) counts rows
            Some(field) => Value::Int(
                rows.iter()
                    .filter(|row| matches!(row.get(field), Some(v) if *v != Value::Null))
                    .count() as i64,
            ),
            None => Value::Int(rows.len() as i64),
        },
        AggregateFunc::Sum => {
            let sum: f64 = rows
                .iter()
                .map(|row| field_number(row, field).unwrap_or(0.0))
                .sum();
            number_value(sum)
        }
        AggregateFunc::Avg => {
            if rows.is_empty() {
                return Value::Null;
            }
            let sum: f64 = rows
                .iter()
                .map(|row| field_number(row, field).unwrap_or(0.0))
                .sum();
            number_value(sum / rows.len() as f64)
        }
        AggregateFunc::Min => rows
            .iter()
            .filter_map(|row| field_number(row, field))
            .min_by(|a, b| a.total_cmp(b))
            .map(number_value)
            .unwrap_or(Value::Null),
        AggregateFunc::Max => rows
            .iter()
            .filter_map(|row| field_number(row, field))
            .max_by(|a, b| a.total_cmp(b))
            .map(number_value)
            .unwrap_or(Value::Null),
    }
}

/// HAVING references an aggregated column by name.
fn aggregate_by_name(rows: &[Record], name: &str, field: Option<&str>) -> Value {
    let func = match name {
        "count" => AggregateFunc::Count,
        "sum" => AggregateFunc::Sum,
        "avg" => AggregateFunc::Avg,
        "min" => AggregateFunc::Min,
        "max" => AggregateFunc::Max,
        _ => return Value::Null,
    };
    // HAVING count compares row counts even when the aggregate targets a field
    let field = if func == AggregateFunc::Count {
        None
    } else {
        field
    };
    compute_aggregate(rows, func, field)
}

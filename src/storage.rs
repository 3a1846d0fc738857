//! Storage engine: paged file, catalog, and heap-file operations.
//!
//! The storage layer owns the single database file. Page 0 is the catalog;
//! every other page is a heap-data page belonging to some table's linked
//! list. The [`Store`] binds the pager, the write-ahead log, and the
//! in-memory secondary indexes so heap mutations and index state move in
//! lockstep.
//!
//! # Examples
//! ```no_run
//! use sawitdb::storage::Store;
//!
//! let store = Store::open("app.db").unwrap();
//! assert!(store.find_table("missing").unwrap().is_none());
//! ```

use crate::command::{CmpOp, Condition, Criteria, Operand};
use crate::index::FieldIndex;
use crate::record::{Record, Value};
use crate::wal::{Wal, WalError, WalOp};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Fixed unit of I/O.
pub const PAGE_SIZE: usize = 4096;
const CATALOG_PAGE_ID: u32 = 0;
const MAGIC: [u8; 4] = *b"WOWO";
const TOTAL_PAGES_OFFSET: usize = 4;
const NUM_TABLES_OFFSET: usize = 8;
const CATALOG_HEADER_LEN: usize = 12;
const CATALOG_ENTRY_LEN: usize = 40;
const TABLE_NAME_LEN: usize = 32;
/// Catalog capacity: ⌊(4096 − 12) / 40⌋ entries.
pub const MAX_TABLES: usize = (PAGE_SIZE - CATALOG_HEADER_LEN) / CATALOG_ENTRY_LEN;

const HEAP_NEXT_OFFSET: usize = 0;
const HEAP_COUNT_OFFSET: usize = 4;
const HEAP_FREE_OFFSET: usize = 6;
const HEAP_HEADER_LEN: usize = 8;
/// Largest serialized record a single page can hold (length prefix excluded).
pub const MAX_RECORD_LEN: usize = PAGE_SIZE - HEAP_HEADER_LEN - 2;

/// System table recording index definitions as `{table, field}` rows.
pub const INDEX_TABLE: &str = "_indexes";

const RESERVED_NAMES: [&str; 6] = ["_indexes", "_system", "_schema", "null", "true", "false"];

const OBJECT_CACHE_CAPACITY: usize = 64;

#[derive(Debug)]
/// Errors produced by the storage engine.
pub enum StorageError {
    /// Underlying I/O error.
    Io(std::io::Error),
    /// Corruption detected in stored data.
    Corrupt(String),
    /// Identifier failed the name whitelist or hit the reserved set.
    NameInvalid(String),
    /// Catalog lookup failed.
    TableMissing(String),
    /// Page 0 has no free catalog slot.
    CatalogFull,
    /// A single record exceeds the page payload capacity.
    RecordTooLarge(usize),
    /// Invalid request or format.
    Invalid(String),
    /// Write-ahead log failure.
    Wal(WalError),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(err) => write!(f, "io error: {}", err),
            StorageError::Corrupt(msg) => write!(f, "corrupt storage: {}", msg),
            StorageError::NameInvalid(name) => write!(f, "invalid name: '{}'", name),
            StorageError::TableMissing(name) => write!(f, "table not found: '{}'", name),
            StorageError::CatalogFull => write!(f, "catalog is full ({} tables)", MAX_TABLES),
            StorageError::RecordTooLarge(len) => {
                write!(f, "record of {} bytes exceeds page capacity", len)
            }
            StorageError::Invalid(msg) => write!(f, "invalid storage: {}", msg),
            StorageError::Wal(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<WalError> for StorageError {
    fn from(err: WalError) -> Self {
        StorageError::Wal(err)
    }
}

/// Character whitelist: `[A-Za-z_][A-Za-z0-9_]{0,31}`.
pub fn is_valid_identifier(name: &str) -> bool {
    if name.is_empty() || name.len() > TABLE_NAME_LEN {
        return false;
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate a user-supplied table name: whitelist plus the reserved set.
/// Internal (engine-created) names skip the reserved set.
pub fn validate_user_table_name(name: &str) -> Result<(), StorageError> {
    if !is_valid_identifier(name) || RESERVED_NAMES.contains(&name) {
        return Err(StorageError::NameInvalid(name.to_string()));
    }
    Ok(())
}

/// Validate a column/field identifier.
pub fn validate_field_name(name: &str) -> Result<(), StorageError> {
    if !is_valid_identifier(name) {
        return Err(StorageError::NameInvalid(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
/// One 40-byte catalog slot on page 0.
pub struct CatalogEntry {
    pub name: String,
    pub start_page: u32,
    pub last_page: u32,
}

#[derive(Debug, Clone)]
/// Decoded heap page held by the read-through object cache.
pub struct PageObjects {
    pub next: u32,
    pub records: Vec<Record>,
}

#[derive(Debug)]
struct CachedObjects {
    objects: PageObjects,
    last_used: u64,
}

/// LRU cache of decoded heap pages, keyed by page id. Entries are
/// invalidated by any write to the same page.
#[derive(Debug, Default)]
struct ObjectCache {
    pages: HashMap<u32, CachedObjects>,
    counter: u64,
}

impl ObjectCache {
    fn get(&mut self, page_id: u32) -> Option<PageObjects> {
        let entry = self.pages.get_mut(&page_id)?;
        self.counter = self.counter.wrapping_add(1);
        entry.last_used = self.counter;
        Some(entry.objects.clone())
    }

    fn insert(&mut self, page_id: u32, objects: PageObjects) {
        if self.pages.len() >= OBJECT_CACHE_CAPACITY && !self.pages.contains_key(&page_id) {
            let mut lru_id = None;
            let mut lru_used = u64::MAX;
            for (id, entry) in self.pages.iter() {
                if entry.last_used < lru_used {
                    lru_used = entry.last_used;
                    lru_id = Some(*id);
                }
            }
            if let Some(id) = lru_id {
                self.pages.remove(&id);
            }
        }
        self.counter = self.counter.wrapping_add(1);
        self.pages.insert(
            page_id,
            CachedObjects {
                objects,
                last_used: self.counter,
            },
        );
    }

    fn invalidate(&mut self, page_id: u32) {
        self.pages.remove(&page_id);
    }

    fn clear(&mut self) {
        self.pages.clear();
    }
}

/// Owns the database file descriptor and all page-level I/O.
///
/// With a WAL attached the pager runs write-back: dirty pages are pinned
/// in memory and only reach the file at a checkpoint, so no page write can
/// become durable ahead of its WAL record. Without a WAL every write goes
/// straight through with a best-effort sync.
pub struct Pager {
    file: File,
    path: PathBuf,
    write_back: bool,
    dirty: HashMap<u32, Vec<u8>>,
    objects: RefCell<ObjectCache>,
}

impl Pager {
    /// Open the database file, creating and initializing page 0 when the
    /// file is absent or empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len < PAGE_SIZE as u64 {
            let mut page = vec![0u8; PAGE_SIZE];
            page[..4].copy_from_slice(&MAGIC);
            write_u32(&mut page, TOTAL_PAGES_OFFSET, 1);
            write_u32(&mut page, NUM_TABLES_OFFSET, 0);
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&page)?;
            file.sync_all().ok();
        } else {
            let mut head = [0u8; 4];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut head)?;
            if head != MAGIC {
                return Err(StorageError::Corrupt("bad magic on page 0".to_string()));
            }
        }

        Ok(Pager {
            file,
            path,
            write_back: false,
            dirty: HashMap::new(),
            objects: RefCell::new(ObjectCache::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Switch between write-through and write-back (WAL-attached) modes.
    pub fn set_write_back(&mut self, on: bool) {
        self.write_back = on;
    }

    /// Read one page as a 4 KiB buffer.
    pub fn read_page(&self, id: u32) -> Result<Vec<u8>, StorageError> {
        if self.write_back {
            if let Some(page) = self.dirty.get(&id) {
                return Ok(page.clone());
            }
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(id as u64 * PAGE_SIZE as u64))?;
        file.read_exact(&mut buf)
            .map_err(|_| StorageError::Corrupt(format!("missing page {}", id)))?;
        Ok(buf)
    }

    /// Write exactly one page. Write-through mode forces durability with a
    /// best-effort sync; a failing sync is non-fatal.
    pub fn write_page(&mut self, id: u32, data: &[u8]) -> Result<(), StorageError> {
        if data.len() != PAGE_SIZE {
            return Err(StorageError::Invalid(format!(
                "page write of {} bytes",
                data.len()
            )));
        }
        self.objects.borrow_mut().invalidate(id);
        if self.write_back {
            self.dirty.insert(id, data.to_vec());
            return Ok(());
        }
        self.file
            .seek(SeekFrom::Start(id as u64 * PAGE_SIZE as u64))?;
        self.file.write_all(data)?;
        self.file.sync_data().ok();
        Ok(())
    }

    /// Allocate a fresh heap page: bump `total_pages` on page 0 and write
    /// an empty heap page at the new id.
    pub fn alloc_page(&mut self) -> Result<u32, StorageError> {
        let mut catalog = self.read_page(CATALOG_PAGE_ID)?;
        let new_id = read_u32(&catalog, TOTAL_PAGES_OFFSET);
        write_u32(&mut catalog, TOTAL_PAGES_OFFSET, new_id + 1);
        self.write_page(CATALOG_PAGE_ID, &catalog)?;
        self.write_page(new_id, &init_heap_page())?;
        debug!(page = new_id, "allocated heap page");
        Ok(new_id)
    }

    /// Pages the file logically contains, per page 0. Bytes beyond this
    /// count are ignored.
    pub fn total_pages(&self) -> Result<u32, StorageError> {
        let catalog = self.read_page(CATALOG_PAGE_ID)?;
        Ok(read_u32(&catalog, TOTAL_PAGES_OFFSET))
    }

    /// Read-through cache of decoded heap pages, for hot scans. Corrupt
    /// records are skipped with a warning.
    pub fn read_page_objects(&self, id: u32) -> Result<PageObjects, StorageError> {
        if let Some(objects) = self.objects.borrow_mut().get(id) {
            return Ok(objects);
        }
        let page = self.read_page(id)?;
        let records = heap_items(&page)
            .into_iter()
            .filter_map(|item| item.record)
            .collect();
        let objects = PageObjects {
            next: read_u32(&page, HEAP_NEXT_OFFSET),
            records,
        };
        self.objects.borrow_mut().insert(id, objects.clone());
        Ok(objects)
    }

    /// Flush write-back pages to the file and sync. A checkpoint makes all
    /// logged operations durable in page form.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let mut ids: Vec<u32> = self.dirty.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let data = self.dirty.remove(&id).unwrap_or_default();
            self.file
                .seek(SeekFrom::Start(id as u64 * PAGE_SIZE as u64))?;
            self.file.write_all(&data)?;
        }
        self.file.sync_all().ok();
        Ok(())
    }

    fn clear_caches(&mut self) {
        self.objects.borrow_mut().clear();
    }
}

/// One record slot on a heap page: the raw length-prefixed bytes plus the
/// decoded form (`None` when the body is not valid JSON).
struct HeapItem {
    bytes: Vec<u8>,
    record: Option<Record>,
}

/// Length-prefixed slot for a serialized record body.
fn record_slot(body: &[u8]) -> Vec<u8> {
    let mut slot = Vec::with_capacity(2 + body.len());
    slot.extend_from_slice(&(body.len() as u16).to_le_bytes());
    slot.extend_from_slice(body);
    slot
}

/// Storage engine: pager, WAL, catalog access, heap-file operations, and
/// the in-memory index registry.
pub struct Store {
    pager: Pager,
    wal: Option<Wal>,
    logging: bool,
    indexes: Vec<FieldIndex>,
}

impl Store {
    /// Open (or create) the database file. A WAL, if any, is attached
    /// separately after recovery.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Store {
            pager: Pager::open(path)?,
            wal: None,
            logging: false,
            indexes: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.pager.path()
    }

    /// Attach an opened WAL; subsequent mutations are logged before their
    /// page writes and the pager switches to write-back.
    pub fn attach_wal(&mut self, wal: Wal) {
        self.pager.set_write_back(true);
        self.wal = Some(wal);
        self.logging = true;
    }

    pub fn has_wal(&self) -> bool {
        self.wal.is_some()
    }

    /// Commit boundary: sync pending WAL appends per the sync policy.
    pub fn commit(&mut self) -> Result<(), StorageError> {
        if let Some(wal) = self.wal.as_mut() {
            wal.commit()?;
        }
        Ok(())
    }

    /// Checkpoint: flush write-back pages, then truncate the WAL.
    pub fn checkpoint(&mut self) -> Result<(), StorageError> {
        self.pager.flush()?;
        if let Some(wal) = self.wal.as_mut() {
            wal.reset()?;
        }
        Ok(())
    }

    /// Truncate a sibling WAL file when no handle is attached (after
    /// replaying into a database that keeps the WAL disabled).
    pub fn truncate_sibling_wal(&mut self) -> Result<(), StorageError> {
        let path = Wal::sibling_path(self.pager.path());
        if path.exists() {
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&path)?
                .sync_all()
                .ok();
        }
        Ok(())
    }

    pub fn total_pages(&self) -> Result<u32, StorageError> {
        self.pager.total_pages()
    }

    /// Drop all cached decoded pages.
    pub fn clear_caches(&mut self) {
        self.pager.clear_caches();
    }

    fn log(&mut self, table: &str, op: WalOp) -> Result<(), StorageError> {
        if !self.logging {
            return Ok(());
        }
        if let Some(wal) = self.wal.as_mut() {
            wal.append(table, &op)?;
        }
        Ok(())
    }

    // ── Catalog ────────────────────────────────────────────────────────

    /// Linear scan of the page-0 directory.
    pub fn find_table(&self, name: &str) -> Result<Option<CatalogEntry>, StorageError> {
        let catalog = self.pager.read_page(CATALOG_PAGE_ID)?;
        let count = read_u32(&catalog, NUM_TABLES_OFFSET) as usize;
        for idx in 0..count.min(MAX_TABLES) {
            let entry = read_catalog_entry(&catalog, idx)?;
            if entry.name == name {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    fn require_table(&self, name: &str) -> Result<CatalogEntry, StorageError> {
        self.find_table(name)?
            .ok_or_else(|| StorageError::TableMissing(name.to_string()))
    }

    /// All catalog entries, in slot order.
    pub fn list_tables(&self) -> Result<Vec<CatalogEntry>, StorageError> {
        let catalog = self.pager.read_page(CATALOG_PAGE_ID)?;
        let count = read_u32(&catalog, NUM_TABLES_OFFSET) as usize;
        let mut entries = Vec::with_capacity(count);
        for idx in 0..count.min(MAX_TABLES) {
            entries.push(read_catalog_entry(&catalog, idx)?);
        }
        Ok(entries)
    }

    /// Create a table: one catalog slot plus one empty heap page.
    /// `internal` names bypass the reserved set but not the whitelist.
    pub fn create_table(
        &mut self,
        name: &str,
        internal: bool,
    ) -> Result<CatalogEntry, StorageError> {
        if internal {
            if !is_valid_identifier(name) {
                return Err(StorageError::NameInvalid(name.to_string()));
            }
        } else {
            validate_user_table_name(name)?;
        }
        if self.find_table(name)?.is_some() {
            return Err(StorageError::Invalid(format!("table exists: {}", name)));
        }

        let catalog = self.pager.read_page(CATALOG_PAGE_ID)?;
        let count = read_u32(&catalog, NUM_TABLES_OFFSET) as usize;
        if count >= MAX_TABLES {
            return Err(StorageError::CatalogFull);
        }

        self.log(name, WalOp::CreateTable)?;

        let first_page = self.pager.alloc_page()?;
        // reread: alloc_page rewrote page 0
        let mut catalog = self.pager.read_page(CATALOG_PAGE_ID)?;
        let entry = CatalogEntry {
            name: name.to_string(),
            start_page: first_page,
            last_page: first_page,
        };
        write_catalog_entry(&mut catalog, count, &entry);
        write_u32(&mut catalog, NUM_TABLES_OFFSET, count as u32 + 1);
        self.pager.write_page(CATALOG_PAGE_ID, &catalog)?;
        Ok(entry)
    }

    /// Drop a table: the final slot moves over the victim so entries stay
    /// packed. The table's heap pages are leaked by design.
    pub fn drop_table(&mut self, name: &str) -> Result<CatalogEntry, StorageError> {
        let mut catalog = self.pager.read_page(CATALOG_PAGE_ID)?;
        let count = read_u32(&catalog, NUM_TABLES_OFFSET) as usize;
        let mut victim = None;
        for idx in 0..count.min(MAX_TABLES) {
            let entry = read_catalog_entry(&catalog, idx)?;
            if entry.name == name {
                victim = Some((idx, entry));
                break;
            }
        }
        let Some((idx, entry)) = victim else {
            return Err(StorageError::TableMissing(name.to_string()));
        };

        self.log(name, WalOp::DropTable)?;

        let last_idx = count - 1;
        if idx != last_idx {
            let last = read_catalog_entry(&catalog, last_idx)?;
            write_catalog_entry(&mut catalog, idx, &last);
        }
        zero_catalog_slot(&mut catalog, last_idx);
        write_u32(&mut catalog, NUM_TABLES_OFFSET, last_idx as u32);
        self.pager.write_page(CATALOG_PAGE_ID, &catalog)?;

        self.indexes.retain(|index| index.table() != name);
        Ok(entry)
    }

    /// Rewrite one slot's `last_page`.
    fn set_last_page(&mut self, name: &str, page_id: u32) -> Result<(), StorageError> {
        let mut catalog = self.pager.read_page(CATALOG_PAGE_ID)?;
        let count = read_u32(&catalog, NUM_TABLES_OFFSET) as usize;
        for idx in 0..count.min(MAX_TABLES) {
            let mut entry = read_catalog_entry(&catalog, idx)?;
            if entry.name == name {
                entry.last_page = page_id;
                write_catalog_entry(&mut catalog, idx, &entry);
                return self.pager.write_page(CATALOG_PAGE_ID, &catalog);
            }
        }
        Err(StorageError::TableMissing(name.to_string()))
    }

    // ── Indexes ────────────────────────────────────────────────────────

    /// Register an index definition without building it. Returns false when
    /// the definition already exists.
    pub fn register_index(&mut self, table: &str, field: &str) -> bool {
        if self.index_on(table, field).is_some() {
            return false;
        }
        self.indexes.push(FieldIndex::new(table, field));
        true
    }

    pub fn index_on(&self, table: &str, field: &str) -> Option<&FieldIndex> {
        self.indexes
            .iter()
            .find(|index| index.table() == table && index.field() == field)
    }

    pub fn indexes_for_table(&self, table: &str) -> Vec<&FieldIndex> {
        self.indexes
            .iter()
            .filter(|index| index.table() == table)
            .collect()
    }

    pub fn all_indexes(&self) -> &[FieldIndex] {
        &self.indexes
    }

    /// Rebuild one index's contents by a full raw scan; page hints come
    /// from the page each record currently sits on.
    pub fn rebuild_index(&mut self, table: &str, field: &str) -> Result<(), StorageError> {
        let rows = self.scan_raw(table, None, None)?;
        let Some(index) = self
            .indexes
            .iter_mut()
            .find(|index| index.table() == table && index.field() == field)
        else {
            return Ok(());
        };
        index.clear();
        for (page_id, record) in rows {
            if let Some(key) = record.get(field).cloned() {
                index.insert(&key, record, page_id);
            }
        }
        Ok(())
    }

    /// Create an index end-to-end: log, persist the `{table, field}` row
    /// in `_indexes`, register, and build. Returns false when it already
    /// existed.
    pub fn create_index(&mut self, table: &str, field: &str) -> Result<bool, StorageError> {
        validate_field_name(field)?;
        self.require_table(table)?;
        if self.index_on(table, field).is_some() {
            return Ok(false);
        }
        self.log(
            table,
            WalOp::CreateIndex {
                field: field.to_string(),
            },
        )?;
        let row = Record::from_pairs([
            ("table", Value::Str(table.to_string())),
            ("field", Value::Str(field.to_string())),
        ]);
        self.insert_many(INDEX_TABLE, std::slice::from_ref(&row))?;
        self.register_index(table, field);
        self.rebuild_index(table, field)?;
        Ok(true)
    }

    /// Drop every index definition for a table along with its `_indexes`
    /// rows.
    pub fn drop_indexes_for_table(&mut self, table: &str) -> Result<(), StorageError> {
        self.indexes.retain(|index| index.table() != table);
        let criteria = Criteria::Cmp(Condition {
            key: "table".to_string(),
            op: CmpOp::Eq,
            val: Operand::One(Value::Str(table.to_string())),
        });
        self.delete_matching(INDEX_TABLE, Some(&criteria))?;
        Ok(())
    }

    // ── Heap file ──────────────────────────────────────────────────────

    /// Append records to the table's tail page, allocating and linking a
    /// fresh page on overflow. Returns the number inserted.
    pub fn insert_many(&mut self, table: &str, rows: &[Record]) -> Result<usize, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.require_table(table)?;

        // serialize once, before any fit check or page write
        let mut encoded = Vec::with_capacity(rows.len());
        for row in rows {
            let bytes = row.to_json_vec();
            if bytes.len() > MAX_RECORD_LEN {
                return Err(StorageError::RecordTooLarge(bytes.len()));
            }
            encoded.push(bytes);
        }
        for row in rows {
            self.log(table, WalOp::Insert { row: row.clone() })?;
        }

        let placed = self.append_rows(table, rows, &encoded)?;
        self.maintain_indexes_on_insert(table, &placed);
        Ok(placed.len())
    }

    /// Heap append without logging or index maintenance; shared by insert
    /// and the update overflow path. Returns `(page_id, record)` pairs.
    fn append_rows(
        &mut self,
        table: &str,
        rows: &[Record],
        encoded: &[Vec<u8>],
    ) -> Result<Vec<(u32, Record)>, StorageError> {
        let entry = self.require_table(table)?;
        let mut page_id = entry.last_page;
        let mut page = self.pager.read_page(page_id)?;
        let mut placed = Vec::with_capacity(rows.len());

        for (row, bytes) in rows.iter().zip(encoded) {
            let needed = 2 + bytes.len();
            let free = read_u16(&page, HEAP_FREE_OFFSET) as usize;
            if free + needed > PAGE_SIZE {
                // link a fresh tail
                let new_id = self.pager.alloc_page()?;
                write_u32(&mut page, HEAP_NEXT_OFFSET, new_id);
                self.pager.write_page(page_id, &page)?;
                self.set_last_page(table, new_id)?;
                page_id = new_id;
                page = self.pager.read_page(page_id)?;
            }
            let free = read_u16(&page, HEAP_FREE_OFFSET) as usize;
            let count = read_u16(&page, HEAP_COUNT_OFFSET);
            write_u16(&mut page, free, bytes.len() as u16);
            page[free + 2..free + 2 + bytes.len()].copy_from_slice(bytes);
            write_u16(&mut page, HEAP_COUNT_OFFSET, count + 1);
            write_u16(&mut page, HEAP_FREE_OFFSET, (free + needed) as u16);
            placed.push((page_id, row.clone()));
        }
        self.pager.write_page(page_id, &page)?;
        Ok(placed)
    }

    fn maintain_indexes_on_insert(&mut self, table: &str, placed: &[(u32, Record)]) {
        for index in self
            .indexes
            .iter_mut()
            .filter(|index| index.table() == table)
        {
            for (page_id, record) in placed {
                if let Some(key) = record.get(index.field()).cloned() {
                    index.insert(&key, record.clone(), *page_id);
                }
            }
        }
    }

    /// Walk the table's page list, filtering by criteria. `limit` stops
    /// the walk early. A single-comparison criteria takes an inlined match
    /// loop instead of the recursive tree fold.
    pub fn scan(
        &self,
        table: &str,
        criteria: Option<&Criteria>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StorageError> {
        let entry = self.require_table(table)?;
        let mut results = Vec::new();
        let mut page_id = entry.start_page;
        loop {
            let objects = self.pager.read_page_objects(page_id)?;
            match criteria {
                None => {
                    for record in &objects.records {
                        results.push(record.clone());
                        if at_limit(&results, limit) {
                            return Ok(results);
                        }
                    }
                }
                // fast path: one comparison, no tree dispatch
                Some(Criteria::Cmp(cond)) => {
                    for record in &objects.records {
                        if cond.matches(record) {
                            results.push(record.clone());
                            if at_limit(&results, limit) {
                                return Ok(results);
                            }
                        }
                    }
                }
                Some(tree) => {
                    for record in &objects.records {
                        if tree.matches(record) {
                            results.push(record.clone());
                            if at_limit(&results, limit) {
                                return Ok(results);
                            }
                        }
                    }
                }
            }
            if objects.next == 0 {
                break;
            }
            page_id = objects.next;
        }
        Ok(results)
    }

    /// Scan returning each record with the heap page it sits on, for index
    /// builds and hint maintenance.
    pub fn scan_raw(
        &self,
        table: &str,
        criteria: Option<&Criteria>,
        limit: Option<usize>,
    ) -> Result<Vec<(u32, Record)>, StorageError> {
        let entry = self.require_table(table)?;
        let mut results = Vec::new();
        let mut page_id = entry.start_page;
        loop {
            let objects = self.pager.read_page_objects(page_id)?;
            for record in &objects.records {
                let keep = match criteria {
                    None => true,
                    Some(tree) => tree.matches(record),
                };
                if keep {
                    results.push((page_id, record.clone()));
                    if at_limit(&results, limit) {
                        return Ok(results);
                    }
                }
            }
            if objects.next == 0 {
                break;
            }
            page_id = objects.next;
        }
        Ok(results)
    }

    /// Number of records matching the criteria.
    pub fn count(&self, table: &str, criteria: Option<&Criteria>) -> Result<usize, StorageError> {
        Ok(self.scan(table, criteria, None)?.len())
    }

    /// Delete all matching records, compacting each touched page in place.
    /// With an equality criteria on an indexed field the walk is restricted
    /// to the hinted pages; a stale hint (zero deletions) falls back to the
    /// full table walk. Returns the deleted records.
    pub fn delete_matching(
        &mut self,
        table: &str,
        criteria: Option<&Criteria>,
    ) -> Result<Vec<Record>, StorageError> {
        let entry = self.require_table(table)?;

        if let Some(pages) = self.hinted_pages(table, criteria) {
            let mut deleted = Vec::new();
            for page_id in pages {
                deleted.extend(self.delete_on_page(table, page_id, criteria)?);
            }
            if !deleted.is_empty() {
                return Ok(deleted);
            }
            debug!(table, "index hint yielded nothing; falling back to full scan");
        }

        let mut deleted = Vec::new();
        let mut page_id = entry.start_page;
        loop {
            let next = {
                let page = self.pager.read_page(page_id)?;
                read_u32(&page, HEAP_NEXT_OFFSET)
            };
            deleted.extend(self.delete_on_page(table, page_id, criteria)?);
            if next == 0 {
                break;
            }
            page_id = next;
        }
        Ok(deleted)
    }

    /// Compact one page, dropping matching records. Undecodable records
    /// are preserved byte-for-byte. An empty page is a no-op and stays
    /// linked.
    fn delete_on_page(
        &mut self,
        table: &str,
        page_id: u32,
        criteria: Option<&Criteria>,
    ) -> Result<Vec<Record>, StorageError> {
        let page = self.pager.read_page(page_id)?;
        let items = heap_items(&page);
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut kept: Vec<Vec<u8>> = Vec::new();
        let mut deleted: Vec<Record> = Vec::new();
        for item in items {
            match item.record {
                Some(record) => {
                    let matches = criteria.map(|tree| tree.matches(&record)).unwrap_or(true);
                    if matches {
                        deleted.push(record);
                    } else {
                        kept.push(item.bytes);
                    }
                }
                None => kept.push(item.bytes),
            }
        }
        if deleted.is_empty() {
            return Ok(deleted);
        }

        for record in &deleted {
            self.log(
                table,
                WalOp::Delete {
                    old: record.clone(),
                },
            )?;
        }

        let next = read_u32(&page, HEAP_NEXT_OFFSET);
        let rebuilt = build_heap_page(next, &kept);
        self.pager.write_page(page_id, &rebuilt)?;

        for record in &deleted {
            self.unindex_record(table, record);
        }
        Ok(deleted)
    }

    /// Remove exactly one record equal to `target`. Used by WAL replay.
    pub fn delete_exact(&mut self, table: &str, target: &Record) -> Result<bool, StorageError> {
        let entry = self.require_table(table)?;
        let mut page_id = entry.start_page;
        loop {
            let page = self.pager.read_page(page_id)?;
            let next = read_u32(&page, HEAP_NEXT_OFFSET);
            let items = heap_items(&page);
            if items.iter().any(|i| i.record.as_ref() == Some(target)) {
                let mut kept = Vec::new();
                let mut removed = false;
                for item in items {
                    if !removed && item.record.as_ref() == Some(target) {
                        removed = true;
                        continue;
                    }
                    kept.push(item.bytes);
                }
                let rebuilt = build_heap_page(next, &kept);
                self.pager.write_page(page_id, &rebuilt)?;
                self.unindex_record(table, target);
                return Ok(true);
            }
            if next == 0 {
                return Ok(false);
            }
            page_id = next;
        }
    }

    /// Apply `updates` to every matching record. A record whose new
    /// encoding fits its old length is rewritten on its page (unchanged
    /// fields keep their order); a longer one is realized as delete plus
    /// re-append. Same hint path and stale-hint fallback as delete.
    /// Returns the post-image of every updated record.
    pub fn update_matching(
        &mut self,
        table: &str,
        updates: &Record,
        criteria: Option<&Criteria>,
    ) -> Result<Vec<Record>, StorageError> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let entry = self.require_table(table)?;

        if let Some(pages) = self.hinted_pages(table, criteria) {
            let mut rewritten = Vec::new();
            let mut overflows = Vec::new();
            for page_id in pages {
                let (done, spilled) = self.update_on_page(table, page_id, updates, criteria)?;
                rewritten.extend(done);
                overflows.extend(spilled);
            }
            if !rewritten.is_empty() || !overflows.is_empty() {
                rewritten.extend(self.reinsert_overflows(table, overflows)?);
                return Ok(rewritten);
            }
            debug!(table, "index hint yielded nothing; falling back to full scan");
        }

        // overflowed records re-append only after the walk: a record moved
        // to the tail must not be visited (and updated) twice
        let mut rewritten = Vec::new();
        let mut overflows = Vec::new();
        let mut page_id = entry.start_page;
        loop {
            let next = {
                let page = self.pager.read_page(page_id)?;
                read_u32(&page, HEAP_NEXT_OFFSET)
            };
            let (done, spilled) = self.update_on_page(table, page_id, updates, criteria)?;
            rewritten.extend(done);
            overflows.extend(spilled);
            if next == 0 {
                break;
            }
            page_id = next;
        }
        rewritten.extend(self.reinsert_overflows(table, overflows)?);
        Ok(rewritten)
    }

    /// Rewrite matching records on one page. In-place rewrites are applied
    /// and returned first; records whose new encoding no longer fits come
    /// back as pending `(old, new, encoded)` spills, already removed from
    /// the page and logged.
    #[allow(clippy::type_complexity)]
    fn update_on_page(
        &mut self,
        table: &str,
        page_id: u32,
        updates: &Record,
        criteria: Option<&Criteria>,
    ) -> Result<(Vec<Record>, Vec<(Record, Record, Vec<u8>)>), StorageError> {
        let page = self.pager.read_page(page_id)?;
        let items = heap_items(&page);
        if items.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut slots: Vec<Vec<u8>> = Vec::new();
        let mut rewrites: Vec<(Record, Record)> = Vec::new();
        let mut overflows: Vec<(Record, Record, Vec<u8>)> = Vec::new();
        for item in items {
            let Some(record) = item.record else {
                slots.push(item.bytes);
                continue;
            };
            let matches = criteria.map(|tree| tree.matches(&record)).unwrap_or(true);
            if !matches {
                slots.push(item.bytes);
                continue;
            }
            let mut new_record = record.clone();
            for (key, value) in updates.iter() {
                new_record.insert(key, value.clone());
            }
            let new_body = new_record.to_json_vec();
            if new_body.len() > MAX_RECORD_LEN {
                return Err(StorageError::RecordTooLarge(new_body.len()));
            }
            let old_body_len = item.bytes.len() - 2;
            if new_body.len() <= old_body_len {
                slots.push(record_slot(&new_body));
                rewrites.push((record, new_record));
            } else {
                // does not fit the old slot: realize as delete + insert
                overflows.push((record, new_record, new_body));
            }
        }
        if rewrites.is_empty() && overflows.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut images: Vec<(Record, Record)> = rewrites.clone();
        images.extend(
            overflows
                .iter()
                .map(|(old, new, _)| (old.clone(), new.clone())),
        );
        for (old, new) in images {
            self.log(table, WalOp::Update { old, new })?;
        }

        let next = read_u32(&page, HEAP_NEXT_OFFSET);
        let rebuilt = build_heap_page(next, &slots);
        self.pager.write_page(page_id, &rebuilt)?;

        for (old, new) in &rewrites {
            self.reindex_record(table, old, new, page_id);
        }
        for (old, _, _) in &overflows {
            self.unindex_record(table, old);
        }

        let rewritten = rewrites.into_iter().map(|(_, new)| new).collect();
        Ok((rewritten, overflows))
    }

    /// Append the post-images of spilled updates to the table tail.
    fn reinsert_overflows(
        &mut self,
        table: &str,
        overflows: Vec<(Record, Record, Vec<u8>)>,
    ) -> Result<Vec<Record>, StorageError> {
        if overflows.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<Record> = overflows.iter().map(|(_, new, _)| new.clone()).collect();
        let encoded: Vec<Vec<u8>> = overflows.into_iter().map(|(_, _, body)| body).collect();
        let placed = self.append_rows(table, &rows, &encoded)?;
        self.maintain_indexes_on_insert(table, &placed);
        Ok(rows)
    }

    /// Candidate pages from an index hint: only when the criteria is one
    /// equality on an indexed field. Hints are advisory; callers fall back
    /// to a full walk when they produce nothing.
    fn hinted_pages(&self, table: &str, criteria: Option<&Criteria>) -> Option<Vec<u32>> {
        let (key, value) = criteria?.as_equality()?;
        let index = self.index_on(table, key)?;
        let mut pages: Vec<u32> = index
            .entries(value)
            .iter()
            .map(|entry| entry.page_hint)
            .collect();
        pages.sort_unstable();
        pages.dedup();
        Some(pages)
    }

    fn unindex_record(&mut self, table: &str, record: &Record) {
        for index in self
            .indexes
            .iter_mut()
            .filter(|index| index.table() == table)
        {
            if let Some(key) = record.get(index.field()).cloned() {
                index.remove(&key, record);
            }
        }
    }

    /// Index maintenance for an in-place rewrite: an unchanged key keeps
    /// its entry (with refreshed record content and hint); a changed key
    /// is deleted and re-inserted.
    fn reindex_record(&mut self, table: &str, old: &Record, new: &Record, page_id: u32) {
        for index in self
            .indexes
            .iter_mut()
            .filter(|index| index.table() == table)
        {
            let old_key = old.get(index.field()).cloned();
            let new_key = new.get(index.field()).cloned();
            match (old_key, new_key) {
                (Some(old_key), Some(new_key)) => {
                    if old_key == new_key {
                        index.replace(&old_key, old, new.clone(), page_id);
                    } else {
                        index.remove(&old_key, old);
                        index.insert(&new_key, new.clone(), page_id);
                    }
                }
                (Some(old_key), None) => {
                    index.remove(&old_key, old);
                }
                (None, Some(new_key)) => {
                    index.insert(&new_key, new.clone(), page_id);
                }
                (None, None) => {}
            }
        }
    }
}

// ── Page helpers ───────────────────────────────────────────────────────

fn init_heap_page() -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    write_u32(&mut page, HEAP_NEXT_OFFSET, 0);
    write_u16(&mut page, HEAP_COUNT_OFFSET, 0);
    write_u16(&mut page, HEAP_FREE_OFFSET, HEAP_HEADER_LEN as u16);
    page
}

/// Decode every record slot on a heap page. A length prefix overrunning
/// the free offset ends the walk with a warning; a slot whose body is not
/// valid JSON is kept raw but carries no decoded record.
fn heap_items(page: &[u8]) -> Vec<HeapItem> {
    let count = read_u16(page, HEAP_COUNT_OFFSET) as usize;
    let free = (read_u16(page, HEAP_FREE_OFFSET) as usize).min(PAGE_SIZE);
    let mut items = Vec::with_capacity(count);
    let mut pos = HEAP_HEADER_LEN;
    for _ in 0..count {
        if pos + 2 > free {
            warn!(pos, count, "heap page record count overruns free offset");
            break;
        }
        let len = read_u16(page, pos) as usize;
        if pos + 2 + len > free {
            warn!(pos, len, "heap record length overruns free offset");
            break;
        }
        let bytes = page[pos..pos + 2 + len].to_vec();
        let record = match Record::from_json_slice(&page[pos + 2..pos + 2 + len]) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(%err, "skipping undecodable record");
                None
            }
        };
        items.push(HeapItem { bytes, record });
        pos += 2 + len;
    }
    items
}

/// Rebuild a heap page from raw record slots packed from offset 8; the
/// tail past the new free offset is zero-filled.
fn build_heap_page(next: u32, slots: &[Vec<u8>]) -> Vec<u8> {
    let mut page = init_heap_page();
    write_u32(&mut page, HEAP_NEXT_OFFSET, next);
    let mut pos = HEAP_HEADER_LEN;
    for bytes in slots {
        page[pos..pos + bytes.len()].copy_from_slice(bytes);
        pos += bytes.len();
    }
    write_u16(&mut page, HEAP_COUNT_OFFSET, slots.len() as u16);
    write_u16(&mut page, HEAP_FREE_OFFSET, pos as u16);
    page
}

fn at_limit<T>(results: &[T], limit: Option<usize>) -> bool {
    match limit {
        Some(limit) => results.len() >= limit,
        None => false,
    }
}

fn read_catalog_entry(catalog: &[u8], idx: usize) -> Result<CatalogEntry, StorageError> {
    let base = CATALOG_HEADER_LEN + idx * CATALOG_ENTRY_LEN;
    let name_bytes = &catalog[base..base + TABLE_NAME_LEN];
    let end = name_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(TABLE_NAME_LEN);
    let name = std::str::from_utf8(&name_bytes[..end])
        .map_err(|_| StorageError::Corrupt(format!("catalog slot {} name is not utf-8", idx)))?
        .to_string();
    Ok(CatalogEntry {
        name,
        start_page: read_u32(catalog, base + TABLE_NAME_LEN),
        last_page: read_u32(catalog, base + TABLE_NAME_LEN + 4),
    })
}

fn write_catalog_entry(catalog: &mut [u8], idx: usize, entry: &CatalogEntry) {
    let base = CATALOG_HEADER_LEN + idx * CATALOG_ENTRY_LEN;
    catalog[base..base + TABLE_NAME_LEN].fill(0);
    let name = entry.name.as_bytes();
    let copy_len = name.len().min(TABLE_NAME_LEN);
    catalog[base..base + copy_len].copy_from_slice(&name[..copy_len]);
    write_u32(catalog, base + TABLE_NAME_LEN, entry.start_page);
    write_u32(catalog, base + TABLE_NAME_LEN + 4, entry.last_page);
}

fn zero_catalog_slot(catalog: &mut [u8], idx: usize) {
    let base = CATALOG_HEADER_LEN + idx * CATALOG_ENTRY_LEN;
    catalog[base..base + CATALOG_ENTRY_LEN].fill(0);
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: i64, v: &str) -> Record {
        Record::from_pairs([("id", Value::Int(id)), ("v", Value::Str(v.into()))])
    }

    #[test]
    fn heap_page_tiles_records_contiguously() {
        let slot_a = record_slot(&rec(1, "a").to_json_vec());
        let slot_b = record_slot(&rec(2, "bb").to_json_vec());

        let page = build_heap_page(7, &[slot_a.clone(), slot_b.clone()]);
        assert_eq!(read_u32(&page, HEAP_NEXT_OFFSET), 7);
        assert_eq!(read_u16(&page, HEAP_COUNT_OFFSET), 2);
        // free offset is 8 + Σ(2 + len)
        let expected = HEAP_HEADER_LEN + slot_a.len() + slot_b.len();
        assert_eq!(read_u16(&page, HEAP_FREE_OFFSET) as usize, expected);
        // tail past the free offset is zero-filled
        assert!(page[expected..].iter().all(|&b| b == 0));

        let items = heap_items(&page);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].record, Some(rec(1, "a")));
        assert_eq!(items[1].record, Some(rec(2, "bb")));
    }

    #[test]
    fn corrupt_record_is_kept_raw_and_skipped() {
        let slot_bad = record_slot(b"{broken");
        let slot_good = record_slot(&rec(1, "ok").to_json_vec());

        let page = build_heap_page(0, &[slot_bad, slot_good]);
        let items = heap_items(&page);
        assert_eq!(items.len(), 2);
        assert!(items[0].record.is_none());
        assert_eq!(items[1].record, Some(rec(1, "ok")));
    }

    #[test]
    fn catalog_entry_round_trip() {
        let mut catalog = vec![0u8; PAGE_SIZE];
        let entry = CatalogEntry {
            name: "users".to_string(),
            start_page: 3,
            last_page: 9,
        };
        write_catalog_entry(&mut catalog, 0, &entry);
        write_catalog_entry(
            &mut catalog,
            1,
            &CatalogEntry {
                name: "orders".to_string(),
                start_page: 4,
                last_page: 4,
            },
        );
        assert_eq!(read_catalog_entry(&catalog, 0).unwrap(), entry);
        assert_eq!(read_catalog_entry(&catalog, 1).unwrap().name, "orders");
    }

    #[test]
    fn identifier_whitelist() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("_internal"));
        assert!(is_valid_identifier("a1_b2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1abc"));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier("x".repeat(33).as_str()));

        assert!(validate_user_table_name("users").is_ok());
        assert!(validate_user_table_name("_indexes").is_err());
        assert!(validate_user_table_name("null").is_err());
        assert!(validate_user_table_name("true").is_err());
    }
}

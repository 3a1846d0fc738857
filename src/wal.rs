//! Append-only write-ahead log.
//!
//! The WAL lives next to the database file as `<path>.wal`. Each record is
//! framed as:
//!
//! ```text
//! [len: u32][seq: u64][kind: u8][name_len: u16][name][payload_len: u32][payload][crc: u32]
//! ```
//!
//! `len` covers the body (seq through payload); `crc` is a CRC32 over the
//! length field and the body. Payloads are UTF-8 JSON: the new record for
//! inserts, `{"old":…,"new":…}` for updates, the pre-image for deletes,
//! `{"field":…}` for index creation. A truncated or checksum-failing tail
//! ends replay at the last good record.

use crate::record::Record;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const KIND_INSERT: u8 = 1;
const KIND_UPDATE: u8 = 2;
const KIND_DELETE: u8 = 3;
const KIND_CREATE_TABLE: u8 = 4;
const KIND_DROP_TABLE: u8 = 5;
const KIND_CREATE_INDEX: u8 = 6;

/// Upper bound on a single frame body; anything larger is treated as a
/// corrupted length field.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug)]
/// Errors produced by the write-ahead log.
pub enum WalError {
    /// Underlying I/O error.
    Io(io::Error),
    /// A frame failed its checksum or could not be decoded.
    Corrupt(String),
}

impl std::fmt::Display for WalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalError::Io(err) => write!(f, "wal io error: {}", err),
            WalError::Corrupt(msg) => write!(f, "wal corrupt: {}", msg),
        }
    }
}

impl std::error::Error for WalError {}

impl From<io::Error> for WalError {
    fn from(err: io::Error) -> Self {
        WalError::Io(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// When appended records are flushed and fsynced.
pub enum SyncMode {
    /// Flush + sync once per committed operation.
    Normal,
    /// Flush + sync on every append.
    Full,
    /// Never sync; durability rides on the OS.
    Off,
}

#[derive(Debug, Clone, PartialEq)]
/// One logical operation recorded in the log.
pub enum WalOp {
    Insert { row: Record },
    Update { old: Record, new: Record },
    Delete { old: Record },
    CreateTable,
    DropTable,
    CreateIndex { field: String },
}

impl WalOp {
    fn kind(&self) -> u8 {
        match self {
            WalOp::Insert { .. } => KIND_INSERT,
            WalOp::Update { .. } => KIND_UPDATE,
            WalOp::Delete { .. } => KIND_DELETE,
            WalOp::CreateTable => KIND_CREATE_TABLE,
            WalOp::DropTable => KIND_DROP_TABLE,
            WalOp::CreateIndex { .. } => KIND_CREATE_INDEX,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            WalOp::Insert { row } => row.to_json_vec(),
            WalOp::Update { old, new } => {
                let mut map = serde_json::Map::with_capacity(2);
                map.insert("old".to_string(), old.to_json_value());
                map.insert("new".to_string(), new.to_json_value());
                serde_json::to_vec(&serde_json::Value::Object(map)).unwrap_or_default()
            }
            WalOp::Delete { old } => old.to_json_vec(),
            WalOp::CreateTable | WalOp::DropTable => Vec::new(),
            WalOp::CreateIndex { field } => {
                let mut map = serde_json::Map::with_capacity(1);
                map.insert(
                    "field".to_string(),
                    serde_json::Value::String(field.clone()),
                );
                serde_json::to_vec(&serde_json::Value::Object(map)).unwrap_or_default()
            }
        }
    }

    fn decode(kind: u8, payload: &[u8]) -> Result<WalOp, WalError> {
        let record = |bytes: &[u8]| {
            Record::from_json_slice(bytes)
                .map_err(|e| WalError::Corrupt(format!("bad payload: {}", e)))
        };
        match kind {
            KIND_INSERT => Ok(WalOp::Insert { row: record(payload)? }),
            KIND_UPDATE => {
                let top: serde_json::Value = serde_json::from_slice(payload)
                    .map_err(|e| WalError::Corrupt(format!("bad payload: {}", e)))?;
                let old = top
                    .get("old")
                    .and_then(Record::from_json_value)
                    .ok_or_else(|| WalError::Corrupt("update missing old image".to_string()))?;
                let new = top
                    .get("new")
                    .and_then(Record::from_json_value)
                    .ok_or_else(|| WalError::Corrupt("update missing new image".to_string()))?;
                Ok(WalOp::Update { old, new })
            }
            KIND_DELETE => Ok(WalOp::Delete { old: record(payload)? }),
            KIND_CREATE_TABLE => Ok(WalOp::CreateTable),
            KIND_DROP_TABLE => Ok(WalOp::DropTable),
            KIND_CREATE_INDEX => {
                let top: serde_json::Value = serde_json::from_slice(payload)
                    .map_err(|e| WalError::Corrupt(format!("bad payload: {}", e)))?;
                let field = top
                    .get("field")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| WalError::Corrupt("index record missing field".to_string()))?;
                Ok(WalOp::CreateIndex { field: field.to_string() })
            }
            other => Err(WalError::Corrupt(format!("unknown op kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A decoded log record.
pub struct WalRecord {
    pub seq: u64,
    pub table: String,
    pub op: WalOp,
}

/// Append-only operation log attached to one database handle.
pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    sync: SyncMode,
    next_seq: u64,
    pending: bool,
}

impl Wal {
    /// Sibling log path for a database file.
    pub fn sibling_path(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_os_string();
        name.push(".wal");
        PathBuf::from(name)
    }

    /// Open (or create) the log for appending. Callers replay and truncate
    /// before opening, so sequence numbers restart at 1.
    pub fn open(db_path: &Path, sync: SyncMode) -> Result<Self, WalError> {
        let path = Self::sibling_path(db_path);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Wal {
            path,
            writer: BufWriter::new(file),
            sync,
            next_seq: 1,
            pending: false,
        })
    }

    /// Append one logical operation. With `SyncMode::Full` the record is
    /// durable on return; otherwise durability waits for [`Wal::commit`].
    pub fn append(&mut self, table: &str, op: &WalOp) -> Result<u64, WalError> {
        let seq = self.next_seq;
        let frame = encode_frame(seq, table, op);
        self.writer.write_all(&frame)?;
        self.next_seq += 1;
        self.pending = true;
        if self.sync == SyncMode::Full {
            self.sync_now()?;
        }
        Ok(seq)
    }

    /// Commit boundary: flush + sync pending appends under `Normal`.
    pub fn commit(&mut self) -> Result<(), WalError> {
        if !self.pending {
            return Ok(());
        }
        match self.sync {
            SyncMode::Normal | SyncMode::Full => self.sync_now(),
            SyncMode::Off => {
                self.writer.flush()?;
                self.pending = false;
                Ok(())
            }
        }
    }

    /// Truncate the log to zero length after a checkpoint.
    pub fn reset(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(0)?;
        self.writer.get_ref().sync_all().ok();
        self.next_seq = 1;
        self.pending = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sync_now(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        // sync failure is non-fatal for the page file but not for the log:
        // a lost WAL record is a lost operation.
        self.writer.get_ref().sync_data()?;
        self.pending = false;
        Ok(())
    }

    /// Read every valid record from a database's sibling log, in order.
    /// Stops at the first truncated or checksum-failing frame; earlier
    /// records are still returned.
    pub fn replay(db_path: &Path) -> Result<Vec<WalRecord>, WalError> {
        let path = Self::sibling_path(db_path);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf);
            if len < 15 || len > MAX_FRAME_LEN {
                warn!(len, "wal frame has invalid length; dropping tail");
                break;
            }
            let mut body = vec![0u8; len as usize];
            if reader.read_exact(&mut body).is_err() {
                warn!("wal frame truncated; dropping tail");
                break;
            }
            let mut crc_buf = [0u8; 4];
            if reader.read_exact(&mut crc_buf).is_err() {
                warn!("wal frame missing checksum; dropping tail");
                break;
            }
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&len_buf);
            hasher.update(&body);
            if hasher.finalize() != u32::from_le_bytes(crc_buf) {
                warn!(records = records.len(), "wal checksum mismatch; replay halts at last good record");
                break;
            }
            match decode_body(&body) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(%err, "undecodable wal frame; replay halts at last good record");
                    break;
                }
            }
        }
        Ok(records)
    }
}

fn encode_frame(seq: u64, table: &str, op: &WalOp) -> Vec<u8> {
    let name = table.as_bytes();
    let payload = op.payload();
    let body_len = 8 + 1 + 2 + name.len() + 4 + payload.len();

    let mut frame = Vec::with_capacity(4 + body_len + 4);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    frame.extend_from_slice(&seq.to_le_bytes());
    frame.push(op.kind());
    frame.extend_from_slice(&(name.len() as u16).to_le_bytes());
    frame.extend_from_slice(name);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);

    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn decode_body(body: &[u8]) -> Result<WalRecord, WalError> {
    let corrupt = |msg: &str| WalError::Corrupt(msg.to_string());
    if body.len() < 15 {
        return Err(corrupt("frame body too short"));
    }
    let seq = u64::from_le_bytes(body[0..8].try_into().unwrap());
    let kind = body[8];
    let name_len = u16::from_le_bytes(body[9..11].try_into().unwrap()) as usize;
    let mut pos = 11;
    if pos + name_len + 4 > body.len() {
        return Err(corrupt("table name overruns frame"));
    }
    let table = std::str::from_utf8(&body[pos..pos + name_len])
        .map_err(|_| corrupt("table name is not utf-8"))?
        .to_string();
    pos += name_len;
    let payload_len = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    if pos + payload_len != body.len() {
        return Err(corrupt("payload length disagrees with frame length"));
    }
    let op = WalOp::decode(kind, &body[pos..])?;
    Ok(WalRecord { seq, table, op })
}

//! Transaction journal for crash recovery.
//!
//! Every content-store transaction is journaled before any blob is moved
//! into place or removed. On open, entries that never reached their commit
//! marker are handed back to the content store for resolution.

use crate::error::{Result, VaultError};
use crate::types::{ContentHash, StateId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for the journal file.
const WAL_MAGIC: &[u8; 4] = b"SVJ\0";

/// Current journal format version.
const WAL_VERSION: u8 = 1;

/// Length of the journal header: magic, version.
const WAL_HEADER_LEN: usize = 5;

/// Upper bound on a single encoded entry.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Journal entry status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntryStatus {
    /// Transaction started but has not finished.
    Pending,
    /// Transaction finished; its effects are final.
    Committed,
}

/// A single journal entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalEntry {
    pub seq: u64,
    pub status: WalEntryStatus,
    pub operation: WalOperation,
    pub logged_at: Timestamp,
}

/// Operations recorded in the journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOperation {
    /// A content transaction on behalf of a state.
    Transaction {
        state_id: StateId,
        /// Blobs this transaction moved into the store (not previously present).
        placed: Vec<ContentHash>,
        /// Blobs this transaction intends to remove.
        deleted: Vec<ContentHash>,
    },
    /// Commit marker for an earlier entry.
    Marker,
}

/// Append-only journal of content transactions.
///
/// Frames are `len: u32 | rmp-encoded entry | crc32`, little endian. The
/// journal is small (it is cleared after every completed transaction), so
/// reads load the whole file.
pub struct WriteAheadLog {
    path: PathBuf,
    next_seq: Mutex<u64>,
    file: Mutex<Option<File>>,
}

impl WriteAheadLog {
    /// Create or open a journal file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let next_seq = if path.exists() {
            read_entries(&path)?
                .iter()
                .map(|entry| entry.seq)
                .max()
                .map_or(1, |seq| seq + 1)
        } else {
            write_header(&path)?;
            1
        };

        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            file: Mutex::new(Some(file)),
        })
    }

    /// Journal an operation as pending and return its sequence number.
    pub fn log(&self, operation: WalOperation) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;

        self.append(&WalEntry {
            seq,
            status: WalEntryStatus::Pending,
            operation,
            logged_at: Timestamp::now(),
        })?;

        *next_seq += 1;
        Ok(seq)
    }

    /// Write the commit marker for an entry.
    pub fn commit(&self, seq: u64) -> Result<()> {
        self.append(&WalEntry {
            seq,
            status: WalEntryStatus::Committed,
            operation: WalOperation::Marker,
            logged_at: Timestamp::now(),
        })
    }

    /// All entries without a commit marker, in sequence order.
    pub fn get_pending_entries(&self) -> Result<Vec<WalEntry>> {
        let mut pending = BTreeMap::new();
        let mut committed = HashSet::new();

        for entry in read_entries(&self.path)? {
            match entry.status {
                WalEntryStatus::Pending => {
                    pending.insert(entry.seq, entry);
                }
                WalEntryStatus::Committed => {
                    committed.insert(entry.seq);
                }
            }
        }

        Ok(pending
            .into_iter()
            .filter(|(seq, _)| !committed.contains(seq))
            .map(|(_, entry)| entry)
            .collect())
    }

    /// Truncate the journal once every entry is resolved.
    pub fn clear(&self) -> Result<()> {
        let mut file = self.file.lock();
        *file = None;

        write_header(&self.path)?;
        *file = Some(OpenOptions::new().append(true).open(&self.path)?);
        *self.next_seq.lock() = 1;

        Ok(())
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.get_pending_entries()?.is_empty())
    }

    fn append(&self, entry: &WalEntry) -> Result<()> {
        let frame = encode_frame(entry)?;

        let mut guard = self.file.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| VaultError::Transaction("journal is closed".into()))?;
        file.write_all(&frame)?;
        file.sync_data()?;
        Ok(())
    }
}

/// Truncate `path` to an empty journal.
fn write_header(path: &Path) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(WAL_MAGIC)?;
    file.write_all(&[WAL_VERSION])?;
    file.sync_all()?;
    Ok(())
}

fn read_entries(path: &Path) -> Result<Vec<WalEntry>> {
    let data = fs::read(path)?;
    if data.len() < WAL_HEADER_LEN || &data[..4] != WAL_MAGIC {
        return Err(VaultError::InvalidFormat("Invalid journal magic".into()));
    }
    if data[4] != WAL_VERSION {
        return Err(VaultError::InvalidFormat(format!(
            "Unsupported journal version: {}",
            data[4]
        )));
    }

    let mut entries = Vec::new();
    let mut rest = &data[WAL_HEADER_LEN..];
    while !rest.is_empty() {
        match decode_frame(rest) {
            Ok(Some((entry, tail))) => {
                entries.push(entry);
                rest = tail;
            }
            // Torn trailing frame from an interrupted append.
            Ok(None) => break,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt journal tail");
                break;
            }
        }
    }

    Ok(entries)
}

fn encode_frame(entry: &WalEntry) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(entry)?;

    let mut frame = Vec::with_capacity(body.len() + 8);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(frame)
}

/// Decode one frame, returning the entry and the remaining bytes.
///
/// `Ok(None)` means the buffer ends mid-frame.
fn decode_frame(data: &[u8]) -> Result<Option<(WalEntry, &[u8])>> {
    let Some(len_bytes) = data.get(..4) else {
        return Ok(None);
    };
    let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(VaultError::Corruption("journal entry too large".into()));
    }

    let Some(frame) = data.get(..4 + len + 4) else {
        return Ok(None);
    };
    let body = &frame[4..4 + len];
    let crc = &frame[4 + len..];

    let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(VaultError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let entry = rmp_serde::from_slice(body)?;
    Ok(Some((entry, &data[frame.len()..])))
}

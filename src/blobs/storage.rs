//! Content store implementation.

use super::transaction::{ContentClaims, ContentTransaction};
use crate::error::{Result, VaultError};
use crate::types::{ContentHash, FileDescriptor, StateId};
use crate::wal::{WalOperation, WriteAheadLog};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Magic bytes for blob files.
const BLOB_MAGIC: &[u8; 4] = b"SVB\0";

/// Current blob format version.
const BLOB_VERSION: u8 = 1;

/// Header length: magic, version, content length.
const BLOB_HEADER_LEN: usize = 4 + 1 + 8;

/// Name of the staging directory inside the store.
const STAGING_DIR: &str = "tmp";

/// Content-addressed store for tracked file contents.
///
/// Blobs are sharded by the first byte of their hash. Writes and deletes
/// happen only through [`ContentTransaction`], which journals each batch so
/// an interrupted transaction can be resolved by [`ContentStore::recover`].
pub struct ContentStore {
    path: PathBuf,
    journal: WriteAheadLog,
    cache: Mutex<LruCache<ContentHash, Vec<u8>>>,
}

impl ContentStore {
    /// Open a content store rooted at `path`, journaling to `journal_path`.
    pub fn new(
        path: impl AsRef<Path>,
        journal_path: impl AsRef<Path>,
        cache_size: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(path.join(STAGING_DIR))?;

        let journal = WriteAheadLog::open(journal_path)?;
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            journal,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Start a transaction on behalf of `state_id`.
    ///
    /// Added files are read from `source_root` joined with their relative
    /// path when the transaction completes.
    pub fn begin(&self, state_id: StateId, source_root: &Path) -> ContentTransaction<'_> {
        ContentTransaction::new(self, state_id, source_root.to_path_buf())
    }

    /// Read a blob's content, verifying checksum and hash.
    pub fn read(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = self.cache.lock().get(hash).cloned() {
            return Ok(Some(cached));
        }

        let blob_path = self.blob_path(hash);
        if !blob_path.exists() {
            return Ok(None);
        }

        let content = decode_blob(&fs::read(&blob_path)?)?;

        let computed = ContentHash::of(&content);
        if &computed != hash {
            return Err(VaultError::HashMismatch {
                expected: hash.clone(),
                got: computed,
            });
        }

        self.cache.lock().put(hash.clone(), content.clone());
        Ok(Some(content))
    }

    /// Write a descriptor's content into `dest_root` at its relative path.
    pub fn restore(&self, descriptor: &FileDescriptor, dest_root: &Path) -> Result<PathBuf> {
        let content = self
            .read(descriptor.content_hash())?
            .ok_or_else(|| VaultError::BlobNotFound(descriptor.content_hash().clone()))?;

        let dest = descriptor.resolve(dest_root);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&dest, content)?;

        Ok(dest)
    }

    pub fn exists(&self, hash: &ContentHash) -> bool {
        if self.cache.lock().contains(hash) {
            return true;
        }
        self.blob_path(hash).exists()
    }

    /// List all stored blob hashes.
    pub fn list(&self) -> Result<Vec<ContentHash>> {
        let mut hashes = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || entry.file_name() == STAGING_DIR {
                continue;
            }
            for blob_entry in fs::read_dir(entry.path())? {
                let blob_entry = blob_entry?;
                let filename = blob_entry.file_name();
                if let Ok(hash) = ContentHash::from_hex(&filename.to_string_lossy()) {
                    hashes.push(hash);
                }
            }
        }

        Ok(hashes)
    }

    /// Total size of all blob files on disk.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || entry.file_name() == STAGING_DIR {
                continue;
            }
            for blob_entry in fs::read_dir(entry.path())? {
                total += blob_entry?.metadata()?.len();
            }
        }

        Ok(total)
    }

    /// Delete every blob that no state claims. Returns the removed hashes.
    pub fn collect_garbage(&self, claims: &dyn ContentClaims) -> Result<Vec<ContentHash>> {
        let mut removed = Vec::new();

        for hash in self.list()? {
            if !claims.is_claimed(&hash, None)? && self.delete(&hash)? {
                removed.push(hash);
            }
        }

        info!(removed = removed.len(), "garbage collection finished");
        Ok(removed)
    }

    /// Resolve transactions interrupted before their commit marker.
    ///
    /// Blobs such a transaction placed or meant to delete are removed unless
    /// some state claims them. Leftover staging files are discarded and the
    /// journal is cleared. Returns the number of resolved transactions.
    pub fn recover(&self, claims: &dyn ContentClaims) -> Result<usize> {
        let pending = self.journal.get_pending_entries()?;

        for entry in &pending {
            if let WalOperation::Transaction {
                state_id,
                placed,
                deleted,
            } = &entry.operation
            {
                warn!(seq = entry.seq, state = %state_id, "resolving interrupted transaction");
                for hash in placed.iter().chain(deleted.iter()) {
                    if !claims.is_claimed(hash, None)? {
                        self.delete(hash)?;
                    }
                }
            }
        }

        for entry in fs::read_dir(self.staging_path())? {
            fs::remove_file(entry?.path())?;
        }

        if !pending.is_empty() {
            self.journal.clear()?;
        }

        Ok(pending.len())
    }

    pub(crate) fn journal(&self) -> &WriteAheadLog {
        &self.journal
    }

    /// Copy a source file into the staging area as a blob file.
    ///
    /// The source must hash to `expected`; the file may have changed since
    /// the diff was produced.
    pub(crate) fn stage(&self, source: &Path, expected: &ContentHash) -> Result<PathBuf> {
        let content = fs::read(source)?;

        let computed = ContentHash::of(&content);
        if &computed != expected {
            return Err(VaultError::HashMismatch {
                expected: expected.clone(),
                got: computed,
            });
        }

        let staged = self.staging_path().join(format!("{}.staged", expected));
        let mut file = File::create(&staged)?;
        file.write_all(&encode_blob(&content))?;
        file.sync_all()?;

        debug!(hash = %expected, source = %source.display(), "staged blob");
        Ok(staged)
    }

    /// Move a staged blob to its final location.
    pub(crate) fn place(&self, staged: &Path, hash: &ContentHash) -> Result<()> {
        fs::create_dir_all(self.shard_path(hash))?;
        fs::rename(staged, self.blob_path(hash))?;
        Ok(())
    }

    /// Physically delete a blob. Returns whether it existed.
    pub(crate) fn delete(&self, hash: &ContentHash) -> Result<bool> {
        self.cache.lock().pop(hash);

        let blob_path = self.blob_path(hash);
        if blob_path.exists() {
            fs::remove_file(&blob_path)?;
            debug!(hash = %hash, "deleted blob");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn staging_path(&self) -> PathBuf {
        self.path.join(STAGING_DIR)
    }

    fn shard_path(&self, hash: &ContentHash) -> PathBuf {
        self.path.join(hash.shard_prefix())
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.shard_path(hash).join(hash.as_str())
    }
}

fn encode_blob(content: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BLOB_HEADER_LEN + content.len() + 4);
    buf.extend_from_slice(BLOB_MAGIC);
    buf.push(BLOB_VERSION);
    buf.extend_from_slice(&(content.len() as u64).to_le_bytes());
    buf.extend_from_slice(content);
    buf.extend_from_slice(&crc32fast::hash(content).to_le_bytes());
    buf
}

fn decode_blob(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < BLOB_HEADER_LEN + 4 {
        return Err(VaultError::Corruption("blob file truncated".into()));
    }
    if &data[..4] != BLOB_MAGIC {
        return Err(VaultError::InvalidFormat("Invalid blob magic".into()));
    }
    if data[4] != BLOB_VERSION {
        return Err(VaultError::InvalidFormat(format!(
            "Unsupported blob version: {}",
            data[4]
        )));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[5..BLOB_HEADER_LEN]);
    let len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| VaultError::Corruption("blob length out of range".into()))?;

    // `data` holds at least the header and checksum.
    if len != data.len() - BLOB_HEADER_LEN - 4 {
        return Err(VaultError::Corruption("blob length mismatch".into()));
    }

    let content = &data[BLOB_HEADER_LEN..BLOB_HEADER_LEN + len];
    let mut checksum_bytes = [0u8; 4];
    checksum_bytes.copy_from_slice(&data[BLOB_HEADER_LEN + len..]);
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(content);
    if stored != computed {
        return Err(VaultError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    Ok(content.to_vec())
}

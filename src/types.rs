//! Core types for the versioning engine.

use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a committed state, assigned by the repository allocator.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub u64);

impl StateId {
    pub fn next(self) -> Self {
        StateId(self.0 + 1)
    }
}

impl fmt::Debug for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateId({})", self.0)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash of a tracked file (SHA-256, lowercase hex).
///
/// The hash is the deduplication key: two descriptors with the same hash
/// refer to the same stored content regardless of name or path.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute the hash of some content.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentHash(hex::encode(hasher.finalize()))
    }

    /// Parse a hex string, rejecting anything that is not a SHA-256 digest.
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        Ok(ContentHash(hex::encode(bytes)))
    }

    /// Whether the hash is a well-formed SHA-256 hex digest.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 64 && self.0.bytes().all(|b| b.is_ascii_hexdigit())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First two hex characters, used as the shard directory.
    pub fn shard_prefix(&self) -> &str {
        &self.0[..self.0.len().min(2)]
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({}...)", &self.0[..self.0.len().min(8)])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One tracked file: display name, content hash and path relative to the
/// tracked root. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDescriptor {
    display_name: String,
    content_hash: ContentHash,
    relative_path: String,
}

impl FileDescriptor {
    pub fn new(
        display_name: impl Into<String>,
        content_hash: ContentHash,
        relative_path: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            content_hash,
            relative_path: relative_path.into(),
        }
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn content_hash(&self) -> &ContentHash {
        &self.content_hash
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Resolve the relative path against a root directory.
    ///
    /// Leading separators are ignored so `/a/b` and `a/b` resolve alike.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(self.relative_path.trim_start_matches(['/', '\\']))
    }

    /// Whether the relative path stays inside the tracked root.
    pub fn has_safe_path(&self) -> bool {
        let trimmed = self.relative_path.trim_start_matches(['/', '\\']);
        !trimmed.is_empty()
            && Path::new(trimmed)
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    }
}

/// Partition selector for relative-path lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Search intact, then modified, then added.
    Any,
    Added,
    Modified,
    Intact,
}

impl Scope {
    pub const SUPPORTED: [&'static str; 4] = ["any", "added", "modified", "intact"];
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Any
    }
}

impl FromStr for Scope {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "any" => Ok(Scope::Any),
            "added" => Ok(Scope::Added),
            "modified" => Ok(Scope::Modified),
            "intact" => Ok(Scope::Intact),
            other => Err(VaultError::UnsupportedScope(other.to_string())),
        }
    }
}

/// Working-set diff produced by the scanner and consumed by commit.
///
/// Every field is required when deserializing; a document missing any of
/// them is rejected as a malformed diff.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnstagedDiff {
    /// Number of tracked files, as counted by the producer.
    pub count: u64,
    pub added: Vec<FileDescriptor>,
    pub modified: Vec<FileDescriptor>,
    pub removed: Vec<FileDescriptor>,
    pub intact: Vec<FileDescriptor>,
}

impl UnstagedDiff {
    /// Parse a diff from JSON.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| VaultError::MalformedDiff(e.to_string()))
    }

    /// Whether the diff carries any change relative to the previous state.
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty())
    }

    /// Check the diff's shape before anything is written.
    ///
    /// A zero `count` is malformed. Every hash must be a SHA-256 digest,
    /// every path must stay inside the tracked root, and a hash may not
    /// appear in two different partitions.
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(VaultError::MalformedDiff("count must be non-zero".into()));
        }

        let mut seen: HashMap<&ContentHash, &'static str> = HashMap::new();
        for (name, entries) in self.partitions() {
            for entry in entries {
                if !entry.content_hash().is_well_formed() {
                    return Err(VaultError::MalformedDiff(format!(
                        "invalid content hash in {}: {}",
                        name,
                        entry.content_hash()
                    )));
                }
                if !entry.has_safe_path() {
                    return Err(VaultError::MalformedDiff(format!(
                        "relative path escapes the tracked root: {}",
                        entry.relative_path()
                    )));
                }
                if let Some(other) = seen.insert(entry.content_hash(), name) {
                    if other != name {
                        return Err(VaultError::MalformedDiff(format!(
                            "content hash {} appears in both {} and {}",
                            entry.content_hash(),
                            other,
                            name
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    fn partitions(&self) -> [(&'static str, &[FileDescriptor]); 4] {
        [
            ("added", &self.added),
            ("modified", &self.modified),
            ("removed", &self.removed),
            ("intact", &self.intact),
        ]
    }
}

/// Seconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_secs())
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Repository-level summary of a committed state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub id: StateId,
    pub message: String,
    pub timestamp: Timestamp,
    pub count: u64,
}

/// Repository statistics.
#[derive(Clone, Debug, Default)]
pub struct RepoStats {
    pub state_count: u64,
    pub blob_count: u64,
    pub blob_size_bytes: u64,
}

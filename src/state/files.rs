//! Partitioned file sets and the persisted state record.

use crate::error::{Result, VaultError};
use crate::types::{ContentHash, FileDescriptor};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Current state record format version.
pub const RECORD_VERSION: u32 = 1;

/// File name of the state record inside a state's directory.
pub const RECORD_FILE: &str = "files.json";

/// Files of one change class, keyed by content hash.
///
/// Entries keep insertion order, which is also the serialized key order.
/// Inserting a hash that is already present replaces the entry in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partition {
    entries: Vec<FileDescriptor>,
    index: HashMap<ContentHash, usize>,
}

impl Partition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, descriptor: FileDescriptor) -> Option<FileDescriptor> {
        match self.index.get(descriptor.content_hash()) {
            Some(&pos) => Some(std::mem::replace(&mut self.entries[pos], descriptor)),
            None => {
                self.index
                    .insert(descriptor.content_hash().clone(), self.entries.len());
                self.entries.push(descriptor);
                None
            }
        }
    }

    pub fn get(&self, hash: &ContentHash) -> Option<&FileDescriptor> {
        self.index.get(hash).map(|&pos| &self.entries[pos])
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.index.contains_key(hash)
    }

    /// First entry (in insertion order) with the given relative path.
    pub fn find_by_path(&self, relative_path: &str) -> Option<&FileDescriptor> {
        self.entries
            .iter()
            .find(|entry| entry.relative_path() == relative_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<FileDescriptor> for Partition {
    fn from_iter<I: IntoIterator<Item = FileDescriptor>>(iter: I) -> Self {
        let mut partition = Partition::new();
        for descriptor in iter {
            partition.insert(descriptor);
        }
        partition
    }
}

impl Serialize for Partition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(entry.content_hash(), entry)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Partition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PartitionVisitor;

        impl<'de> Visitor<'de> for PartitionVisitor {
            type Value = Partition;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map from content hash to file descriptor")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Partition, A::Error> {
                let mut partition = Partition::new();
                while let Some((_, descriptor)) =
                    access.next_entry::<ContentHash, FileDescriptor>()?
                {
                    partition.insert(descriptor);
                }
                Ok(partition)
            }
        }

        deserializer.deserialize_map(PartitionVisitor)
    }
}

/// The four partitions of a state plus the producer-supplied file count.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFiles {
    pub count: u64,
    pub added: Partition,
    pub modified: Partition,
    pub removed: Partition,
    pub intact: Partition,
}

#[derive(Serialize)]
struct RecordOut<'a> {
    format_version: u32,
    files: &'a StateFiles,
}

#[derive(Deserialize)]
struct RecordHeader {
    format_version: u32,
}

#[derive(Deserialize)]
struct RecordIn {
    files: StateFiles,
}

/// Write a state record, replacing the file atomically.
pub(crate) fn write_record(dir: &Path, files: &StateFiles) -> Result<()> {
    let encoded = serde_json::to_vec_pretty(&RecordOut {
        format_version: RECORD_VERSION,
        files,
    })?;

    let tmp = dir.join(format!("{}.tmp", RECORD_FILE));
    fs::write(&tmp, encoded)?;
    fs::File::open(&tmp)?.sync_all()?;
    fs::rename(&tmp, dir.join(RECORD_FILE))?;
    Ok(())
}

/// Read a state record. Newer format versions are rejected.
pub(crate) fn read_record(dir: &Path) -> Result<StateFiles> {
    let data = fs::read(dir.join(RECORD_FILE))?;

    let header: RecordHeader =
        serde_json::from_slice(&data).map_err(|e| VaultError::Deserialization(e.to_string()))?;
    if header.format_version > RECORD_VERSION {
        return Err(VaultError::InvalidFormat(format!(
            "Unsupported state record version: {}",
            header.format_version
        )));
    }

    let record: RecordIn =
        serde_json::from_slice(&data).map_err(|e| VaultError::Deserialization(e.to_string()))?;
    Ok(record.files)
}

//! All-or-nothing batches of blob writes and deletes.

use super::storage::ContentStore;
use crate::error::{Result, VaultError};
use crate::types::{ContentHash, FileDescriptor, StateId};
use crate::wal::WalOperation;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Answers whether content is still needed by a surviving state.
///
/// The content store never removes a blob while it is claimed.
pub trait ContentClaims {
    /// Whether any state other than `releasing` still has `hash`.
    fn is_claimed(&self, hash: &ContentHash, releasing: Option<StateId>) -> Result<bool>;
}

impl<F> ContentClaims for F
where
    F: Fn(&ContentHash, Option<StateId>) -> Result<bool>,
{
    fn is_claimed(&self, hash: &ContentHash, releasing: Option<StateId>) -> Result<bool> {
        self(hash, releasing)
    }
}

/// Outcome of a completed transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionSummary {
    /// Blobs newly written to the store.
    pub written: usize,
    /// Added files whose content was already stored.
    pub deduplicated: usize,
    /// Blobs physically removed.
    pub deleted: usize,
    /// Deletions skipped because another state still claims the content.
    pub retained: usize,
}

/// A batch of content writes and deletes on behalf of one state.
///
/// Nothing touches the store until [`complete`](Self::complete). If it
/// fails before the batch is journaled as committed, blobs placed by this
/// transaction are removed again and nothing is deleted.
pub struct ContentTransaction<'a> {
    store: &'a ContentStore,
    state_id: StateId,
    source_root: PathBuf,
    adds: Vec<FileDescriptor>,
    deletes: Vec<FileDescriptor>,
}

impl<'a> ContentTransaction<'a> {
    pub(crate) fn new(store: &'a ContentStore, state_id: StateId, source_root: PathBuf) -> Self {
        Self {
            store,
            state_id,
            source_root,
            adds: Vec::new(),
            deletes: Vec::new(),
        }
    }

    /// Queue a file whose content must be persisted.
    pub fn add_file(&mut self, descriptor: FileDescriptor) {
        self.adds.push(descriptor);
    }

    /// Queue a file whose content this state no longer claims.
    pub fn delete_file(&mut self, descriptor: FileDescriptor) {
        self.deletes.push(descriptor);
    }

    pub fn pending_adds(&self) -> &[FileDescriptor] {
        &self.adds
    }

    pub fn pending_deletes(&self) -> &[FileDescriptor] {
        &self.deletes
    }

    pub fn state_id(&self) -> StateId {
        self.state_id
    }

    /// Apply every queued write and delete as one unit.
    pub fn complete(self, claims: &dyn ContentClaims) -> Result<TransactionSummary> {
        let mut summary = TransactionSummary::default();
        if self.adds.is_empty() && self.deletes.is_empty() {
            return Ok(summary);
        }

        let mut staged: Vec<(ContentHash, PathBuf)> = Vec::new();
        let mut added: HashSet<&ContentHash> = HashSet::new();

        for descriptor in &self.adds {
            let hash = descriptor.content_hash();
            if !added.insert(hash) {
                continue;
            }
            if self.store.exists(hash) {
                summary.deduplicated += 1;
                continue;
            }
            match self.store.stage(&descriptor.resolve(&self.source_root), hash) {
                Ok(path) => staged.push((hash.clone(), path)),
                Err(e) => {
                    discard_staged(&staged);
                    return Err(e);
                }
            }
        }

        let mut doomed: Vec<ContentHash> = Vec::new();
        let mut seen: HashSet<&ContentHash> = HashSet::new();
        for descriptor in &self.deletes {
            let hash = descriptor.content_hash();
            if !seen.insert(hash) {
                continue;
            }
            if added.contains(hash) {
                summary.retained += 1;
                continue;
            }
            match claims.is_claimed(hash, Some(self.state_id)) {
                Ok(true) => summary.retained += 1,
                Ok(false) => doomed.push(hash.clone()),
                Err(e) => {
                    discard_staged(&staged);
                    return Err(e);
                }
            }
        }

        let journal = self.store.journal();
        let seq = match journal.log(WalOperation::Transaction {
            state_id: self.state_id,
            placed: staged.iter().map(|(hash, _)| hash.clone()).collect(),
            deleted: doomed.clone(),
        }) {
            Ok(seq) => seq,
            Err(e) => {
                discard_staged(&staged);
                return Err(e);
            }
        };

        for (index, (hash, path)) in staged.iter().enumerate() {
            if let Err(e) = self.store.place(path, hash) {
                warn!(state = %self.state_id, hash = %hash, error = %e, "placing blob failed, rolling back");
                discard_staged(&staged[index..]);
                for (placed, _) in &staged[..index] {
                    self.store.delete(placed)?;
                }
                journal.commit(seq)?;
                return Err(VaultError::Transaction(format!(
                    "failed to place blob {}: {}",
                    hash, e
                )));
            }
            summary.written += 1;
        }

        for hash in &doomed {
            if self.store.delete(hash)? {
                summary.deleted += 1;
            }
        }

        journal.commit(seq)?;
        journal.clear()?;

        info!(
            state = %self.state_id,
            written = summary.written,
            deduplicated = summary.deduplicated,
            deleted = summary.deleted,
            retained = summary.retained,
            "content transaction complete"
        );
        Ok(summary)
    }
}

fn discard_staged(staged: &[(ContentHash, PathBuf)]) {
    for (hash, path) in staged {
        if let Err(e) = fs::remove_file(path) {
            debug!(hash = %hash, error = %e, "could not discard staged blob");
        }
    }
}

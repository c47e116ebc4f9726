//! Snapshot construction, persistence and reference release.

use super::files::{read_record, write_record, StateFiles, RECORD_FILE};
use crate::blobs::{ContentClaims, ContentStore, TransactionSummary};
use crate::error::{Result, VaultError};
use crate::repository::RepoToken;
use crate::types::{ContentHash, FileDescriptor, Scope, StateId, UnstagedDiff};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What a state needs from the repository that owns it.
pub trait StateRegistry {
    /// Base directory holding one directory per state.
    fn states_path(&self) -> &Path;

    /// Id the next commit will receive.
    fn next_state_id(&self) -> StateId;

    /// Resolve (and create) the directory for a state id.
    fn new_state_path_by_id(&self, id: StateId) -> Result<PathBuf>;

    /// `Ok` if a state record exists for `id`, `StateNotFound` otherwise.
    fn is_valid_state(&self, id: StateId) -> Result<()>;

    /// Tracked root that added files are read from.
    fn source_root(&self) -> &Path;

    fn content_store(&self) -> &ContentStore;

    /// Snapshot of which surviving states have which content, taken once
    /// per content transaction.
    fn content_claims(&self) -> Result<Box<dyn ContentClaims + '_>>;

    /// Whether `token` was minted by this repository.
    fn authorizes(&self, token: &RepoToken) -> bool;
}

/// One snapshot of the tracked files.
///
/// A state is either uncommitted (no id, empty partitions) or committed
/// (id set, partitions persisted). Committed states are never modified.
#[derive(Clone, Debug, Default)]
pub struct State {
    id: Option<StateId>,
    path: Option<PathBuf>,
    files: StateFiles,
}

impl State {
    /// A fresh, uncommitted state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a committed state from storage.
    pub fn load<R: StateRegistry + ?Sized>(registry: &R, id: StateId) -> Result<Self> {
        let path = registry.states_path().join(id.to_string());
        if !path.join(RECORD_FILE).exists() {
            return Err(VaultError::StateNotFound(id));
        }

        let files = read_record(&path)?;
        debug!(state = %id, count = files.count, "loaded state");

        Ok(Self {
            id: Some(id),
            path: Some(path),
            files,
        })
    }

    /// Commit `diff` as the repository's next state.
    ///
    /// Content of added and modified files is written to the content store
    /// first; the state record is written only after that succeeds. On any
    /// failure this state stays uncommitted and no record exists.
    pub fn commit<R: StateRegistry + ?Sized>(
        &mut self,
        registry: &R,
        token: &RepoToken,
        message: &str,
        diff: &UnstagedDiff,
    ) -> Result<TransactionSummary> {
        if !registry.authorizes(token) {
            return Err(VaultError::UnauthorizedCaller);
        }

        if let Some(id) = self.id {
            return Err(VaultError::AlreadyCommitted(id));
        }
        let state_id = registry.next_state_id();
        match registry.is_valid_state(state_id) {
            Ok(()) => return Err(VaultError::AlreadyCommitted(state_id)),
            Err(VaultError::StateNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if message.is_empty() {
            return Err(VaultError::EmptyCommitMessage);
        }

        diff.validate()?;

        let mut files = StateFiles {
            count: diff.count,
            ..Default::default()
        };
        let store = registry.content_store();
        let mut txn = store.begin(state_id, registry.source_root());

        for descriptor in &diff.added {
            txn.add_file(descriptor.clone());
            files.added.insert(descriptor.clone());
        }
        for descriptor in &diff.modified {
            txn.add_file(descriptor.clone());
            files.modified.insert(descriptor.clone());
        }
        for descriptor in &diff.removed {
            files.removed.insert(descriptor.clone());
        }
        for descriptor in &diff.intact {
            files.intact.insert(descriptor.clone());
        }

        let claims = registry.content_claims()?;
        let summary = txn.complete(&*claims)?;

        let path = match registry
            .new_state_path_by_id(state_id)
            .and_then(|path| write_record(&path, &files).map(|_| path))
        {
            Ok(path) => path,
            Err(e) => {
                warn!(state = %state_id, error = %e, "state record not written, releasing content");
                release_content(registry, state_id, &files);
                return Err(e);
            }
        };

        info!(
            state = %state_id,
            count = files.count,
            added = files.added.len(),
            modified = files.modified.len(),
            removed = files.removed.len(),
            intact = files.intact.len(),
            "committed state"
        );

        self.id = Some(state_id);
        self.path = Some(path);
        self.files = files;
        Ok(summary)
    }

    /// Release this state's claim on the content it introduced.
    ///
    /// Only added and modified files are submitted for deletion; the
    /// content store keeps any blob another state still has. Uncommitted
    /// states introduced nothing, so this is a no-op for them.
    pub fn break_references<R: StateRegistry + ?Sized>(
        &self,
        registry: &R,
        token: &RepoToken,
    ) -> Result<TransactionSummary> {
        if !registry.authorizes(token) {
            return Err(VaultError::UnauthorizedCaller);
        }

        let Some(state_id) = self.id else {
            return Ok(TransactionSummary::default());
        };

        let mut txn = registry
            .content_store()
            .begin(state_id, registry.source_root());
        for descriptor in self.files.added.iter().chain(self.files.modified.iter()) {
            txn.delete_file(descriptor.clone());
        }

        let claims = registry.content_claims()?;
        let summary = txn.complete(&*claims)?;
        info!(
            state = %state_id,
            deleted = summary.deleted,
            retained = summary.retained,
            "broke state references"
        );
        Ok(summary)
    }

    /// Whether this state has the content available (removed excluded).
    pub fn has_file(&self, hash: &ContentHash) -> bool {
        self.files.added.contains(hash)
            || self.files.modified.contains(hash)
            || self.files.intact.contains(hash)
    }

    /// Find a tracked file by relative path.
    ///
    /// `Scope::Any` searches intact, then modified, then added. Removed
    /// files are never returned.
    pub fn has_relative_path(&self, relative_path: &str, scope: Scope) -> Option<&FileDescriptor> {
        match scope {
            Scope::Any => self
                .files
                .intact
                .find_by_path(relative_path)
                .or_else(|| self.files.modified.find_by_path(relative_path))
                .or_else(|| self.files.added.find_by_path(relative_path)),
            Scope::Added => self.files.added.find_by_path(relative_path),
            Scope::Modified => self.files.modified.find_by_path(relative_path),
            Scope::Intact => self.files.intact.find_by_path(relative_path),
        }
    }

    /// Like [`has_relative_path`](Self::has_relative_path) with the scope
    /// given by name.
    pub fn lookup(&self, relative_path: &str, scope: &str) -> Result<Option<&FileDescriptor>> {
        let scope = scope.parse::<Scope>()?;
        Ok(self.has_relative_path(relative_path, scope))
    }

    /// Files present in this state: intact, modified and added.
    pub fn tracked(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.files
            .intact
            .iter()
            .chain(self.files.modified.iter())
            .chain(self.files.added.iter())
    }

    pub fn id(&self) -> Option<StateId> {
        self.id
    }

    pub fn storage_location(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn files(&self) -> &StateFiles {
        &self.files
    }

    pub fn is_committed(&self) -> bool {
        self.id.is_some()
    }
}

/// Undo the content writes of a commit whose record could not be written.
fn release_content<R: StateRegistry + ?Sized>(registry: &R, state_id: StateId, files: &StateFiles) {
    let mut txn = registry
        .content_store()
        .begin(state_id, registry.source_root());
    for descriptor in files.added.iter().chain(files.modified.iter()) {
        txn.delete_file(descriptor.clone());
    }
    if let Err(e) = registry
        .content_claims()
        .and_then(|claims| txn.complete(&*claims))
    {
        warn!(state = %state_id, error = %e, "could not release content of failed commit");
    }

    let dir = registry.states_path().join(state_id.to_string());
    if dir.exists() && !dir.join(RECORD_FILE).exists() {
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!(state = %state_id, error = %e, "could not remove empty state directory");
        }
    }
}

//! Repository orchestrating states, the content store and the working tree.

use crate::blobs::{ContentClaims, ContentStore};
use crate::error::{Result, VaultError};
use crate::scanner;
use crate::state::{State, StateRegistry, RECORD_FILE};
use crate::types::{
    ContentHash, RepoStats, Scope, StateId, StateSummary, Timestamp, UnstagedDiff,
};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name of the metadata directory inside the tracked root.
pub const META_DIR: &str = ".snapvault";

/// Magic bytes for the repository manifest.
const REPO_MAGIC: &[u8; 4] = b"SVR\0";

/// Current repository format version.
const REPO_VERSION: u8 = 1;

/// Id given to the first committed state.
const FIRST_STATE_ID: StateId = StateId(1);

/// Repository configuration.
#[derive(Clone, Debug)]
pub struct RepoConfig {
    /// Tracked root directory.
    pub root: PathBuf,

    /// Blob read cache size (number of blobs).
    pub blob_cache_size: usize,

    /// Whether to create the repository if it doesn't exist.
    pub create_if_missing: bool,

    /// File or directory names skipped when scanning the working tree.
    pub ignored: Vec<String>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            blob_cache_size: 256,
            create_if_missing: true,
            ignored: Vec::new(),
        }
    }
}

/// Capability proving a call comes from the repository.
///
/// Only [`Repository`] can mint one, and a state accepts it only from the
/// repository whose id it carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoToken {
    repo_id: String,
}

impl RepoToken {
    pub(crate) fn new(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
        }
    }
}

/// Repository index stored in `repo.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct RepoIndex {
    repo_id: String,
    next_state_id: StateId,
    active_state: Option<StateId>,
    states: Vec<StateSummary>,
}

/// A versioned working tree.
///
/// Holds an exclusive lock on the metadata directory for its lifetime; a
/// second `open` of the same repository fails with [`VaultError::Locked`].
pub struct Repository {
    config: RepoConfig,
    meta_path: PathBuf,
    states_path: PathBuf,
    _lock_file: File,
    store: ContentStore,
    index: RepoIndex,
    token: RepoToken,
}

impl Repository {
    /// Open an existing repository or create a new one.
    pub fn open_or_create(config: RepoConfig) -> Result<Self> {
        if config.root.join(META_DIR).exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(VaultError::NotInitialized)
        }
    }

    /// Create a new repository in `config.root`.
    pub fn create(config: RepoConfig) -> Result<Self> {
        let meta_path = config.root.join(META_DIR);
        if meta_path.join("MANIFEST").exists() {
            return Err(VaultError::InvalidFormat(format!(
                "Repository already exists at {}",
                meta_path.display()
            )));
        }
        fs::create_dir_all(meta_path.join("states"))?;
        fs::create_dir_all(meta_path.join("data"))?;

        Self::write_manifest(&meta_path)?;
        let lock_file = Self::acquire_lock(&meta_path)?;

        let index = RepoIndex {
            repo_id: Self::generate_repo_id(&config.root),
            next_state_id: FIRST_STATE_ID,
            active_state: None,
            states: Vec::new(),
        };
        Self::save_index_at(&meta_path, &index)?;

        let repo = Self::assemble(config, meta_path, lock_file, index)?;
        info!(root = %repo.config.root.display(), "created repository");
        Ok(repo)
    }

    /// Open an existing repository, resolving any interrupted transaction.
    pub fn open(config: RepoConfig) -> Result<Self> {
        let meta_path = config.root.join(META_DIR);
        if !meta_path.exists() {
            return Err(VaultError::NotInitialized);
        }

        Self::verify_manifest(&meta_path)?;
        let lock_file = Self::acquire_lock(&meta_path)?;

        let data = fs::read(meta_path.join("repo.json"))?;
        let index: RepoIndex =
            serde_json::from_slice(&data).map_err(|e| VaultError::Deserialization(e.to_string()))?;

        let repo = Self::assemble(config, meta_path, lock_file, index)?;
        let recovered = repo.store.recover(&repo.claim_set()?)?;
        if recovered > 0 {
            warn!(recovered, "resolved interrupted content transactions");
        }
        let discarded = repo.discard_unindexed()?;
        if discarded > 0 {
            warn!(discarded, "discarded states missing from the index");
        }
        Ok(repo)
    }

    fn assemble(config: RepoConfig, meta_path: PathBuf, lock_file: File, index: RepoIndex) -> Result<Self> {
        let store = ContentStore::new(
            meta_path.join("data"),
            meta_path.join("txn.log"),
            config.blob_cache_size,
        )?;
        let token = RepoToken::new(index.repo_id.clone());

        Ok(Self {
            states_path: meta_path.join("states"),
            meta_path,
            config,
            _lock_file: lock_file,
            store,
            index,
            token,
        })
    }

    // --- Working Tree ---

    /// Diff of the working tree against the active state.
    pub fn status(&self) -> Result<UnstagedDiff> {
        let active = self.active_state()?;
        scanner::scan(&self.config.root, META_DIR, &self.config.ignored, active.as_ref())
    }

    /// Scan the working tree and commit the result as a new state.
    ///
    /// Fails with [`VaultError::NothingToCommit`] when nothing changed, and
    /// also when the working tree holds no files at all: a state always
    /// tracks at least one file.
    pub fn commit(&mut self, message: &str) -> Result<StateId> {
        let diff = self.status()?;
        if diff.count == 0 || !diff.has_changes() {
            return Err(VaultError::NothingToCommit);
        }
        self.commit_diff(message, &diff)
    }

    /// Commit an externally produced diff as a new state.
    pub fn commit_diff(&mut self, message: &str, diff: &UnstagedDiff) -> Result<StateId> {
        let mut state = State::new();
        state.commit(&*self, &self.token, message, diff)?;

        let id = state
            .id()
            .ok_or_else(|| VaultError::Transaction("committed state has no id".into()))?;

        let previous = self.index.clone();
        self.index.states.push(StateSummary {
            id,
            message: message.to_string(),
            timestamp: Timestamp::now(),
            count: state.files().count,
        });
        self.index.next_state_id = id.next();
        self.index.active_state = Some(id);

        if let Err(e) = self.save_index() {
            warn!(state = %id, error = %e, "index not saved, discarding state");
            self.index = previous;
            self.discard(&state);
            return Err(e);
        }

        Ok(id)
    }

    /// Make the working tree match state `id`.
    ///
    /// Files tracked by the active state but absent from `id` are deleted;
    /// untracked files are left alone.
    ///
    /// A state keeps one descriptor per content hash. When several files
    /// had identical content at commit time only the first path was
    /// recorded, so only that path is written back. The others are
    /// treated as absent from `id` and deleted if the active state
    /// tracked them.
    pub fn restore_state(&mut self, id: StateId) -> Result<()> {
        self.ensure_known(id)?;
        let target = State::load(self, id)?;

        if let Some(active) = self.active_state()? {
            for descriptor in active.tracked() {
                let path = descriptor.relative_path();
                if target.has_relative_path(path, Scope::Any).is_none() {
                    let file = descriptor.resolve(&self.config.root);
                    if file.exists() {
                        fs::remove_file(&file)?;
                    }
                }
            }
        }

        for descriptor in target.tracked() {
            self.store.restore(descriptor, &self.config.root)?;
        }

        self.index.active_state = Some(id);
        self.save_index()?;

        info!(state = %id, "restored state");
        Ok(())
    }

    /// Discard state `id`: release its content and delete its record.
    pub fn remove_state(&mut self, id: StateId) -> Result<()> {
        self.ensure_known(id)?;
        let state = State::load(self, id)?;

        state.break_references(&*self, &self.token)?;
        if let Some(dir) = state.storage_location() {
            fs::remove_dir_all(dir)?;
        }

        self.index.states.retain(|summary| summary.id != id);
        if self.index.active_state == Some(id) {
            self.index.active_state = self.index.states.last().map(|summary| summary.id);
        }
        self.save_index()?;

        info!(state = %id, "removed state");
        Ok(())
    }

    /// Keep only the newest `keep_last` states, then collect garbage.
    ///
    /// Returns the ids of the removed states.
    pub fn prune(&mut self, keep_last: usize) -> Result<Vec<StateId>> {
        let excess = self.index.states.len().saturating_sub(keep_last);
        let doomed: Vec<StateId> = self.index.states[..excess]
            .iter()
            .map(|summary| summary.id)
            .collect();

        for &id in &doomed {
            self.remove_state(id)?;
        }
        self.gc()?;

        Ok(doomed)
    }

    /// Delete every blob no surviving state has.
    pub fn gc(&self) -> Result<Vec<ContentHash>> {
        let claims = self.claim_set()?;
        self.store.collect_garbage(&claims)
    }

    // --- Queries ---

    pub fn load_state(&self, id: StateId) -> Result<State> {
        State::load(self, id)
    }

    /// The state the working tree was last committed or restored to.
    pub fn active_state(&self) -> Result<Option<State>> {
        self.index
            .active_state
            .map(|id| State::load(self, id))
            .transpose()
    }

    pub fn active_state_id(&self) -> Option<StateId> {
        self.index.active_state
    }

    pub fn states(&self) -> &[StateSummary] {
        &self.index.states
    }

    pub fn has_state(&self, id: StateId) -> bool {
        self.index.states.iter().any(|summary| summary.id == id)
    }

    pub fn stats(&self) -> Result<RepoStats> {
        Ok(RepoStats {
            state_count: self.index.states.len() as u64,
            blob_count: self.store.list()?.len() as u64,
            blob_size_bytes: self.store.total_size()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn path(&self) -> &Path {
        &self.meta_path
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.store
    }

    // --- Private Helpers ---

    fn ensure_known(&self, id: StateId) -> Result<()> {
        if self.has_state(id) {
            Ok(())
        } else {
            Err(VaultError::StateNotFound(id))
        }
    }

    /// Best-effort removal of a state that was committed but not indexed.
    fn discard(&self, state: &State) {
        if let Err(e) = state.break_references(self, &self.token) {
            warn!(error = %e, "could not release content of discarded state");
        }
        if let Some(dir) = state.storage_location() {
            if let Err(e) = fs::remove_dir_all(dir) {
                warn!(error = %e, "could not remove discarded state record");
            }
        }
    }

    /// Which indexed states have which content.
    fn claim_set(&self) -> Result<ClaimSet> {
        let mut owners: HashMap<ContentHash, Vec<StateId>> = HashMap::new();
        for summary in &self.index.states {
            let state = State::load(self, summary.id)?;
            for descriptor in state.tracked() {
                owners
                    .entry(descriptor.content_hash().clone())
                    .or_default()
                    .push(summary.id);
            }
        }
        Ok(ClaimSet(owners))
    }

    /// Remove state directories the index does not know about.
    ///
    /// A crash between writing a state record and saving the index leaves
    /// such a directory in the slot of the next commit. Its content is
    /// released and the directory deleted, so the slot is free again.
    fn discard_unindexed(&self) -> Result<usize> {
        let known: HashSet<StateId> =
            self.index.states.iter().map(|summary| summary.id).collect();
        let mut discarded = 0;

        for entry in fs::read_dir(&self.states_path)? {
            let entry = entry?;
            let id = match entry.file_name().to_str().and_then(|name| name.parse::<u64>().ok()) {
                Some(id) => StateId(id),
                None => continue,
            };
            if known.contains(&id) || !entry.file_type()?.is_dir() {
                continue;
            }

            if entry.path().join(RECORD_FILE).exists() {
                match State::load(self, id) {
                    Ok(state) => {
                        state.break_references(self, &self.token)?;
                    }
                    Err(e) => {
                        warn!(state = %id, error = %e, "unindexed state unreadable, leaving its content to gc");
                    }
                }
            }
            fs::remove_dir_all(entry.path())?;
            warn!(state = %id, "discarded unindexed state");
            discarded += 1;
        }

        Ok(discarded)
    }

    fn save_index(&self) -> Result<()> {
        Self::save_index_at(&self.meta_path, &self.index)
    }

    fn save_index_at(meta_path: &Path, index: &RepoIndex) -> Result<()> {
        let tmp = meta_path.join("repo.json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(index)?)?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, meta_path.join("repo.json"))?;
        Ok(())
    }

    fn generate_repo_id(root: &Path) -> String {
        let mut hasher = Sha256::new();
        hasher.update(root.to_string_lossy().as_bytes());
        hasher.update(std::process::id().to_le_bytes());
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        hasher.update(nanos.to_le_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    fn write_manifest(meta_path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(meta_path.join("MANIFEST"))?;
        file.write_all(REPO_MAGIC)?;
        file.write_all(&[REPO_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(meta_path: &Path) -> Result<()> {
        use std::io::Read;

        let mut file = File::open(meta_path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != REPO_MAGIC {
            return Err(VaultError::InvalidFormat("Invalid repository magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != REPO_VERSION {
            return Err(VaultError::InvalidFormat(format!(
                "Unsupported repository version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(meta_path: &Path) -> Result<File> {
        let lock_file = File::create(meta_path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| VaultError::Locked)?;
        Ok(lock_file)
    }
}

impl StateRegistry for Repository {
    fn states_path(&self) -> &Path {
        &self.states_path
    }

    fn next_state_id(&self) -> StateId {
        self.index.next_state_id
    }

    fn new_state_path_by_id(&self, id: StateId) -> Result<PathBuf> {
        let path = self.states_path.join(id.to_string());
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    fn is_valid_state(&self, id: StateId) -> Result<()> {
        if self.states_path.join(id.to_string()).join(RECORD_FILE).exists() {
            Ok(())
        } else {
            Err(VaultError::StateNotFound(id))
        }
    }

    fn source_root(&self) -> &Path {
        &self.config.root
    }

    fn content_store(&self) -> &ContentStore {
        &self.store
    }

    fn content_claims(&self) -> Result<Box<dyn ContentClaims + '_>> {
        Ok(Box::new(self.claim_set()?))
    }

    fn authorizes(&self, token: &RepoToken) -> bool {
        *token == self.token
    }
}

/// Content owners of every indexed state, loaded once.
struct ClaimSet(HashMap<ContentHash, Vec<StateId>>);

impl ContentClaims for ClaimSet {
    fn is_claimed(&self, hash: &ContentHash, releasing: Option<StateId>) -> Result<bool> {
        Ok(self
            .0
            .get(hash)
            .is_some_and(|owners| owners.iter().any(|&id| Some(id) != releasing)))
    }
}

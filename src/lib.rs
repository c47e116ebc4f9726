//! # snapvault
//!
//! A file-level versioning engine: an append-only sequence of immutable
//! states, each recording which files were added, modified, removed or left
//! intact, with file content stored once per content hash.
//!
//! ## Core Concepts
//!
//! - **States**: Snapshots partitioned by change class, committed once
//! - **Content store**: Deduplicated blobs, written and deleted in journaled transactions
//! - **Breaking references**: Releasing the content a discarded state introduced
//! - **Repository**: Allocates state ids, scans the working tree, restores and prunes
//!
//! ## Example
//!
//! ```ignore
//! use snapvault::{RepoConfig, Repository};
//!
//! let mut repo = Repository::open_or_create(RepoConfig {
//!     root: "./project".into(),
//!     ..Default::default()
//! })?;
//!
//! let first = repo.commit("initial import")?;
//! std::fs::write("./project/notes.txt", "changed")?;
//! repo.commit("edit notes")?;
//!
//! // Roll the working tree back and drop old history.
//! repo.restore_state(first)?;
//! repo.prune(5)?;
//! ```

pub mod blobs;
pub mod error;
pub mod repository;
pub mod scanner;
pub mod state;
pub mod types;
pub mod wal;

// Re-exports
pub use blobs::{ContentClaims, ContentStore, ContentTransaction, TransactionSummary};
pub use error::{Result, VaultError};
pub use repository::{RepoConfig, RepoToken, Repository, META_DIR};
pub use state::{Partition, State, StateFiles, StateRegistry, RECORD_FILE};
pub use types::*;
pub use wal::{WalEntry, WalEntryStatus, WalOperation, WriteAheadLog};

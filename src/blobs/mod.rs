//! Content-addressed blob storage.
//!
//! Blobs are stored by their SHA-256 hash, sharded into directories by the
//! first byte of the hash. All writes and deletes go through transactions.

mod storage;
mod transaction;

pub use storage::ContentStore;
pub use transaction::{ContentClaims, ContentTransaction, TransactionSummary};

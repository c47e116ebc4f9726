//! Snapshots of the tracked file set.
//!
//! A state records which files were added, modified, removed or left intact
//! relative to its predecessor. States are committed once and never change
//! afterwards; discarding one releases the content it introduced.

mod files;
mod snapshot;

pub use files::{Partition, StateFiles, RECORD_FILE, RECORD_VERSION};
pub use snapshot::{State, StateRegistry};

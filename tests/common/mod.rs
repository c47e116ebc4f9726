//! Shared fixtures for integration tests.

#![allow(dead_code)]

use snapvault::{RepoConfig, Repository};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn test_config(dir: &TempDir) -> RepoConfig {
    RepoConfig {
        root: dir.path().join("work"),
        blob_cache_size: 16,
        create_if_missing: true,
        ignored: vec!["scratch".to_string()],
    }
}

pub fn test_repo(dir: &TempDir) -> Repository {
    init_tracing();
    Repository::create(test_config(dir)).unwrap()
}

pub fn open_repo(dir: &TempDir) -> Repository {
    Repository::open(test_config(dir)).unwrap()
}

pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

pub fn read(root: &Path, rel: &str) -> String {
    fs::read_to_string(root.join(rel)).unwrap()
}

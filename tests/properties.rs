//! Property tests for state membership and scanning.

mod common;

use common::{test_repo, write};
use proptest::prelude::*;
use snapvault::{ContentHash, FileDescriptor, Scope, UnstagedDiff};
use std::collections::BTreeMap;
use tempfile::TempDir;

/// Partition a file lands in: 0 added, 1 modified, 2 removed, 3 intact.
fn files_strategy() -> impl Strategy<Value = BTreeMap<String, u8>> {
    prop::collection::btree_map("[a-z]{1,12}", 0u8..4, 1..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn has_file_matches_present_partitions(files in files_strategy()) {
        let dir = TempDir::new().unwrap();
        let mut repo = test_repo(&dir);
        let root = repo.root().to_path_buf();

        let mut diff = UnstagedDiff::default();
        for (i, (content, class)) in files.iter().enumerate() {
            let path = format!("f{}", i);
            let fd = FileDescriptor::new(path.clone(), ContentHash::of(content.as_bytes()), path.clone());
            match class {
                0 => { write(&root, &path, content); diff.added.push(fd) }
                1 => { write(&root, &path, content); diff.modified.push(fd) }
                2 => diff.removed.push(fd),
                _ => diff.intact.push(fd),
            }
        }
        diff.count = files.len() as u64;

        let id = repo.commit_diff("prop", &diff).unwrap();
        let state = repo.load_state(id).unwrap();

        for (content, class) in &files {
            let hash = ContentHash::of(content.as_bytes());
            prop_assert_eq!(state.has_file(&hash), *class != 2);
            prop_assert_eq!(repo.content_store().exists(&hash), *class < 2);
        }
        prop_assert!(!state.has_file(&ContentHash::of(b"never tracked")));
    }

    #[test]
    fn scan_accounts_for_every_file(files in files_strategy()) {
        let dir = TempDir::new().unwrap();
        let mut repo = test_repo(&dir);
        let root = repo.root().to_path_buf();

        for (i, content) in files.keys().enumerate() {
            write(&root, &format!("dir{}/f{}", i % 3, i), content);
        }
        let id = repo.commit("first").unwrap();
        let state = repo.load_state(id).unwrap();

        prop_assert_eq!(state.files().count, files.len() as u64);
        prop_assert_eq!(state.files().added.len(), files.len());
        for i in 0..files.len() {
            let path = format!("dir{}/f{}", i % 3, i);
            prop_assert!(state.has_relative_path(&path, Scope::Added).is_some());
            prop_assert!(state.has_relative_path(&path, Scope::Intact).is_none());
        }

        let status = repo.status().unwrap();
        prop_assert!(!status.has_changes());
        prop_assert_eq!(status.intact.len(), files.len());
    }
}

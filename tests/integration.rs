//! Integration tests for repository workflows.

mod common;

use common::{open_repo, read, test_repo, write};
use snapvault::{
    ContentHash, FileDescriptor, Scope, StateId, UnstagedDiff, VaultError, WalOperation,
    WriteAheadLog, META_DIR,
};
use std::fs;
use tempfile::TempDir;

// --- Commit Workflows ---

#[test]
fn test_commit_classifies_changes() {
    let dir = TempDir::new().unwrap();
    let mut repo = test_repo(&dir);
    let root = repo.root().to_path_buf();

    write(&root, "a.txt", "one");
    write(&root, "docs/b.txt", "two");
    let first = repo.commit("initial import").unwrap();
    assert_eq!(first, StateId(1));

    let state = repo.load_state(first).unwrap();
    assert_eq!(state.files().count, 2);
    assert_eq!(state.files().added.len(), 2);
    assert!(state.has_relative_path("docs/b.txt", Scope::Added).is_some());

    write(&root, "a.txt", "one, revised");
    fs::remove_file(root.join("docs/b.txt")).unwrap();
    write(&root, "c.txt", "three");
    let second = repo.commit("revise").unwrap();
    assert_eq!(second, StateId(2));

    let state = repo.load_state(second).unwrap();
    let files = state.files();
    assert_eq!(files.count, 2);
    assert_eq!(files.modified.iter().next().unwrap().relative_path(), "a.txt");
    assert_eq!(files.added.iter().next().unwrap().relative_path(), "c.txt");
    assert_eq!(files.removed.iter().next().unwrap().relative_path(), "docs/b.txt");
    assert!(files.intact.is_empty());

    assert!(state.has_file(&ContentHash::of(b"three")));
    assert!(!state.has_file(&ContentHash::of(b"two")));

    assert_eq!(repo.states().len(), 2);
    assert_eq!(repo.states()[1].message, "revise");
    assert_eq!(repo.active_state_id(), Some(second));
}

#[test]
fn test_unchanged_tree_has_nothing_to_commit() {
    let dir = TempDir::new().unwrap();
    let mut repo = test_repo(&dir);
    let root = repo.root().to_path_buf();

    write(&root, "a.txt", "one");
    repo.commit("initial").unwrap();

    // Ignored names never show up as changes.
    write(&root, "scratch/tmp.txt", "noise");
    assert!(matches!(repo.commit("again"), Err(VaultError::NothingToCommit)));

    let status = repo.status().unwrap();
    assert_eq!(status.count, 1);
    assert_eq!(status.intact.len(), 1);
}

#[test]
fn test_identical_content_is_stored_once() {
    let dir = TempDir::new().unwrap();
    let mut repo = test_repo(&dir);
    let root = repo.root().to_path_buf();

    write(&root, "a.txt", "shared");
    repo.commit("first").unwrap();

    write(&root, "copy/a.txt", "shared");
    write(&root, "other.txt", "other");
    repo.commit("second").unwrap();

    let stats = repo.stats().unwrap();
    assert_eq!(stats.state_count, 2);
    assert_eq!(stats.blob_count, 2);
}

#[test]
fn test_commit_external_diff() {
    let dir = TempDir::new().unwrap();
    let mut repo = test_repo(&dir);
    let root = repo.root().to_path_buf();
    write(&root, "a", "content A");

    let hash_a = ContentHash::of(b"content A");
    let hash_b = ContentHash::of(b"content B");
    let json = format!(
        r#"{{
            "count": 2,
            "added": [{{"display_name": "A", "content_hash": "{a}", "relative_path": "/a"}}],
            "modified": [],
            "removed": [],
            "intact": [{{"display_name": "B", "content_hash": "{b}", "relative_path": "/b"}}]
        }}"#,
        a = hash_a,
        b = hash_b
    );
    let diff = UnstagedDiff::from_json(json.as_bytes()).unwrap();

    let id = repo.commit_diff("external", &diff).unwrap();
    let state = repo.load_state(id).unwrap();

    let a = FileDescriptor::new("A", hash_a.clone(), "/a");
    assert_eq!(state.files().added.get(&hash_a), Some(&a));
    assert!(state.files().intact.get(&hash_b).is_some());
    assert!(state.has_file(&hash_a));
    assert!(state.has_file(&hash_b));
    assert_eq!(state.has_relative_path("/a", Scope::Any), Some(&a));
    assert_eq!(state.lookup("/a", "any").unwrap(), Some(&a));

    assert!(repo.content_store().exists(&hash_a));
    assert!(!repo.content_store().exists(&hash_b));
}

// --- Restore, Remove, Prune ---

#[test]
fn test_restore_earlier_state() {
    let dir = TempDir::new().unwrap();
    let mut repo = test_repo(&dir);
    let root = repo.root().to_path_buf();

    write(&root, "a.txt", "one");
    write(&root, "b.txt", "two");
    let first = repo.commit("initial").unwrap();

    write(&root, "a.txt", "one v2");
    fs::remove_file(root.join("b.txt")).unwrap();
    write(&root, "c.txt", "three");
    repo.commit("second").unwrap();
    write(&root, "scratch/keep", "ignored");

    repo.restore_state(first).unwrap();

    assert_eq!(read(&root, "a.txt"), "one");
    assert_eq!(read(&root, "b.txt"), "two");
    assert!(!root.join("c.txt").exists());
    assert_eq!(read(&root, "scratch/keep"), "ignored");
    assert_eq!(repo.active_state_id(), Some(first));
    assert!(!repo.status().unwrap().has_changes());
}

#[test]
fn test_remove_state_keeps_content_of_later_states() {
    let dir = TempDir::new().unwrap();
    let mut repo = test_repo(&dir);
    let root = repo.root().to_path_buf();

    write(&root, "a.txt", "a1");
    write(&root, "b.txt", "b1");
    let first = repo.commit("first").unwrap();

    write(&root, "a.txt", "a2");
    let second = repo.commit("second").unwrap();

    repo.remove_state(first).unwrap();

    let store = repo.content_store();
    assert!(!store.exists(&ContentHash::of(b"a1")));
    // `b1` is intact in the second state.
    assert!(store.exists(&ContentHash::of(b"b1")));
    assert!(store.exists(&ContentHash::of(b"a2")));

    assert!(!repo.has_state(first));
    assert!(matches!(
        repo.load_state(first),
        Err(VaultError::StateNotFound(_))
    ));
    assert_eq!(repo.active_state_id(), Some(second));
}

#[test]
fn test_prune_then_restore_latest() {
    let dir = TempDir::new().unwrap();
    let mut repo = test_repo(&dir);
    let root = repo.root().to_path_buf();

    write(&root, "a.txt", "a1");
    write(&root, "b.txt", "b1");
    repo.commit("one").unwrap();
    write(&root, "a.txt", "a2");
    repo.commit("two").unwrap();
    write(&root, "c.txt", "c1");
    let latest = repo.commit("three").unwrap();

    let removed = repo.prune(1).unwrap();
    assert_eq!(removed, vec![StateId(1), StateId(2)]);
    assert_eq!(repo.states().len(), 1);
    assert_eq!(repo.stats().unwrap().blob_count, 3);

    for name in ["a.txt", "b.txt", "c.txt"] {
        fs::remove_file(root.join(name)).unwrap();
    }
    repo.restore_state(latest).unwrap();
    assert_eq!(read(&root, "a.txt"), "a2");
    assert_eq!(read(&root, "b.txt"), "b1");
    assert_eq!(read(&root, "c.txt"), "c1");
}

#[test]
fn test_gc_sweeps_content_left_by_intact_chains() {
    let dir = TempDir::new().unwrap();
    let mut repo = test_repo(&dir);
    let root = repo.root().to_path_buf();

    write(&root, "a.txt", "a1");
    let first = repo.commit("first").unwrap();
    write(&root, "b.txt", "b1");
    let second = repo.commit("second").unwrap();

    // State 2 only carries `a1` intact, so neither removal deletes it.
    repo.remove_state(first).unwrap();
    repo.remove_state(second).unwrap();
    assert!(repo.content_store().exists(&ContentHash::of(b"a1")));

    let swept = repo.gc().unwrap();
    assert_eq!(swept, vec![ContentHash::of(b"a1")]);
    assert_eq!(repo.stats().unwrap().blob_count, 0);
}

// --- Persistence ---

#[test]
fn test_persistence_across_reopen() {
    let dir = TempDir::new().unwrap();
    let root;
    {
        let mut repo = test_repo(&dir);
        root = repo.root().to_path_buf();
        write(&root, "a.txt", "persisted");
        repo.commit("first").unwrap();
    }

    let mut repo = open_repo(&dir);
    assert_eq!(repo.states().len(), 1);
    assert_eq!(repo.active_state_id(), Some(StateId(1)));

    write(&root, "b.txt", "more");
    assert_eq!(repo.commit("second").unwrap(), StateId(2));
    assert_eq!(
        repo.content_store()
            .read(&ContentHash::of(b"persisted"))
            .unwrap()
            .unwrap(),
        b"persisted"
    );
}

#[test]
fn test_reopen_resolves_interrupted_transaction() {
    let dir = TempDir::new().unwrap();
    let root;
    {
        let mut repo = test_repo(&dir);
        root = repo.root().to_path_buf();
        write(&root, "a.txt", "claimed");
        repo.commit("first").unwrap();
    }

    // A transaction that never reached its commit marker.
    {
        let wal = WriteAheadLog::open(root.join(META_DIR).join("txn.log")).unwrap();
        wal.log(WalOperation::Transaction {
            state_id: StateId(2),
            placed: vec![ContentHash::of(b"claimed"), ContentHash::of(b"never placed")],
            deleted: Vec::new(),
        })
        .unwrap();
    }

    let repo = open_repo(&dir);
    assert!(repo.content_store().exists(&ContentHash::of(b"claimed")));

    let wal = WriteAheadLog::open(root.join(META_DIR).join("txn.log")).unwrap();
    assert!(!wal.has_pending().unwrap());
}

#[test]
fn test_reopen_discards_state_missing_from_index() {
    let dir = TempDir::new().unwrap();
    let root;
    let index_after_first;
    {
        let mut repo = test_repo(&dir);
        root = repo.root().to_path_buf();
        write(&root, "a.txt", "first");
        repo.commit("first").unwrap();
        index_after_first = fs::read(repo.path().join("repo.json")).unwrap();

        write(&root, "b.txt", "lost");
        assert_eq!(repo.commit("second").unwrap(), StateId(2));
    }

    // The record of state 2 made it to disk, the index update did not.
    let meta = root.join(META_DIR);
    fs::write(meta.join("repo.json"), &index_after_first).unwrap();

    let mut repo = open_repo(&dir);
    assert!(!meta.join("states").join("2").exists());
    assert!(!repo.content_store().exists(&ContentHash::of(b"lost")));
    assert!(repo.content_store().exists(&ContentHash::of(b"first")));

    write(&root, "c.txt", "after");
    assert_eq!(repo.commit("second again").unwrap(), StateId(2));
    let state = repo.load_state(StateId(2)).unwrap();
    assert!(state.has_relative_path("b.txt", Scope::Added).is_some());
    assert!(state.has_relative_path("c.txt", Scope::Added).is_some());
    assert!(repo.content_store().exists(&ContentHash::of(b"lost")));
}

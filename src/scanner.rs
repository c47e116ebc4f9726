//! Working-tree scanner producing unstaged diffs.

use crate::error::Result;
use crate::state::State;
use crate::types::{ContentHash, FileDescriptor, Scope, UnstagedDiff};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Scan `root` and classify every file against `previous`.
///
/// Entries named in `ignored` (and the repository's own metadata directory,
/// `meta_dir`) are skipped at any depth. Symlinks are not followed.
///
/// A content hash lands in at most one partition; when several files share
/// content, the first classification wins in the order intact, modified,
/// added, removed. `count` is the number of files in the working tree.
pub fn scan(
    root: &Path,
    meta_dir: &str,
    ignored: &[String],
    previous: Option<&State>,
) -> Result<UnstagedDiff> {
    let mut working = Vec::new();
    walk(root, "", meta_dir, ignored, &mut working)?;

    let mut intact = Vec::new();
    let mut modified = Vec::new();
    let mut added = Vec::new();
    let mut present = HashSet::new();

    for file in &working {
        present.insert(file.relative_path());
        let prior =
            previous.and_then(|state| state.has_relative_path(file.relative_path(), Scope::Any));
        match prior {
            Some(prior) if prior.content_hash() == file.content_hash() => intact.push(file.clone()),
            Some(_) => modified.push(file.clone()),
            None => added.push(file.clone()),
        }
    }

    let removed: Vec<FileDescriptor> = previous
        .map(|state| {
            state
                .tracked()
                .filter(|fd| !present.contains(fd.relative_path()))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let mut classified = HashSet::new();
    let mut keep_first = |entries: Vec<FileDescriptor>| -> Vec<FileDescriptor> {
        entries
            .into_iter()
            .filter(|fd| classified.insert(fd.content_hash().clone()))
            .collect()
    };

    let diff = UnstagedDiff {
        count: working.len() as u64,
        intact: keep_first(intact),
        modified: keep_first(modified),
        added: keep_first(added),
        removed: keep_first(removed),
    };

    debug!(
        root = %root.display(),
        count = diff.count,
        added = diff.added.len(),
        modified = diff.modified.len(),
        removed = diff.removed.len(),
        intact = diff.intact.len(),
        "scanned working tree"
    );
    Ok(diff)
}

fn walk(
    dir: &Path,
    prefix: &str,
    meta_dir: &str,
    ignored: &[String],
    out: &mut Vec<FileDescriptor>,
) -> Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == meta_dir || ignored.iter().any(|pattern| *pattern == name) {
            continue;
        }

        let relative_path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&entry.path(), &relative_path, meta_dir, ignored, out)?;
        } else if file_type.is_file() {
            let content = fs::read(entry.path())?;
            out.push(FileDescriptor::new(
                name,
                ContentHash::of(&content),
                relative_path,
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn paths(entries: &[FileDescriptor]) -> Vec<&str> {
        entries.iter().map(|fd| fd.relative_path()).collect()
    }

    #[test]
    fn test_scan_without_previous_state() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "b.txt", b"b");
        write(dir.path(), "sub/a.txt", b"a");
        write(dir.path(), ".meta/internal", b"skip");
        write(dir.path(), "target/out", b"skip");

        let diff = scan(dir.path(), ".meta", &["target".to_string()], None).unwrap();

        assert_eq!(diff.count, 2);
        assert_eq!(paths(&diff.added), vec!["b.txt", "sub/a.txt"]);
        assert!(diff.modified.is_empty());
        assert!(diff.removed.is_empty());
        assert!(diff.intact.is_empty());
        assert_eq!(diff.added[1].display_name(), "a.txt");
    }

    #[test]
    fn test_duplicate_content_is_classified_once() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "one", b"same");
        write(dir.path(), "two", b"same");

        let diff = scan(dir.path(), ".meta", &[], None).unwrap();
        assert_eq!(diff.count, 2);
        assert_eq!(paths(&diff.added), vec!["one"]);
        assert!(diff.validate().is_ok());
    }
}

//! Directory tree enumeration for recursive watches.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::Result;

/// Every directory under `root`, `root` included, canonicalized and without
/// duplicates. Parents come before their children. Symlinked directories are
/// followed once. A `root` that is not a directory yields an empty list.
pub fn directory_tree(root: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let root = root.canonicalize()?;

    let mut seen = HashSet::new();
    let mut dirs = Vec::new();
    for entry in WalkDir::new(&root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!("skipping unreadable entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = match entry.path().canonicalize() {
            Ok(dir) => dir,
            Err(err) => {
                debug!("skipping {}: {err}", entry.path().display());
                continue;
            }
        };
        if seen.insert(dir.clone()) {
            dirs.push((entry.depth(), dir));
        }
    }

    dirs.sort_by_key(|(depth, _)| *depth);
    Ok(dirs.into_iter().map(|(_, dir)| dir).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parents_before_children() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("a/b/c")).unwrap();
        fs::create_dir_all(temp.path().join("d")).unwrap();
        fs::write(temp.path().join("a/file.txt"), "x").unwrap();

        let root = temp.path().canonicalize().unwrap();
        let dirs = directory_tree(temp.path()).unwrap();
        assert_eq!(dirs.len(), 5);
        assert_eq!(dirs[0], root);

        let position = |p: &Path| dirs.iter().position(|d| d == p).unwrap();
        assert!(position(&root.join("a")) < position(&root.join("a/b")));
        assert!(position(&root.join("a/b")) < position(&root.join("a/b/c")));
        assert!(!dirs.contains(&root.join("a/file.txt")));
    }

    #[test]
    fn test_not_a_directory() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("file");
        fs::write(&file, "x").unwrap();
        assert!(directory_tree(&file).unwrap().is_empty());
        assert!(directory_tree(temp.path().join("missing")).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directory_listed_once() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("real")).unwrap();
        std::os::unix::fs::symlink(temp.path().join("real"), temp.path().join("link")).unwrap();

        let dirs = directory_tree(temp.path()).unwrap();
        assert_eq!(dirs.len(), 2);
    }
}

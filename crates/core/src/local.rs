//! The local document tree.
//!
//! All paths handed to [`LocalTree`] are relative to the tree root and use
//! `/` separators, matching the paths stored in the state store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::errors::SyncError;
use crate::hierarchy::{ATTACHMENTS_DIR, ITEM_EXT};

/// Directory under the root that holds engine state; never scanned.
pub const STATE_DIR: &str = ".pagesync";

#[derive(Debug, Clone)]
pub struct LocalTree {
    root: PathBuf,
    exclude: Vec<String>,
}

impl LocalTree {
    pub fn new(root: impl Into<PathBuf>, exclude: Vec<String>) -> Self {
        Self {
            root: root.into(),
            exclude,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.abs(rel).is_file()
    }

    /// Read a document; `None` if it does not exist.
    pub fn read_text(&self, rel: &str) -> Result<Option<String>, SyncError> {
        let path = self.abs(rel);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::io(path, e)),
        }
    }

    /// Replace a document atomically: write a sibling temp file, then
    /// persist it over the target.
    pub fn write_text(&self, rel: &str, text: &str) -> Result<(), SyncError> {
        self.write_bytes(rel, text.as_bytes())
    }

    pub fn write_bytes(&self, rel: &str, bytes: &[u8]) -> Result<(), SyncError> {
        let path = self.abs(rel);
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| SyncError::io(&dir, e))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| SyncError::io(&dir, e))?;
        tmp.write_all(bytes).map_err(|e| SyncError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| SyncError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| SyncError::io(&path, e.error))?;
        trace!(path = rel, bytes = bytes.len(), "wrote local file");
        Ok(())
    }

    /// Remove a file if present. Returns whether it existed.
    pub fn remove(&self, rel: &str) -> Result<bool, SyncError> {
        let path = self.abs(rel);
        match fs::remove_file(&path) {
            Ok(()) => {
                if let Some(parent) = path.parent() {
                    crate::hierarchy::prune_empty_dirs(&self.root, parent);
                }
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SyncError::io(path, e)),
        }
    }

    fn is_excluded(&self, rel: &str) -> bool {
        self.exclude
            .iter()
            .any(|pattern| glob_match::glob_match(pattern, rel))
    }

    /// Every document under the root, sorted. Skips the state directory,
    /// attachment directories, dot-files and excluded patterns.
    pub fn scan_documents(&self) -> Result<Vec<String>, SyncError> {
        let mut found = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SyncError::io(&dir, e)),
            };
            for entry in entries {
                let entry = entry.map_err(|e| SyncError::io(&dir, e))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') || name == ATTACHMENTS_DIR || name == STATE_DIR {
                    continue;
                }
                let path = entry.path();
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let rel = rel.to_string_lossy().replace('\\', "/");
                let file_type = entry.file_type().map_err(|e| SyncError::io(&path, e))?;
                if file_type.is_dir() {
                    if !self.is_excluded(&rel) {
                        stack.push(path);
                    }
                } else if file_type.is_file()
                    && path.extension().is_some_and(|ext| ext == ITEM_EXT)
                    && !self.is_excluded(&rel)
                {
                    found.push(rel);
                }
            }
        }
        found.sort();
        debug!(count = found.len(), "scanned local documents");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_remove() {
        let tmp = TempDir::new().unwrap();
        let tree = LocalTree::new(tmp.path(), vec![]);
        assert_eq!(tree.read_text("a/b.md").unwrap(), None);

        tree.write_text("a/b.md", "hello\n").unwrap();
        assert_eq!(tree.read_text("a/b.md").unwrap().as_deref(), Some("hello\n"));

        tree.write_text("a/b.md", "replaced\n").unwrap();
        assert_eq!(tree.read_text("a/b.md").unwrap().as_deref(), Some("replaced\n"));

        assert!(tree.remove("a/b.md").unwrap());
        assert!(!tree.remove("a/b.md").unwrap());
        assert!(!tmp.path().join("a").exists());
    }

    #[test]
    fn test_scan_skips_state_attachments_and_excludes() {
        let tmp = TempDir::new().unwrap();
        let tree = LocalTree::new(tmp.path(), vec!["drafts/**".into(), "**/*.tmp.md".into()]);
        tree.write_text("home.md", "x").unwrap();
        tree.write_text("home/child.md", "x").unwrap();
        tree.write_text("home/_attachments/notes.md", "x").unwrap();
        tree.write_text(".pagesync/state.md", "x").unwrap();
        tree.write_text("drafts/wip.md", "x").unwrap();
        tree.write_text("home/scratch.tmp.md", "x").unwrap();
        tree.write_text("home/image.png", "x").unwrap();

        assert_eq!(
            tree.scan_documents().unwrap(),
            vec!["home.md".to_string(), "home/child.md".to_string()]
        );
    }
}

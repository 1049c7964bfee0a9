//! Remote hierarchy to local path mapping.
//!
//! An item maps to `<dir>/<slug>.md`, where `<dir>` holds one segment per
//! ancestor inside the scope and its children live under `<dir>/<slug>/`.
//! When the remote tree changes shape, [`relocate`] moves the file (and its
//! child directory) to the new location before anything is written to it.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::codec::hash_bytes;
use crate::errors::HierarchyError;

/// Extension of every item file.
pub const ITEM_EXT: &str = "md";

/// Directory, next to an item's children, holding its attachments.
pub const ATTACHMENTS_DIR: &str = "_attachments";

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Lowercase, ASCII-alphanumeric, dash-separated form of a title.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if dash && !slug.is_empty() {
                slug.push('-');
            }
            dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            dash = true;
        }
    }
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Directory holding the children of the item stored at `item_path`.
pub fn child_dir(item_path: &str) -> &str {
    item_path
        .strip_suffix(".md")
        .unwrap_or(item_path)
}

/// Local path of an attachment of the item stored at `item_path`.
pub fn attachment_path(item_path: &str, file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    let safe = safe.trim_start_matches('.');
    let safe = if safe.is_empty() { "attachment" } else { safe };
    format!("{}/{ATTACHMENTS_DIR}/{safe}", child_dir(item_path))
}

// ---------------------------------------------------------------------------
// Path mapper
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Node {
    slug: String,
    parent_id: Option<String>,
}

/// Index of the items known in one run, used to compute chains and paths.
#[derive(Debug, Default)]
pub struct PathMapper {
    nodes: HashMap<String, Node>,
    children: HashMap<Option<String>, Vec<String>>,
    /// Chains for ids outside the index (scope root ancestors, parents we
    /// could not list). Root first, excluding the id itself.
    known_chains: HashMap<String, Vec<String>>,
    /// Ids whose segment always carries the id suffix.
    suffixed: HashSet<String>,
    scope_root: Option<String>,
}

impl PathMapper {
    pub fn new(scope_root: Option<String>) -> Self {
        Self {
            scope_root,
            ..Self::default()
        }
    }

    /// Register an item seen in the inventory.
    pub fn insert(&mut self, id: &str, title: &str, parent_id: Option<&str>) {
        let parent = parent_id.map(str::to_string);
        if let Some(old) = self.nodes.insert(
            id.to_string(),
            Node {
                slug: slugify(title),
                parent_id: parent.clone(),
            },
        ) {
            if let Some(siblings) = self.children.get_mut(&old.parent_id) {
                siblings.retain(|s| s != id);
            }
        }
        self.children.entry(parent).or_default().push(id.to_string());
    }

    /// Record a chain learned elsewhere for an id the walk cannot see past.
    pub fn set_known_chain(&mut self, id: &str, chain: Vec<String>) {
        self.known_chains.insert(id.to_string(), chain);
    }

    /// Give `id` the `-<id>` suffix even without a sibling clash, e.g. when
    /// its bare path is held by a tracked item outside this index.
    pub fn force_suffix(&mut self, id: &str) {
        self.suffixed.insert(id.to_string());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ancestor chain of `id`, root first, not including `id`.
    ///
    /// Walks parent links with a visited set. A repeated id means the remote
    /// hierarchy loops, which fails this item only.
    pub fn chain(&self, id: &str) -> Result<Vec<String>, HierarchyError> {
        let mut visited = HashSet::from([id.to_string()]);
        let mut reversed: Vec<String> = Vec::new();
        let mut current = id.to_string();

        loop {
            let parent = self.nodes.get(&current).and_then(|n| n.parent_id.clone());
            let Some(parent) = parent.filter(|p| self.nodes.contains_key(p)) else {
                // Top of what we know: finish with a chain learned elsewhere.
                let prefix = self.known_chains.get(&current).cloned().or_else(|| {
                    let parent = self.nodes.get(&current)?.parent_id.clone()?;
                    let mut chain = self.known_chains.get(&parent).cloned().unwrap_or_default();
                    chain.push(parent);
                    Some(chain)
                });
                for ancestor in prefix.unwrap_or_default().into_iter().rev() {
                    if !visited.insert(ancestor.clone()) {
                        return Err(HierarchyError::Cycle {
                            id: id.to_string(),
                            repeated: ancestor,
                        });
                    }
                    reversed.push(ancestor);
                }
                break;
            };
            if !visited.insert(parent.clone()) {
                return Err(HierarchyError::Cycle {
                    id: id.to_string(),
                    repeated: parent,
                });
            }
            reversed.push(parent.clone());
            current = parent;
        }

        reversed.reverse();
        Ok(reversed)
    }

    /// Path segment for `id`: its slug, suffixed with the id when a sibling
    /// shares the slug or the suffix was forced. The sibling with the
    /// smallest id keeps the bare slug.
    fn segment(&self, id: &str) -> String {
        let Some(node) = self.nodes.get(id) else {
            return id.to_string();
        };
        let clashes = self
            .children
            .get(&node.parent_id)
            .map(|siblings| {
                siblings
                    .iter()
                    .filter(|s| s.as_str() != id)
                    .filter_map(|s| self.nodes.get(s).map(|n| (s, n)))
                    .any(|(s, n)| n.slug == node.slug && id_order(s, id).is_lt())
            })
            .unwrap_or(false);
        if clashes || self.suffixed.contains(id) {
            format!("{}-{id}", node.slug)
        } else {
            node.slug.clone()
        }
    }

    /// Local path of `id` given its chain. Only the part of the chain at or
    /// below the scope root, and known to this index, contributes segments.
    pub fn path_for(&self, id: &str, chain: &[String]) -> String {
        let mut start = 0;
        for (i, ancestor) in chain.iter().enumerate() {
            if !self.nodes.contains_key(ancestor) {
                start = i + 1;
            }
            if self.scope_root.as_deref() == Some(ancestor.as_str()) {
                start = i;
            }
        }
        if self.scope_root.as_deref() == Some(id) {
            start = chain.len();
        }

        let mut segments: Vec<String> = chain[start.min(chain.len())..]
            .iter()
            .map(|a| self.segment(a))
            .collect();
        segments.push(format!("{}.{ITEM_EXT}", self.segment(id)));
        segments.join("/")
    }
}

/// Numeric ids order numerically, everything else lexicographically.
fn id_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

// ---------------------------------------------------------------------------
// Relocation
// ---------------------------------------------------------------------------

/// What [`relocate`] moved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub moved_file: bool,
    pub moved_dir: bool,
}

fn io_err(path: &Path, source: std::io::Error) -> HierarchyError {
    HierarchyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn file_hash(path: &Path) -> Result<String, HierarchyError> {
    let bytes = fs::read(path).map_err(|e| io_err(path, e))?;
    Ok(hash_bytes(&bytes))
}

/// Move the item file at `from` (and its child directory, if any) to `to`,
/// both relative to `root`.
///
/// Refuses to overwrite a different file at the destination and verifies
/// the content hash is unchanged by the move. Empty directories left behind
/// are removed.
pub fn relocate(root: &Path, from: &str, to: &str) -> Result<Relocation, HierarchyError> {
    let mut done = Relocation::default();
    if from == to {
        return Ok(done);
    }
    let src = root.join(from);
    let dst = root.join(to);

    if src.is_file() {
        let before = file_hash(&src)?;
        if dst.exists() {
            if !dst.is_file() || file_hash(&dst)? != before {
                return Err(HierarchyError::DestinationExists {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            // Identical copy already in place.
            fs::remove_file(&src).map_err(|e| io_err(&src, e))?;
        } else {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            fs::rename(&src, &dst).map_err(|e| io_err(&src, e))?;
        }
        if file_hash(&dst)? != before {
            return Err(HierarchyError::ContentChanged {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        done.moved_file = true;
    }

    let src_dir = root.join(child_dir(from));
    let dst_dir = root.join(child_dir(to));
    if src_dir.is_dir() {
        if dst_dir.exists() && !is_empty_dir(&dst_dir) {
            return Err(HierarchyError::DestinationExists {
                from: child_dir(from).to_string(),
                to: child_dir(to).to_string(),
            });
        }
        if dst_dir.exists() {
            fs::remove_dir(&dst_dir).map_err(|e| io_err(&dst_dir, e))?;
        }
        if let Some(parent) = dst_dir.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        fs::rename(&src_dir, &dst_dir).map_err(|e| io_err(&src_dir, e))?;
        done.moved_dir = true;
    }

    if let Some(parent) = src.parent() {
        prune_empty_dirs(root, parent);
    }

    info!(from, to, moved_dir = done.moved_dir, "relocated item");
    Ok(done)
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// Remove empty directories from `start` upward, stopping at `root`.
pub fn prune_empty_dirs(root: &Path, start: &Path) {
    let mut dir = start.to_path_buf();
    while dir.starts_with(root) && dir != root {
        if !is_empty_dir(&dir) || fs::remove_dir(&dir).is_err() {
            break;
        }
        debug!(dir = %dir.display(), "pruned empty directory");
        if !dir.pop() {
            break;
        }
    }
}

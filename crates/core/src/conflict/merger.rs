//! Three-way merge engine.
//!
//! Both sides are diffed against the base with `similar` (Myers). Hunks that
//! only one side touched are taken from that side, hunks both sides changed
//! the same way are taken once, and anything else becomes a conflict region.

use similar::{capture_diff_slices, Algorithm, DiffOp};
use tracing::debug;

pub const MARKER_LOCAL: &str = "<<<<<<< local";
pub const MARKER_SEP: &str = "=======";
pub const MARKER_REMOTE: &str = ">>>>>>> remote";

/// What to emit for a region both sides changed differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStyle {
    /// `<<<<<<< local` / `=======` / `>>>>>>> remote` markers.
    Markers,
    /// The local side's lines.
    TakeLocal,
    /// The remote side's lines.
    TakeRemote,
}

/// The result of a three-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    /// The merged content; contains markers only under [`MergeStyle::Markers`].
    pub merged_content: String,
    /// Regions both sides changed differently.
    pub conflict_markers: Vec<ConflictMarker>,
}

impl MergeResult {
    /// Whether both sides disagreed somewhere.
    pub fn has_conflicts(&self) -> bool {
        !self.conflict_markers.is_empty()
    }
}

/// A conflict region within merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMarker {
    /// First line (1-indexed) of the region in the merged output.
    pub start_line: usize,
    /// Last line (1-indexed) of the region in the merged output.
    pub end_line: usize,
}

/// One side's replacement of `base[start..end]`.
#[derive(Debug, Clone)]
struct Hunk<'a> {
    start: usize,
    end: usize,
    lines: Vec<&'a str>,
}

/// Lines including their terminators, so output is byte-faithful.
fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// Consecutive non-equal diff ops folded into hunks.
fn hunks<'a>(base: &[&'a str], side: &[&'a str]) -> Vec<Hunk<'a>> {
    let mut out: Vec<Hunk<'a>> = Vec::new();
    for op in capture_diff_slices(Algorithm::Myers, base, side) {
        let (old, new) = match op {
            DiffOp::Equal { .. } => continue,
            DiffOp::Delete {
                old_index, old_len, new_index,
            } => (old_index..old_index + old_len, new_index..new_index),
            DiffOp::Insert {
                old_index, new_index, new_len,
            } => (old_index..old_index, new_index..new_index + new_len),
            DiffOp::Replace {
                old_index, old_len, new_index, new_len,
            } => (old_index..old_index + old_len, new_index..new_index + new_len),
        };
        match out.last_mut() {
            Some(last) if last.end == old.start => {
                last.end = old.end;
                last.lines.extend_from_slice(&side[new]);
            }
            _ => out.push(Hunk {
                start: old.start,
                end: old.end,
                lines: side[new].to_vec(),
            }),
        }
    }
    out
}

/// One side's text for `base[start..end]`, given that side's hunks inside it.
fn side_view<'a>(base: &[&'a str], hunks: &[&Hunk<'a>], start: usize, end: usize) -> Vec<&'a str> {
    let mut out = Vec::new();
    let mut pos = start;
    for hunk in hunks {
        out.extend_from_slice(&base[pos..hunk.start]);
        out.extend_from_slice(&hunk.lines);
        pos = hunk.end;
    }
    out.extend_from_slice(&base[pos..end]);
    out
}

struct Output {
    text: String,
    line: usize,
}

impl Output {
    fn push(&mut self, line: &str) {
        self.text.push_str(line);
        if line.ends_with('\n') {
            self.line += 1;
        }
    }

    fn push_all(&mut self, lines: &[&str]) {
        for line in lines {
            self.push(line);
        }
    }

    /// A marker line always starts on a fresh line.
    fn marker(&mut self, marker: &str) {
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
            self.line += 1;
        }
        self.text.push_str(marker);
        self.text.push('\n');
        self.line += 1;
    }
}

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Merge `local` and `remote`, both derived from `base`.
    ///
    /// Deterministic: identical inputs always produce byte-identical output.
    pub fn three_way_merge(base: &str, local: &str, remote: &str, style: MergeStyle) -> MergeResult {
        if local == remote || remote == base {
            return MergeResult {
                merged_content: local.to_string(),
                conflict_markers: Vec::new(),
            };
        }
        if local == base {
            return MergeResult {
                merged_content: remote.to_string(),
                conflict_markers: Vec::new(),
            };
        }

        let base_lines = split_lines(base);
        let local_lines = split_lines(local);
        let remote_lines = split_lines(remote);
        let ours = hunks(&base_lines, &local_lines);
        let theirs = hunks(&base_lines, &remote_lines);

        let mut out = Output {
            text: String::with_capacity(local.len().max(remote.len())),
            line: 0,
        };
        let mut markers = Vec::new();
        let (mut i, mut j, mut pos) = (0, 0, 0);

        while i < ours.len() || j < theirs.len() {
            // Seed the group with whichever hunk starts first.
            let group_start = match (ours.get(i), theirs.get(j)) {
                (Some(a), Some(b)) => a.start.min(b.start),
                (Some(a), None) => a.start,
                (None, Some(b)) => b.start,
                (None, None) => break,
            };
            let mut group_end = group_start;
            let mut local_group: Vec<&Hunk> = Vec::new();
            let mut remote_group: Vec<&Hunk> = Vec::new();

            // Pull in every hunk that overlaps or touches the group.
            loop {
                if let Some(h) = ours.get(i).filter(|h| h.start <= group_end) {
                    group_end = group_end.max(h.end);
                    local_group.push(h);
                    i += 1;
                    continue;
                }
                if let Some(h) = theirs.get(j).filter(|h| h.start <= group_end) {
                    group_end = group_end.max(h.end);
                    remote_group.push(h);
                    j += 1;
                    continue;
                }
                break;
            }

            out.push_all(&base_lines[pos..group_start]);
            let local_view = side_view(&base_lines, &local_group, group_start, group_end);
            let remote_view = side_view(&base_lines, &remote_group, group_start, group_end);

            if remote_group.is_empty() || local_view == remote_view {
                out.push_all(&local_view);
            } else if local_group.is_empty() {
                out.push_all(&remote_view);
            } else {
                let start_line = out.line + 1;
                match style {
                    MergeStyle::Markers => {
                        out.marker(MARKER_LOCAL);
                        out.push_all(&local_view);
                        out.marker(MARKER_SEP);
                        out.push_all(&remote_view);
                        out.marker(MARKER_REMOTE);
                    }
                    MergeStyle::TakeLocal => out.push_all(&local_view),
                    MergeStyle::TakeRemote => out.push_all(&remote_view),
                }
                markers.push(ConflictMarker {
                    start_line,
                    end_line: out.line.max(start_line),
                });
            }
            pos = group_end;
        }
        out.push_all(&base_lines[pos..]);

        debug!(
            conflicts = markers.len(),
            local_hunks = ours.len(),
            remote_hunks = theirs.len(),
            "three-way merge complete"
        );
        MergeResult {
            merged_content: out.text,
            conflict_markers: markers,
        }
    }

    /// Quick check: can these three versions be merged without conflicts?
    pub fn can_auto_merge(base: &str, local: &str, remote: &str) -> bool {
        !Self::three_way_merge(base, local, remote, MergeStyle::TakeLocal).has_conflicts()
    }
}

/// Whether `text` still holds conflict markers written by the merger.
pub fn contains_markers(text: &str) -> bool {
    let mut open = false;
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line == MARKER_LOCAL {
            open = true;
        } else if open && line == MARKER_REMOTE {
            return true;
        }
    }
    false
}

/// Unified diff from `local` to `remote`, for status output.
pub fn render_diff(local: &str, remote: &str) -> String {
    diffy::create_patch(local, remote).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merge(base: &str, local: &str, remote: &str) -> MergeResult {
        Merger::three_way_merge(base, local, remote, MergeStyle::Markers)
    }

    #[test]
    fn test_identical_files() {
        let base = "line1\nline2\nline3\n";
        let result = merge(base, base, base);
        assert!(!result.has_conflicts());
        assert_eq!(result.merged_content, base);
    }

    #[test]
    fn test_only_one_side_changed() {
        let base = "line1\nline2\nline3\n";
        let changed = "line1\nmodified\nline3\n";
        assert_eq!(merge(base, changed, base).merged_content, changed);
        assert_eq!(merge(base, base, changed).merged_content, changed);
    }

    #[test]
    fn test_non_overlapping_changes() {
        let base = "aaa\nbbb\nccc\nddd\neee\n";
        let local = "AAA\nbbb\nccc\nddd\neee\n";
        let remote = "aaa\nbbb\nccc\nddd\nEEE\n";
        let result = merge(base, local, remote);
        assert!(!result.has_conflicts());
        assert_eq!(result.merged_content, "AAA\nbbb\nccc\nddd\nEEE\n");
    }

    #[test]
    fn test_insertions_on_both_sides() {
        let base = "one\ntwo\nthree\nfour\n";
        let local = "zero\none\ntwo\nthree\nfour\n";
        let remote = "one\ntwo\nthree\nfour\nfive\n";
        let result = merge(base, local, remote);
        assert!(!result.has_conflicts());
        assert_eq!(result.merged_content, "zero\none\ntwo\nthree\nfour\nfive\n");
    }

    #[test]
    fn test_same_line_conflict_markers() {
        let base = "line1\noriginal\nline3\n";
        let local = "line1\nlocal version\nline3\n";
        let remote = "line1\nremote version\nline3\n";
        let result = merge(base, local, remote);
        assert!(result.has_conflicts());
        assert_eq!(
            result.merged_content,
            "line1\n<<<<<<< local\nlocal version\n=======\nremote version\n>>>>>>> remote\nline3\n"
        );
        assert_eq!(
            result.conflict_markers,
            vec![ConflictMarker {
                start_line: 2,
                end_line: 6
            }]
        );
        assert!(contains_markers(&result.merged_content));
    }

    #[test]
    fn test_prefer_side_keeps_clean_hunks() {
        let base = "a\nb\nc\nd\ne\n";
        let local = "A\nb\nLOCAL\nd\ne\n";
        let remote = "a\nb\nREMOTE\nd\nE\n";

        let local_wins = Merger::three_way_merge(base, local, remote, MergeStyle::TakeLocal);
        assert_eq!(local_wins.merged_content, "A\nb\nLOCAL\nd\nE\n");
        assert_eq!(local_wins.conflict_markers.len(), 1);

        let remote_wins = Merger::three_way_merge(base, local, remote, MergeStyle::TakeRemote);
        assert_eq!(remote_wins.merged_content, "A\nb\nREMOTE\nd\nE\n");
    }

    #[test]
    fn test_same_change_both_sides() {
        let base = "x\nold\ny\nz\n";
        let local = "x\nnew\ny\nZ\n";
        let remote = "x\nnew\ny\nz\n";
        let result = merge(base, local, remote);
        assert!(!result.has_conflicts());
        assert_eq!(result.merged_content, "x\nnew\ny\nZ\n");
    }

    #[test]
    fn test_missing_trailing_newline_in_conflict() {
        let base = "a\nb";
        let result = merge(base, "a\nlocal", "a\nremote");
        assert_eq!(
            result.merged_content,
            "a\n<<<<<<< local\nlocal\n=======\nremote\n>>>>>>> remote\n"
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let base = "1\n2\n3\n4\n5\n6\n";
        let local = "1\nL2\n3\nL4\n5\n6\n";
        let remote = "1\nR2\n3\n4\n5\nR6\n";
        let first = merge(base, local, remote);
        let second = merge(base, local, remote);
        assert_eq!(first, second);
        assert_eq!(first.conflict_markers.len(), 1);
    }

    #[test]
    fn test_can_auto_merge() {
        let base = "aaa\nbbb\nccc\n";
        assert!(Merger::can_auto_merge(base, "AAA\nbbb\nccc\n", base));
        assert!(Merger::can_auto_merge(base, "XXX\nbbb\nccc\n", "XXX\nbbb\nccc\n"));
        assert!(!Merger::can_auto_merge(
            "line1\noriginal\nline3\n",
            "line1\nours\nline3\n",
            "line1\ntheirs\nline3\n"
        ));
    }

    #[test]
    fn test_contains_markers_requires_full_block() {
        assert!(!contains_markers("plain text\n======= not a marker\n"));
        assert!(!contains_markers(">>>>>>> remote\n<<<<<<< local\n"));
        assert!(contains_markers("<<<<<<< local\na\n=======\nb\n>>>>>>> remote\n"));
    }

    #[test]
    fn test_render_diff() {
        let diff = render_diff("a\nb\n", "a\nc\n");
        assert!(diff.contains("@@"));
        assert!(diff.contains("-b"));
        assert!(diff.contains("+c"));
    }
}

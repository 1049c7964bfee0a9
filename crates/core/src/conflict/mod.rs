//! Change detection, three-way merging, and conflict resolution.
//!
//! 1. **Detection** -- classifying each item from local, remote and base hashes.
//! 2. **Merging** -- line-based three-way merge with conflict markers.
//! 3. **Resolution** -- settling conflicting regions under a caller policy.

pub mod detector;
pub mod merger;
pub mod resolver;

pub use detector::{ChangeDetector, Classification, MissOutcome};
pub use merger::{contains_markers, render_diff, MergeResult, MergeStyle, Merger};
pub use resolver::{ConflictPolicy, ConflictResolver, Resolution};

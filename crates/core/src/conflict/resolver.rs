//! Policy-driven conflict resolution.
//!
//! The [`ConflictResolver`] turns a base/local/remote triple into the text
//! to write locally, following a [`ConflictPolicy`] chosen by the caller.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::merger::{MergeResult, MergeStyle, Merger};
use crate::errors::ConflictError;

/// What to do with regions both sides changed differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Take the local lines inside conflicting regions.
    PreferLocal,
    /// Take the remote lines inside conflicting regions.
    PreferRemote,
    /// Write conflict markers and leave the item in conflict.
    #[default]
    KeepMarkers,
    /// Refuse to write anything.
    Fail,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreferLocal => "prefer-local",
            Self::PreferRemote => "prefer-remote",
            Self::KeepMarkers => "keep-markers",
            Self::Fail => "fail",
        }
    }

    fn style(&self) -> MergeStyle {
        match self {
            Self::PreferLocal => MergeStyle::TakeLocal,
            Self::PreferRemote => MergeStyle::TakeRemote,
            Self::KeepMarkers | Self::Fail => MergeStyle::Markers,
        }
    }
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefer-local" => Ok(Self::PreferLocal),
            "prefer-remote" => Ok(Self::PreferRemote),
            "keep-markers" => Ok(Self::KeepMarkers),
            "fail" => Ok(Self::Fail),
            other => Err(format!(
                "unknown conflict policy '{other}' \
                 (expected prefer-local, prefer-remote, keep-markers or fail)"
            )),
        }
    }
}

/// How a triple was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Text to write locally.
    pub content: String,
    /// Regions both sides changed differently.
    pub regions: usize,
    /// The written text still has markers; the item stays in conflict.
    pub unresolved: bool,
}

/// Stateless resolution operations.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Merge the triple and settle conflicting regions under `policy`.
    ///
    /// `path` only labels the error raised under [`ConflictPolicy::Fail`].
    pub fn resolve(
        path: &str,
        base: &str,
        local: &str,
        remote: &str,
        policy: ConflictPolicy,
    ) -> Result<Resolution, ConflictError> {
        let MergeResult {
            merged_content,
            conflict_markers,
        } = Merger::three_way_merge(base, local, remote, policy.style());
        let regions = conflict_markers.len();

        if regions == 0 {
            debug!(path, "clean three-way merge");
            return Ok(Resolution {
                content: merged_content,
                regions,
                unresolved: false,
            });
        }

        match policy {
            ConflictPolicy::Fail => Err(ConflictError::Unresolved {
                path: path.to_string(),
                regions,
            }),
            ConflictPolicy::KeepMarkers => {
                info!(path, regions, "conflict markers written");
                Ok(Resolution {
                    content: merged_content,
                    regions,
                    unresolved: true,
                })
            }
            ConflictPolicy::PreferLocal | ConflictPolicy::PreferRemote => {
                info!(path, regions, policy = %policy, "conflict resolved by policy");
                Ok(Resolution {
                    content: merged_content,
                    regions,
                    unresolved: false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "title\nbody\nfooter\n";
    const LOCAL: &str = "title\nlocal body\nfooter\n";
    const REMOTE: &str = "title\nremote body\nfooter\n";

    #[test]
    fn test_policy_parse_and_display() {
        for policy in [
            ConflictPolicy::PreferLocal,
            ConflictPolicy::PreferRemote,
            ConflictPolicy::KeepMarkers,
            ConflictPolicy::Fail,
        ] {
            assert_eq!(policy.as_str().parse::<ConflictPolicy>().unwrap(), policy);
        }
        assert!("theirs".parse::<ConflictPolicy>().is_err());
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::KeepMarkers);
    }

    #[test]
    fn test_keep_markers_leaves_conflict() {
        let r = ConflictResolver::resolve("a.md", BASE, LOCAL, REMOTE, ConflictPolicy::KeepMarkers)
            .unwrap();
        assert!(r.unresolved);
        assert_eq!(r.regions, 1);
        assert!(r.content.contains("<<<<<<< local"));
    }

    #[test]
    fn test_prefer_policies_pick_side() {
        let r = ConflictResolver::resolve("a.md", BASE, LOCAL, REMOTE, ConflictPolicy::PreferLocal)
            .unwrap();
        assert_eq!(r.content, LOCAL);
        assert!(!r.unresolved);

        let r = ConflictResolver::resolve("a.md", BASE, LOCAL, REMOTE, ConflictPolicy::PreferRemote)
            .unwrap();
        assert_eq!(r.content, REMOTE);
    }

    #[test]
    fn test_fail_policy_errors_only_on_conflict() {
        let err = ConflictResolver::resolve("a.md", BASE, LOCAL, REMOTE, ConflictPolicy::Fail)
            .unwrap_err();
        assert!(matches!(err, ConflictError::Unresolved { regions: 1, .. }));

        let clean = ConflictResolver::resolve("a.md", BASE, LOCAL, BASE, ConflictPolicy::Fail)
            .unwrap();
        assert_eq!(clean.content, LOCAL);
    }
}

//! Change detection.
//!
//! Classifies an item from the hashes of its local text, remote text, and
//! the base captured at the last two-way sync, and tracks consecutive
//! remote misses that eventually mark an item as remote-inaccessible.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::models::{InaccessibleReason, ItemRecord, SyncState};

/// Result of [`ChangeDetector::classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub state: SyncState,
    /// Set when both sides converged on the same new text: the base must
    /// advance to this hash.
    pub new_base: Option<String>,
}

impl Classification {
    fn plain(state: SyncState) -> Self {
        Self {
            state,
            new_base: None,
        }
    }
}

/// Outcome of recording a remote miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissOutcome {
    /// Below the threshold; the item keeps its state.
    Counted(u32),
    /// The threshold was reached on this miss.
    BecameInaccessible,
    /// Already inaccessible.
    StillInaccessible,
}

/// Classification and miss tracking.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    inaccessible_threshold: u32,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(2)
    }
}

impl ChangeDetector {
    pub fn new(inaccessible_threshold: u32) -> Self {
        Self {
            inaccessible_threshold: inaccessible_threshold.max(1),
        }
    }

    /// Classify from the three hashes. A missing hash on one side counts as
    /// changed; a missing base means the item was never synced.
    pub fn classify(
        local: Option<&str>,
        remote: Option<&str>,
        base: Option<&str>,
    ) -> Classification {
        let Some(base) = base else {
            return Classification::plain(SyncState::Untracked);
        };
        let local_changed = local != Some(base);
        let remote_changed = remote != Some(base);

        match (local_changed, remote_changed) {
            (false, false) => Classification::plain(SyncState::Synced),
            (true, false) => Classification::plain(SyncState::LocalModified),
            (false, true) => Classification::plain(SyncState::RemoteModified),
            (true, true) => match (local, remote) {
                (Some(l), Some(r)) if l == r => {
                    debug!("both sides converged, advancing base");
                    Classification {
                        state: SyncState::Synced,
                        new_base: Some(l.to_string()),
                    }
                }
                _ => Classification::plain(SyncState::Conflict),
            },
        }
    }

    /// Planning hint before anything is fetched: the inventory version
    /// differs from the stored one.
    pub fn remote_changed_hint(record: &ItemRecord, inventory_version: i64) -> bool {
        record.version != inventory_version
    }

    /// Count one not-found/forbidden response for a tracked item.
    pub fn record_miss(
        &self,
        record: &mut ItemRecord,
        reason: InaccessibleReason,
        now: DateTime<Utc>,
    ) -> MissOutcome {
        if record.is_inaccessible() {
            return MissOutcome::StillInaccessible;
        }
        record.miss_count += 1;
        if record.miss_count >= self.inaccessible_threshold {
            warn!(
                id = %record.id,
                path = %record.path,
                misses = record.miss_count,
                reason = %reason,
                "item is now remote-inaccessible"
            );
            record.state = SyncState::RemoteInaccessible;
            record.inaccessible = Some(reason);
            record.inaccessible_since = Some(now);
            MissOutcome::BecameInaccessible
        } else {
            debug!(id = %record.id, misses = record.miss_count, "remote miss recorded");
            MissOutcome::Counted(record.miss_count)
        }
    }

    /// A successful fetch resets the miss counter and clears any
    /// inaccessible marker.
    pub fn record_hit(record: &mut ItemRecord) {
        record.miss_count = 0;
        record.inaccessible = None;
        record.inaccessible_since = None;
        if record.state == SyncState::RemoteInaccessible {
            record.state = SyncState::Untracked;
        }
    }
}

//! Resumable run progress.
//!
//! A checkpoint holds only counts and the failed ids of an in-progress run,
//! never the set of processed ids: on resume, the state store itself says
//! which items are already done.

use std::collections::BTreeSet;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::batch::{BatchObserver, BatchProgress};
use crate::db::{meta, Database};
use crate::errors::{DatabaseError, SyncError};
use crate::models::{Checkpoint, ItemRecord, SyncState};

/// Checkpoints older than this are discarded instead of resumed.
pub const CHECKPOINT_TTL_HOURS: i64 = 24;

/// What a run inherits from an earlier, unfinished one.
#[derive(Debug, Clone, Default)]
pub struct ResumeState {
    pub resumed: bool,
    /// Items the earlier run settled.
    pub processed: u64,
    /// Items the earlier run failed; always re-attempted.
    pub failed_ids: BTreeSet<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl ResumeState {
    /// Whether `id` must be attempted even if nothing changed.
    pub fn must_retry(&self, id: &str) -> bool {
        self.failed_ids.contains(id)
    }

    /// Whether a resumed run can skip `id`: the store already holds it at
    /// the inventory's version and it was not among the failures.
    pub fn should_skip(&self, id: &str, record: Option<&ItemRecord>, version: i64) -> bool {
        if !self.resumed || self.must_retry(id) {
            return false;
        }
        record.is_some_and(|r| {
            r.version == version && r.state == SyncState::Synced && r.last_synced_at.is_some()
        })
    }
}

/// Tracks one run's checkpoint and persists it after every batch.
pub struct CheckpointManager<'a> {
    db: &'a Database,
    state: Mutex<Checkpoint>,
}

impl<'a> CheckpointManager<'a> {
    /// Load or create the checkpoint for `fingerprint`.
    ///
    /// A checkpoint younger than [`CHECKPOINT_TTL_HOURS`] is resumed; an
    /// older one is dropped and a fresh one started.
    pub fn begin(
        db: &'a Database,
        fingerprint: &str,
        total: Option<u64>,
    ) -> Result<(Self, ResumeState), DatabaseError> {
        Self::begin_at(db, fingerprint, total, Utc::now())
    }

    pub fn begin_at(
        db: &'a Database,
        fingerprint: &str,
        total: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<(Self, ResumeState), DatabaseError> {
        let existing = db.load_checkpoint(fingerprint)?;
        let mut resume = ResumeState::default();

        let checkpoint = match existing {
            Some(old) if now - old.updated_at < Duration::hours(CHECKPOINT_TTL_HOURS) => {
                info!(
                    fingerprint,
                    processed = old.processed,
                    failed = old.failed_ids.len(),
                    "resuming from checkpoint"
                );
                resume = ResumeState {
                    resumed: true,
                    processed: old.processed,
                    failed_ids: old.failed_ids.iter().cloned().collect(),
                    started_at: Some(old.started_at),
                };
                Checkpoint {
                    total: total.or(old.total),
                    updated_at: now,
                    ..old
                }
            }
            Some(old) => {
                warn!(
                    fingerprint,
                    updated_at = %old.updated_at,
                    "discarding stale checkpoint"
                );
                fresh(fingerprint, total, now)
            }
            None => fresh(fingerprint, total, now),
        };

        db.transaction(|conn| meta::save_checkpoint(conn, &checkpoint))?;
        Ok((
            Self {
                db,
                state: Mutex::new(checkpoint),
            },
            resume,
        ))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Checkpoint> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current checkpoint contents.
    pub fn snapshot(&self) -> Checkpoint {
        self.lock().clone()
    }

    /// Fold a settled batch in and persist.
    pub fn record_batch(&self, progress: &BatchProgress) -> Result<(), DatabaseError> {
        let mut checkpoint = self.lock();
        checkpoint.processed += progress.settled.len() as u64;
        let mut failed: BTreeSet<String> = checkpoint.failed_ids.drain(..).collect();
        for id in &progress.settled {
            failed.remove(id);
        }
        failed.extend(progress.failed.iter().cloned());
        checkpoint.failed_ids = failed.into_iter().collect();
        checkpoint.updated_at = Utc::now();
        self.db
            .transaction(|conn| meta::save_checkpoint(conn, &checkpoint))?;
        debug!(
            processed = checkpoint.processed,
            failed = checkpoint.failed_ids.len(),
            "checkpoint updated"
        );
        Ok(())
    }

    /// Mark ids as failed outside the batch executor (planning failures).
    pub fn record_failures(&self, ids: &[String]) -> Result<(), DatabaseError> {
        self.record_batch(&BatchProgress {
            settled: Vec::new(),
            failed: ids.to_vec(),
        })
    }

    /// Finish an uninterrupted run. With no failures the checkpoint is
    /// deleted; otherwise a fresh one holding only the failed ids is kept so
    /// the next run re-attempts them. Returns whether a checkpoint remains.
    pub fn complete(self) -> Result<bool, DatabaseError> {
        let checkpoint = self.lock().clone();
        if checkpoint.failed_ids.is_empty() {
            self.db.delete_checkpoint(&checkpoint.fingerprint)?;
            info!(fingerprint = %checkpoint.fingerprint, "run complete, checkpoint cleared");
            return Ok(false);
        }
        let now = Utc::now();
        let retained = Checkpoint {
            processed: 0,
            started_at: now,
            total: Some(checkpoint.failed_ids.len() as u64),
            updated_at: now,
            ..checkpoint
        };
        self.db
            .transaction(|conn| meta::save_checkpoint(conn, &retained))?;
        info!(
            fingerprint = %retained.fingerprint,
            failed = retained.failed_ids.len(),
            "run complete with failures, keeping checkpoint"
        );
        Ok(true)
    }
}

fn fresh(fingerprint: &str, total: Option<u64>, now: DateTime<Utc>) -> Checkpoint {
    Checkpoint {
        fingerprint: fingerprint.to_string(),
        processed: 0,
        failed_ids: Vec::new(),
        started_at: now,
        total,
        updated_at: now,
    }
}

impl BatchObserver for CheckpointManager<'_> {
    fn on_batch_complete(&self, progress: &BatchProgress) -> Result<(), SyncError> {
        self.record_batch(progress).map_err(SyncError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn progress(settled: &[&str], failed: &[&str]) -> BatchProgress {
        BatchProgress {
            settled: settled.iter().map(|s| s.to_string()).collect(),
            failed: failed.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_fresh_run_creates_checkpoint() {
        let db = setup_db();
        let (mgr, resume) = CheckpointManager::begin(&db, "subtree:1", Some(10)).unwrap();
        assert!(!resume.resumed);
        mgr.record_batch(&progress(&["1", "2"], &["3"])).unwrap();

        let stored = db.load_checkpoint("subtree:1").unwrap().unwrap();
        assert_eq!(stored.processed, 2);
        assert_eq!(stored.failed_ids, vec!["3"]);
        assert_eq!(stored.total, Some(10));
    }

    #[test]
    fn test_resume_within_ttl() {
        let db = setup_db();
        let (mgr, _) = CheckpointManager::begin(&db, "subtree:1", None).unwrap();
        mgr.record_batch(&progress(&["1", "2", "3"], &["4"])).unwrap();
        drop(mgr);

        let (mgr, resume) = CheckpointManager::begin(&db, "subtree:1", None).unwrap();
        assert!(resume.resumed);
        assert_eq!(resume.processed, 3);
        assert!(resume.must_retry("4"));

        mgr.record_batch(&progress(&["4", "5"], &[])).unwrap();
        let cp = mgr.snapshot();
        assert_eq!(cp.processed, 5);
        assert!(cp.failed_ids.is_empty());
        assert!(!mgr.complete().unwrap());
        assert!(db.load_checkpoint("subtree:1").unwrap().is_none());
    }

    #[test]
    fn test_stale_checkpoint_discarded() {
        let db = setup_db();
        let old = Utc::now() - Duration::hours(CHECKPOINT_TTL_HOURS + 1);
        db.save_checkpoint(&Checkpoint {
            fingerprint: "collection:ENG".into(),
            processed: 40,
            failed_ids: vec!["9".into()],
            started_at: old,
            total: Some(100),
            updated_at: old,
        })
        .unwrap();

        let (mgr, resume) = CheckpointManager::begin(&db, "collection:ENG", None).unwrap();
        assert!(!resume.resumed);
        assert_eq!(mgr.snapshot().processed, 0);
        assert!(mgr.snapshot().failed_ids.is_empty());
    }

    #[test]
    fn test_complete_keeps_only_failures() {
        let db = setup_db();
        let (mgr, _) = CheckpointManager::begin(&db, "item:7", None).unwrap();
        mgr.record_batch(&progress(&["a", "b"], &["c", "d"])).unwrap();
        assert!(mgr.complete().unwrap());

        let kept = db.load_checkpoint("item:7").unwrap().unwrap();
        assert_eq!(kept.processed, 0);
        assert_eq!(kept.failed_ids, vec!["c", "d"]);
    }

    #[test]
    fn test_should_skip_requires_matching_synced_record() {
        let mut record = ItemRecord::new("1", "a.md", "A");
        record.version = 4;
        record.state = SyncState::Synced;
        record.last_synced_at = Some(Utc::now());

        let resume = ResumeState {
            resumed: true,
            failed_ids: BTreeSet::from(["2".to_string()]),
            ..ResumeState::default()
        };
        assert!(resume.should_skip("1", Some(&record), 4));
        assert!(!resume.should_skip("1", Some(&record), 5));
        assert!(!resume.should_skip("1", None, 4));
        record.id = "2".into();
        assert!(!resume.should_skip("2", Some(&record), 4));
        assert!(!ResumeState::default().should_skip("1", Some(&record), 4));
    }
}

//! Entry points outside the pull/push cycle: status reporting, explicit
//! conflict resolution, and handling of remote-inaccessible items.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{info, warn, Instrument};

use super::apply::{MergeOutcome, PullOutcome};
use super::{
    count_states, Direction, FailureReport, ProgressObserver, RunContext, RunSummary, SyncEngine,
    SyncOptions,
};
use crate::batch::BatchOptions;
use crate::conflict::{contains_markers, render_diff, ConflictPolicy};
use crate::errors::{ConflictError, SyncError};
use crate::models::{Checkpoint, ItemFilter, ItemRecord, LinkRecord, SyncState};

/// How the local file compares to the last synced base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocalChange {
    Unchanged,
    Modified,
    Missing,
}

/// One tracked item as `status` sees it.
#[derive(Debug, Clone, Serialize)]
pub struct ItemStatus {
    pub id: String,
    pub path: String,
    pub title: String,
    /// Stored state, upgraded to `local-modified` when the file changed
    /// since the last run.
    pub state: SyncState,
    pub local: LocalChange,
    pub version: i64,
}

/// Offline view of the tree: no remote calls.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub scope: String,
    pub items: Vec<ItemStatus>,
    pub counts: BTreeMap<String, usize>,
    pub conflicts: Vec<String>,
    pub inaccessible: Vec<String>,
    /// Local documents not tracked by the store.
    pub untracked: Vec<String>,
    pub broken_links: Vec<LinkRecord>,
    pub orphans: Vec<String>,
    pub checkpoint: Option<Checkpoint>,
    pub last_run_at: Option<String>,
}

impl StatusReport {
    pub fn count(&self, state: SyncState) -> usize {
        self.counts.get(state.as_str()).copied().unwrap_or(0)
    }
}

/// Result of [`SyncEngine::recheck_inaccessible`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecheckReport {
    /// Fetchable again; content pulled.
    pub restored: Vec<String>,
    pub still_inaccessible: Vec<String>,
    pub failed: Vec<FailureReport>,
}

/// Result of [`SyncEngine::cleanup_inaccessible`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    /// Requested ids that are not remote-inaccessible.
    pub refused: Vec<String>,
    pub files_deleted: usize,
}

impl SyncEngine {
    fn local_change(&self, record: &ItemRecord) -> Result<LocalChange, SyncError> {
        Ok(match self.local.read_text(&record.path)? {
            None => LocalChange::Missing,
            Some(text) if record.base_hash.as_deref() == Some(self.codec.hash(&text).as_str()) => {
                LocalChange::Unchanged
            }
            Some(_) => LocalChange::Modified,
        })
    }

    /// Summarise the store and the local tree without touching the remote.
    pub fn status(&self) -> Result<StatusReport, SyncError> {
        let records = self.db.list_items(&ItemFilter::default())?;
        let mut items = Vec::with_capacity(records.len());
        for record in &records {
            let local = self.local_change(record)?;
            let state = match (record.state, local) {
                (SyncState::Synced, LocalChange::Modified) => SyncState::LocalModified,
                (state, _) => state,
            };
            items.push(ItemStatus {
                id: record.id.clone(),
                path: record.path.clone(),
                title: record.title.clone(),
                state,
                local,
                version: record.version,
            });
        }

        let tracked: std::collections::HashSet<&str> =
            records.iter().map(|r| r.path.as_str()).collect();
        let untracked = self
            .local
            .scan_documents()?
            .into_iter()
            .filter(|p| !tracked.contains(p.as_str()))
            .collect();

        Ok(StatusReport {
            scope: self.scope.fingerprint(),
            counts: count_states(items.iter().map(|i| i.state)),
            conflicts: self
                .db
                .list_conflicts()?
                .into_iter()
                .map(|c| c.item_id)
                .collect(),
            inaccessible: records
                .iter()
                .filter(|r| r.is_inaccessible())
                .map(|r| r.id.clone())
                .collect(),
            untracked,
            broken_links: self.db.list_broken_links()?,
            orphans: self.db.list_orphans()?,
            checkpoint: self.db.load_checkpoint(&self.scope.fingerprint())?,
            last_run_at: self.db.get_meta(super::META_LAST_RUN_AT)?,
            items,
        })
    }

    /// Unified diff from the local to the remote side of an open conflict.
    pub fn conflict_diff(&self, id: &str) -> Result<String, SyncError> {
        let conflict = self
            .db
            .get_conflict(id)?
            .ok_or_else(|| ConflictError::NotFound(id.to_string()))?;
        Ok(render_diff(&conflict.local, &conflict.remote))
    }

    /// Re-merge open conflicts under an explicit policy and push the result.
    /// An empty `ids` means every open conflict.
    pub async fn resolve(
        &self,
        ids: &[String],
        policy: ConflictPolicy,
    ) -> Result<RunSummary, SyncError> {
        let _guard = self.acquire()?;
        let ctx = RunContext::new(
            Direction::Sync,
            SyncOptions {
                policy: Some(policy),
                ..SyncOptions::default()
            },
            &self.config,
        );
        let span = ctx.span.clone();
        let result = self.resolve_inner(&ctx, ids).instrument(span).await;
        self.progress.finish();
        result
    }

    async fn resolve_inner(&self, ctx: &RunContext, ids: &[String]) -> Result<RunSummary, SyncError> {
        let mut summary = RunSummary::new(ctx);
        let open: Vec<String> = if ids.is_empty() {
            self.db
                .list_conflicts()?
                .into_iter()
                .map(|c| c.item_id)
                .collect()
        } else {
            let mut open = Vec::new();
            for id in ids {
                if self.db.get_conflict(id)?.is_some() {
                    open.push(id.clone());
                } else {
                    summary.fail(id, &ConflictError::NotFound(id.clone()).into());
                }
            }
            open
        };
        info!(count = open.len(), policy = %ctx.policy, "resolving conflicts");

        // Put the pre-merge local text back where the file still has markers;
        // a file the user already edited is taken as their side.
        for id in &open {
            let (Some(record), Some(conflict)) = (self.db.get_item(id)?, self.db.get_conflict(id)?)
            else {
                continue;
            };
            let current = self.local.read_text(&record.path)?;
            if current.as_deref().map_or(true, contains_markers) {
                self.local.write_text(&record.path, &conflict.local)?;
            }
        }

        self.progress.stage("resolve", open.len());
        let observer = ProgressObserver(self.progress.as_ref());
        let targets = HashMap::new();
        let prefetched = HashMap::new();
        let (targets, prefetched) = (&targets, &prefetched);
        let result = self
            .executor()
            .run(
                open,
                move |id| self.merge_one(ctx, targets, prefetched, id),
                &ctx.batch,
                &observer,
            )
            .await;
        for (_, outcome) in summary.absorb(result)? {
            match outcome {
                MergeOutcome::Merged { pushed } => {
                    summary.merged += 1;
                    if pushed {
                        summary.pushed += 1;
                    }
                }
                MergeOutcome::Unresolved { .. } => summary.conflicts += 1,
            }
        }
        summary.completed_at = Some(chrono::Utc::now().to_rfc3339());
        Ok(summary)
    }

    /// Try every remote-inaccessible item again. Items that can be fetched
    /// are pulled and leave the inaccessible state.
    pub async fn recheck_inaccessible(&self) -> Result<RecheckReport, SyncError> {
        let _guard = self.acquire()?;
        let ctx = RunContext::new(Direction::Pull, SyncOptions::default(), &self.config);
        let span = ctx.span.clone();
        let result = self.recheck_inner(&ctx).instrument(span).await;
        self.progress.finish();
        result
    }

    async fn recheck_inner(&self, ctx: &RunContext) -> Result<RecheckReport, SyncError> {
        let ids: Vec<String> = self
            .db
            .list_items(&ItemFilter {
                inaccessible: Some(true),
                ..ItemFilter::default()
            })?
            .into_iter()
            .map(|r| r.id)
            .collect();
        info!(count = ids.len(), "rechecking inaccessible items");

        self.progress.stage("recheck", ids.len());
        let observer = ProgressObserver(self.progress.as_ref());
        let targets = HashMap::new();
        let targets = &targets;
        let options = BatchOptions {
            skip_on_404: false,
            ..ctx.batch.clone()
        };
        let result = self
            .executor()
            .run(
                ids,
                move |id| self.pull_one(ctx, targets, id),
                &options,
                &observer,
            )
            .await;

        let mut report = RecheckReport::default();
        for failure in &result.failed {
            report
                .failed
                .push(FailureReport::new(&failure.id, &failure.error));
        }
        if let Some(fatal) = result.fatal {
            return Err(fatal.error);
        }
        for (id, outcome) in result.succeeded {
            match outcome {
                PullOutcome::Missing(_) => report.still_inaccessible.push(id),
                // Conflicting local edits are merged by the next sync.
                _ => report.restored.push(id),
            }
        }
        info!(
            restored = report.restored.len(),
            still_inaccessible = report.still_inaccessible.len(),
            "recheck finished"
        );
        Ok(report)
    }

    /// Forget remote-inaccessible items and delete their local files. An
    /// empty `ids` means every inaccessible item. Items in any other state
    /// are refused.
    pub fn cleanup_inaccessible(&self, ids: &[String]) -> Result<CleanupReport, SyncError> {
        let _guard = self.acquire()?;
        let mut report = CleanupReport::default();

        let candidates: Vec<ItemRecord> = if ids.is_empty() {
            self.db.list_items(&ItemFilter {
                inaccessible: Some(true),
                ..ItemFilter::default()
            })?
        } else {
            let mut found = Vec::new();
            for id in ids {
                match self.db.get_item(id)? {
                    Some(record) if record.is_inaccessible() => found.push(record),
                    _ => {
                        warn!(id = %id, "not remote-inaccessible, refusing to clean up");
                        report.refused.push(id.clone());
                    }
                }
            }
            found
        };

        for record in candidates {
            for attachment in self.db.list_attachments(&record.id)? {
                if self.local.remove(&attachment.path)? {
                    report.files_deleted += 1;
                }
            }
            if self.local.remove(&record.path)? {
                report.files_deleted += 1;
            }
            self.db.delete_item(&record.id)?;
            info!(id = %record.id, path = %record.path, "inaccessible item removed");
            report.removed.push(record.id);
        }
        Ok(report)
    }
}

//! Sync orchestration.
//!
//! The [`SyncEngine`] sequences one run over the configured scope:
//!
//! 1. Fetch the remote inventory (paginated, with bounded retry).
//! 2. Resolve ancestor chains and plan pulls, pushes, conflicts, moves and
//!    creations against the state store and the local tree.
//! 3. Apply moves parent-first.
//! 4. Pull, then push, then merge, each through the batch executor.
//! 5. Transfer attachments of pulled items.
//!
//! Progress is checkpointed after every batch. A single item's failure only
//! removes that item from the completed set; store corruption and
//! cancellation are the only things that stop a run early.
//!
//! A lock flag prevents two runs on one engine at the same time.

mod apply;
mod maintenance;
mod plan;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::batch::{
    BatchExecutor, BatchObserver, BatchOptions, BatchProgress, BatchResult, CancelSignal,
    RetryPolicy, Throttle,
};
use crate::checkpoint::{CheckpointManager, ResumeState};
use crate::codec::ContentCodec;
use crate::config::AppConfig;
use crate::conflict::{ChangeDetector, ConflictPolicy};
use crate::db::Database;
use crate::errors::{FailureKind, SyncError};
use crate::local::LocalTree;
use crate::remote::{Gateway, RemoteApi, RemoteItem, Scope};

pub use maintenance::{CleanupReport, ItemStatus, LocalChange, RecheckReport, StatusReport};
pub use plan::{MoveStep, Plan, PlanFailure};

use apply::{MergeOutcome, PullOutcome, PushOutcome};

/// Meta key holding the completion time of the last run.
pub const META_LAST_RUN_AT: &str = "last_run_at";
/// Meta key holding the id of the last run.
pub const META_LAST_RUN_ID: &str = "last_run_id";

// ---------------------------------------------------------------------------
// Run inputs
// ---------------------------------------------------------------------------

/// Which way content flows in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Remote to local only.
    Pull,
    /// Local to remote only.
    Push,
    /// Both ways.
    Sync,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Sync => "sync",
        }
    }

    fn pulls(&self) -> bool {
        matches!(self, Self::Pull | Self::Sync)
    }

    fn pushes(&self) -> bool {
        matches!(self, Self::Push | Self::Sync)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-run overrides of the configuration.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Stop after planning and return the plan.
    pub dry_run: bool,
    /// Pull every item regardless of version.
    pub force: bool,
    /// Conflict policy; the configured one when `None`.
    pub policy: Option<ConflictPolicy>,
    /// Maximum remote operations in flight; the configured value when `None`.
    pub concurrency: Option<usize>,
}

/// Everything one run threads through its stages.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub direction: Direction,
    pub options: SyncOptions,
    pub policy: ConflictPolicy,
    pub batch: BatchOptions,
    pub retry: RetryPolicy,
    pub resume: ResumeState,
    pub started_at: DateTime<Utc>,
    pub span: Span,
}

impl RunContext {
    fn new(direction: Direction, options: SyncOptions, config: &AppConfig) -> Self {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("sync_run", run_id = %run_id, direction = %direction);
        Self {
            policy: options.policy.unwrap_or(config.sync.conflict_policy),
            batch: BatchOptions {
                concurrency: options.concurrency.unwrap_or(config.sync.concurrency).max(1),
                batch_size: config.sync.batch_size.max(1),
                skip_on_404: config.sync.skip_on_404,
            },
            retry: config.retry.policy(),
            resume: ResumeState::default(),
            started_at: Utc::now(),
            run_id,
            direction,
            options,
            span,
        }
    }
}

// ---------------------------------------------------------------------------
// Run output
// ---------------------------------------------------------------------------

/// One id that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub id: String,
    pub kind: String,
    pub error: String,
}

impl FailureReport {
    fn new(id: impl Into<String>, error: &SyncError) -> Self {
        Self {
            id: id.into(),
            kind: kind_label(error.kind()).to_string(),
            error: error.to_string(),
        }
    }
}

fn kind_label(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::NotFound => "not-found",
        FailureKind::Retryable => "retryable",
        FailureKind::Fatal => "fatal",
        FailureKind::Terminal => "terminal",
    }
}

/// What a run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub direction: Direction,
    pub dry_run: bool,
    pub resumed: bool,
    pub pulled: usize,
    pub pushed: usize,
    pub created: usize,
    pub merged: usize,
    /// Items left with conflict markers.
    pub conflicts: usize,
    pub moved: usize,
    pub attachments: usize,
    pub unchanged: usize,
    /// Items that became remote-inaccessible during this run.
    pub inaccessible: usize,
    pub skipped: Vec<String>,
    pub failed: Vec<FailureReport>,
    pub cancelled: bool,
    pub checkpoint_kept: bool,
    pub started_at: String,
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
}

impl RunSummary {
    fn new(ctx: &RunContext) -> Self {
        Self {
            run_id: ctx.run_id.clone(),
            direction: ctx.direction,
            dry_run: ctx.options.dry_run,
            resumed: false,
            pulled: 0,
            pushed: 0,
            created: 0,
            merged: 0,
            conflicts: 0,
            moved: 0,
            attachments: 0,
            unchanged: 0,
            inaccessible: 0,
            skipped: Vec::new(),
            failed: Vec::new(),
            cancelled: false,
            checkpoint_kept: false,
            started_at: ctx.started_at.to_rfc3339(),
            completed_at: None,
            plan: None,
        }
    }

    /// Items whose content was transferred or reconciled.
    pub fn succeeded(&self) -> usize {
        self.pulled + self.pushed + self.created + self.merged
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.conflicts == 0 && !self.cancelled
    }

    fn fail(&mut self, id: impl Into<String>, error: &SyncError) {
        self.failed.push(FailureReport::new(id, error));
    }

    /// Fold the skipped and failed ids of one stage in. Returns the
    /// successes, or the fatal error that stopped the stage.
    fn absorb<T>(&mut self, result: BatchResult<T>) -> Result<Vec<(String, T)>, SyncError> {
        self.skipped.extend(result.skipped);
        for failure in &result.failed {
            self.fail(&failure.id, &failure.error);
        }
        if let Some(fatal) = result.fatal {
            return Err(fatal.error);
        }
        self.cancelled |= result.cancelled;
        Ok(result.succeeded)
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Receives progress as a run moves through its stages.
pub trait ProgressReporter: Send + Sync {
    /// A stage over `total` ids is starting.
    fn stage(&self, _name: &str, _total: usize) {}

    /// One id of the current stage finished.
    fn item_done(&self, _id: &str, _ok: bool) {}

    /// The run is over.
    fn finish(&self) {}
}

/// Reporter that ignores everything.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {}

/// Forwards executor callbacks to the checkpoint and the progress reporter.
pub(crate) struct RunObserver<'a> {
    checkpoint: &'a CheckpointManager<'a>,
    progress: &'a dyn ProgressReporter,
}

impl BatchObserver for RunObserver<'_> {
    fn on_item(&self, id: &str, ok: bool) {
        self.progress.item_done(id, ok);
    }

    fn on_batch_complete(&self, progress: &BatchProgress) -> Result<(), SyncError> {
        self.checkpoint.on_batch_complete(progress)
    }
}

/// Progress-only observer for runs that keep no checkpoint.
struct ProgressObserver<'a>(&'a dyn ProgressReporter);

impl BatchObserver for ProgressObserver<'_> {
    fn on_item(&self, id: &str, ok: bool) {
        self.0.item_done(id, ok);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The sync engine for one local tree.
pub struct SyncEngine {
    config: AppConfig,
    scope: Scope,
    db: Database,
    gateway: Gateway,
    codec: Arc<dyn ContentCodec>,
    local: LocalTree,
    detector: ChangeDetector,
    signal: CancelSignal,
    progress: Arc<dyn ProgressReporter>,
    /// Atomic flag preventing concurrent runs.
    running: Arc<AtomicBool>,
    run_started_at: Mutex<Option<DateTime<Utc>>>,
}

impl SyncEngine {
    pub fn new(
        config: AppConfig,
        db: Database,
        remote: Arc<dyn RemoteApi>,
        codec: Arc<dyn ContentCodec>,
    ) -> Self {
        info!(scope = %config.scope.to_scope(), root = %config.workspace.root.display(), "initializing sync engine");
        let throttle = Arc::new(Throttle::new());
        Self {
            scope: config.scope.to_scope(),
            gateway: Gateway::new(remote, throttle),
            local: LocalTree::new(
                config.workspace.root.clone(),
                config.workspace.exclude.clone(),
            ),
            detector: ChangeDetector::new(config.sync.inaccessible_threshold),
            signal: CancelSignal::new(),
            progress: Arc::new(SilentProgress),
            running: Arc::new(AtomicBool::new(false)),
            run_started_at: Mutex::new(None),
            config,
            db,
            codec,
        }
    }

    /// Share a cancellation signal with the caller.
    pub fn with_signal(mut self, signal: CancelSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }

    /// Check if a run is currently in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Take the run lock. Released when the guard drops, even on panic.
    fn acquire(&self) -> Result<SyncLockGuard, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = self
                .run_started_at
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            return Err(SyncError::AlreadyRunning { started_at });
        }
        *self.run_started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        Ok(SyncLockGuard(self.running.clone()))
    }

    fn executor(&self) -> BatchExecutor {
        BatchExecutor::new(self.gateway.throttle().clone(), self.signal.clone())
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Bring the local tree up to date with the remote.
    pub async fn pull(&self, options: SyncOptions) -> Result<RunSummary, SyncError> {
        self.run(Direction::Pull, options).await
    }

    /// Send local edits and new documents to the remote.
    pub async fn push(&self, options: SyncOptions) -> Result<RunSummary, SyncError> {
        self.run(Direction::Push, options).await
    }

    /// Pull and push in one run.
    pub async fn sync(&self, options: SyncOptions) -> Result<RunSummary, SyncError> {
        self.run(Direction::Sync, options).await
    }

    pub async fn run(
        &self,
        direction: Direction,
        options: SyncOptions,
    ) -> Result<RunSummary, SyncError> {
        let _guard = self.acquire()?;
        let ctx = RunContext::new(direction, options, &self.config);
        let span = ctx.span.clone();
        let result = self.execute(ctx).instrument(span).await;
        self.progress.finish();
        result
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    async fn execute(&self, mut ctx: RunContext) -> Result<RunSummary, SyncError> {
        info!(
            scope = %self.scope,
            dry_run = ctx.options.dry_run,
            force = ctx.options.force,
            policy = %ctx.policy,
            "sync run starting"
        );
        let mut summary = RunSummary::new(&ctx);
        self.db.integrity_check()?;

        self.progress.stage("inventory", 0);
        let inventory = self.fetch_inventory(&ctx).await?;
        info!(items = inventory.len(), "inventory fetched");

        if ctx.options.dry_run {
            let planned = self.plan(&ctx, &inventory).await?;
            info!(
                pulls = planned.plan.pulls.len(),
                pushes = planned.plan.pushes.len(),
                conflicts = planned.plan.conflicts.len(),
                moves = planned.plan.moves.len(),
                creates = planned.plan.creates.len(),
                "dry run, stopping after plan"
            );
            summary.plan = Some(planned.plan);
            summary.completed_at = Some(Utc::now().to_rfc3339());
            return Ok(summary);
        }

        let (checkpoint, resume) = CheckpointManager::begin(
            &self.db,
            &self.scope.fingerprint(),
            Some(inventory.len() as u64),
        )?;
        summary.resumed = resume.resumed;
        ctx.resume = resume;

        let planned = self.plan(&ctx, &inventory).await?;
        for failure in &planned.plan.failures {
            warn!(id = %failure.id, error = %failure.error, "item could not be planned");
            summary.failed.push(FailureReport {
                id: failure.id.clone(),
                kind: kind_label(FailureKind::Terminal).to_string(),
                error: failure.error.clone(),
            });
        }
        if !planned.plan.failures.is_empty() {
            let ids: Vec<String> = planned.plan.failures.iter().map(|f| f.id.clone()).collect();
            checkpoint.record_failures(&ids)?;
        }
        summary.unchanged += planned.plan.skips.len();

        let observer = RunObserver {
            checkpoint: &checkpoint,
            progress: self.progress.as_ref(),
        };
        let stopped = self
            .run_stages(&ctx, &planned, &observer, &mut summary)
            .await?;

        if stopped {
            info!("run interrupted, checkpoint kept for resume");
            summary.checkpoint_kept = true;
        } else {
            summary.checkpoint_kept = checkpoint.complete()?;
        }

        let completed_at = Utc::now();
        summary.completed_at = Some(completed_at.to_rfc3339());
        self.db
            .set_meta(META_LAST_RUN_AT, &completed_at.to_rfc3339())?;
        self.db.set_meta(META_LAST_RUN_ID, &ctx.run_id)?;

        info!(
            pulled = summary.pulled,
            pushed = summary.pushed,
            created = summary.created,
            merged = summary.merged,
            conflicts = summary.conflicts,
            moved = summary.moved,
            attachments = summary.attachments,
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            cancelled = summary.cancelled,
            "sync run finished"
        );
        Ok(summary)
    }

    /// Moves, pulls, pushes, merges, attachments. Returns whether the run
    /// was interrupted by cancellation.
    async fn run_stages(
        &self,
        ctx: &RunContext,
        planned: &plan::Planned,
        observer: &RunObserver<'_>,
        summary: &mut RunSummary,
    ) -> Result<bool, SyncError> {
        let executor = self.executor();
        let targets = &planned.targets;

        // Moves, parent-first.
        let blocked = self.apply_moves(planned, summary)?;
        let keep = |ids: &[String]| -> Vec<String> {
            ids.iter()
                .filter(|id| !blocked.contains(id.as_str()))
                .cloned()
                .collect()
        };

        let mut merges: Vec<String> = keep(&planned.plan.conflicts);
        let mut pushes: Vec<String> = keep(&planned.plan.pushes);
        let mut prefetched: HashMap<String, RemoteItem> = HashMap::new();
        let mut pulled_ids: Vec<String> = Vec::new();

        // Pulls.
        let pulls = keep(&planned.plan.pulls);
        if !pulls.is_empty() {
            self.progress.stage("pull", pulls.len());
            let result = executor
                .run_with_retry(
                    pulls,
                    move |id| self.pull_one(ctx, targets, id),
                    &ctx.batch,
                    &ctx.retry,
                    observer,
                )
                .await;
            for (id, outcome) in summary.absorb(result)? {
                match outcome {
                    PullOutcome::Written => {
                        summary.pulled += 1;
                        pulled_ids.push(id);
                    }
                    PullOutcome::Unchanged => {
                        summary.unchanged += 1;
                        pulled_ids.push(id);
                    }
                    PullOutcome::LocalAhead => {
                        if ctx.direction.pushes() {
                            pushes.push(id);
                        } else {
                            summary.unchanged += 1;
                        }
                    }
                    PullOutcome::Conflict(item) => {
                        prefetched.insert(id.clone(), *item);
                        merges.push(id);
                    }
                    PullOutcome::Missing(became) => {
                        if became {
                            summary.inaccessible += 1;
                        }
                        summary.skipped.push(id);
                    }
                }
            }
            if summary.cancelled {
                return Ok(true);
            }
        }

        // Pushes: updates, then creations.
        if ctx.direction.pushes() && !pushes.is_empty() {
            self.progress.stage("push", pushes.len());
            let result = executor
                .run_with_retry(
                    pushes,
                    move |id| self.push_one(ctx, id),
                    &ctx.batch,
                    &ctx.retry,
                    observer,
                )
                .await;
            for (id, outcome) in summary.absorb(result)? {
                match outcome {
                    PushOutcome::Pushed => summary.pushed += 1,
                    PushOutcome::Unchanged => summary.unchanged += 1,
                    PushOutcome::Conflict => merges.push(id),
                }
            }
            if summary.cancelled {
                return Ok(true);
            }
        }

        if ctx.direction.pushes() && !planned.plan.creates.is_empty() {
            self.progress.stage("create", planned.plan.creates.len());
            // No retry pass: a create that timed out may still have landed.
            let result = executor
                .run(
                    planned.plan.creates.clone(),
                    move |path| self.create_one(ctx, path),
                    &ctx.batch,
                    observer,
                )
                .await;
            summary.created += summary.absorb(result)?.len();
            if summary.cancelled {
                return Ok(true);
            }
        }

        // Merges.
        if !merges.is_empty() {
            let mut seen = HashSet::new();
            merges.retain(|id| seen.insert(id.clone()));
            self.progress.stage("merge", merges.len());
            let prefetched = &prefetched;
            let result = executor
                .run(
                    merges,
                    move |id| self.merge_one(ctx, targets, prefetched, id),
                    &ctx.batch,
                    observer,
                )
                .await;
            for (id, outcome) in summary.absorb(result)? {
                match outcome {
                    MergeOutcome::Merged { .. } => {
                        summary.merged += 1;
                        pulled_ids.push(id);
                    }
                    MergeOutcome::Unresolved { regions } => {
                        debug!(id = %id, regions, "left with conflict markers");
                        summary.conflicts += 1;
                    }
                }
            }
            if summary.cancelled {
                return Ok(true);
            }
        }

        // Attachments of pulled items.
        if self.config.sync.attachments && ctx.direction.pulls() && !pulled_ids.is_empty() {
            self.progress.stage("attachments", pulled_ids.len());
            let cancelled = self
                .transfer_attachments(ctx, pulled_ids, observer, summary)
                .await?;
            if cancelled {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Page through the scope inventory. Each page gets its own bounded
    /// retry; anything else aborts the run.
    async fn fetch_inventory(
        &self,
        ctx: &RunContext,
    ) -> Result<Vec<crate::remote::RemoteSummary>, SyncError> {
        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = crate::batch::with_retry("list_scope", &ctx.retry, || async {
                self.gateway
                    .list_scope(&self.scope, cursor.as_deref())
                    .await
                    .map_err(SyncError::from)
            })
            .await
            .map_err(|e| {
                error!(error = %e, "inventory fetch failed");
                SyncError::Inventory(e.to_string())
            })?;
            pages += 1;

            for summary in page.items {
                if seen.insert(summary.id.clone()) {
                    items.push(summary);
                }
            }
            match page.next_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => break,
            }
        }

        debug!(pages, items = items.len(), "inventory complete");
        Ok(items)
    }
}

/// RAII guard that clears the running flag on drop.
struct SyncLockGuard(Arc<AtomicBool>);

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-state counts, sorted by state name.
pub(crate) fn count_states(
    states: impl Iterator<Item = crate::models::SyncState>,
) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for state in states {
        *counts.entry(state.as_str().to_string()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PlainTextCodec;
    use crate::config::{ScopeConfig, ScopeKind};
    use crate::remote::MemoryRemote;

    fn engine(remote: Arc<MemoryRemote>, dir: &std::path::Path) -> SyncEngine {
        let config = AppConfig::minimal(
            "memory://",
            ScopeConfig {
                kind: ScopeKind::Subtree,
                id: "1".into(),
            },
            dir.to_path_buf(),
        );
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        SyncEngine::new(config, db, remote, Arc::new(PlainTextCodec))
    }

    #[test]
    fn test_direction_flags() {
        assert!(Direction::Pull.pulls() && !Direction::Pull.pushes());
        assert!(!Direction::Push.pulls() && Direction::Push.pushes());
        assert!(Direction::Sync.pulls() && Direction::Sync.pushes());
        assert_eq!(Direction::Sync.to_string(), "sync");
    }

    #[test]
    fn test_context_applies_overrides() {
        let config = AppConfig::minimal(
            "memory://",
            ScopeConfig {
                kind: ScopeKind::Collection,
                id: "ENG".into(),
            },
            std::path::PathBuf::from("."),
        );
        let ctx = RunContext::new(
            Direction::Pull,
            SyncOptions {
                concurrency: Some(3),
                policy: Some(ConflictPolicy::PreferRemote),
                ..SyncOptions::default()
            },
            &config,
        );
        assert_eq!(ctx.batch.concurrency, 3);
        assert_eq!(ctx.policy, ConflictPolicy::PreferRemote);
        assert!(!ctx.run_id.is_empty());

        let ctx = RunContext::new(Direction::Pull, SyncOptions::default(), &config);
        assert_eq!(ctx.batch.concurrency, config.sync.concurrency);
        assert_eq!(ctx.policy, config.sync.conflict_policy);
    }

    #[tokio::test]
    async fn test_concurrent_run_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new("ENG"));
        remote.put_item("1", "Root", None, "root\n");
        let engine = engine(remote, dir.path());

        let guard = engine.acquire().unwrap();
        assert!(engine.is_running());
        let err = engine.pull(SyncOptions::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning { .. }));
        drop(guard);
        assert!(!engine.is_running());

        let summary = engine.pull(SyncOptions::default()).await.unwrap();
        assert_eq!(summary.pulled, 1);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new("ENG"));
        remote.put_item("1", "Root", None, "root\n");
        remote.put_item("2", "Child", Some("1"), "child\n");
        let engine = engine(remote, dir.path());

        let summary = engine
            .pull(SyncOptions {
                dry_run: true,
                ..SyncOptions::default()
            })
            .await
            .unwrap();
        let plan = summary.plan.unwrap();
        assert_eq!(plan.pulls.len(), 2);
        assert_eq!(summary.pulled, 0);
        assert!(!dir.path().join("root.md").exists());
        assert_eq!(engine.db().count_items().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_scope_completes() {
        let dir = tempfile::TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new("ENG"));
        let engine = engine(remote, dir.path());
        let summary = engine.pull(SyncOptions::default()).await.unwrap();
        assert_eq!(summary.succeeded(), 0);
        assert!(!summary.checkpoint_kept);
    }

    #[test]
    fn test_count_states() {
        use crate::models::SyncState;
        let counts = count_states(
            [SyncState::Synced, SyncState::Conflict, SyncState::Synced].into_iter(),
        );
        assert_eq!(counts["synced"], 2);
        assert_eq!(counts["conflict"], 1);
    }
}

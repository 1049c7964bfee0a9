//! Per-item stage operations: moves, pulls, pushes, creations, merges and
//! attachment transfers.
//!
//! Every operation writes the local file first (only once the remote
//! response is in hand) and then commits the item's record, base text,
//! labels, contributors, links and conflict row in one store transaction.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::plan::{consistent_chain, Planned, Target};
use super::{RunContext, RunObserver, RunSummary, SyncEngine};
use crate::batch::{run_nested, with_retry, NestedJob};
use crate::codec::hash_bytes;
use crate::conflict::{ChangeDetector, ConflictResolver};
use crate::db::{attachments, conflicts, graph, items};
use crate::errors::{DatabaseError, RemoteError, SyncError, ValidationError};
use crate::hierarchy::{self, attachment_path, child_dir, ITEM_EXT};
use crate::models::{
    AttachmentRecord, ConflictRecord, InaccessibleReason, ItemRecord, LinkTarget, SyncState,
};
use crate::remote::{ItemDraft, RemoteAttachment, RemoteItem, Scope};

/// What pulling one item did.
#[derive(Debug)]
pub(crate) enum PullOutcome {
    /// Remote text written locally.
    Written,
    /// Nothing to write; metadata refreshed.
    Unchanged,
    /// Only the local side changed; the item still needs a push.
    LocalAhead,
    /// Both sides changed; merge with this fetched item.
    Conflict(Box<RemoteItem>),
    /// A tracked item could not be fetched. `true` when this miss made it
    /// remote-inaccessible.
    Missing(bool),
}

#[derive(Debug)]
pub(crate) enum PushOutcome {
    Pushed,
    Unchanged,
    /// The remote moved on since our base; merge.
    Conflict,
}

#[derive(Debug)]
pub(crate) enum MergeOutcome {
    Merged { pushed: bool },
    Unresolved { regions: usize },
}

/// Copy remote metadata onto a record.
fn apply_remote(record: &mut ItemRecord, item: &RemoteItem, path: &str, chain: Vec<String>) {
    record.path = path.to_string();
    record.title = item.title.clone();
    record.collection = item.collection.clone();
    record.version = item.version;
    record.parent_id = item.parent_id.clone();
    record.ancestors = consistent_chain(chain, item.parent_id.as_deref());
    record.created_by = item.created_by.clone();
    record.created_at = item.created_at;
    record.modified_by = item.modified_by.clone();
    record.modified_at = item.modified_at;
    record.status = item.status;
    record.restricted = item.restricted;
}

/// Resolve a relative document reference against the source item's path.
fn resolve_relative(source_path: &str, reference: &str) -> Option<String> {
    let reference = reference.split('#').next()?;
    if !reference.ends_with(&format!(".{ITEM_EXT}")) || reference.contains("://") {
        return None;
    }
    let mut segments: Vec<&str> = match source_path.rsplit_once('/') {
        Some((dir, _)) if !reference.starts_with('/') => dir.split('/').collect(),
        _ => Vec::new(),
    };
    for part in reference.trim_start_matches('/').split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}

/// Temporary location for an item that must vacate its path before its own
/// destination is free. Dot names are never scanned as new documents.
fn staging_path(path: &str, id: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/.pagesync-move-{id}.{ITEM_EXT}"),
        None => format!(".pagesync-move-{id}.{ITEM_EXT}"),
    }
}

/// A store commit for one item.
struct Commit<'a> {
    record: &'a ItemRecord,
    base: Option<&'a str>,
    item: Option<&'a RemoteItem>,
    conflict: Option<&'a ConflictRecord>,
    clear_conflict: bool,
}

impl<'a> Commit<'a> {
    fn record(record: &'a ItemRecord) -> Self {
        Self {
            record,
            base: None,
            item: None,
            conflict: None,
            clear_conflict: false,
        }
    }
}

impl SyncEngine {
    fn commit(&self, commit: Commit<'_>) -> Result<(), SyncError> {
        let links = commit.item.map(|i| self.codec.extract_links(&i.body));
        let id = commit.record.id.as_str();
        self.db.transaction(|conn| {
            items::upsert_item(conn, commit.record)?;
            if let Some(base) = commit.base {
                items::set_base_content(conn, id, base)?;
            }
            if let Some(item) = commit.item {
                graph::replace_labels(conn, id, &item.labels)?;
                graph::replace_contributors(conn, id, &item.contributors)?;
            }
            if let Some(links) = &links {
                let mut resolved = Vec::with_capacity(links.len());
                for link in links {
                    let target = match link {
                        LinkTarget::Broken(raw) => {
                            match resolve_relative(&commit.record.path, raw) {
                                Some(path) => match items::get_item_by_path(conn, &path)? {
                                    Some(target) => LinkTarget::Item(target.id),
                                    None => link.clone(),
                                },
                                None => link.clone(),
                            }
                        }
                        other => other.clone(),
                    };
                    resolved.push(target);
                }
                graph::replace_links(conn, id, &resolved)?;
            }
            if let Some(conflict) = commit.conflict {
                conflicts::save_conflict(conn, conflict)?;
            } else if commit.clear_conflict {
                conflicts::delete_conflict(conn, id)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn encode(&self, path: &str, text: &str) -> Result<String, SyncError> {
        self.codec
            .encode(text)
            .map_err(|e| SyncError::from(e.at(path)))
    }

    /// Refuse to touch `path` when another tracked item owns it.
    fn ensure_path_free(&self, id: &str, path: &str) -> Result<(), SyncError> {
        match self.db.get_item_by_path(path)? {
            Some(holder) if holder.id != id => Err(DatabaseError::PathConflict {
                path: path.to_string(),
                existing_id: holder.id,
            }
            .into()),
            _ => Ok(()),
        }
    }

    /// Record a not-found/forbidden answer for a tracked item.
    fn record_miss(&self, mut record: ItemRecord, err: &RemoteError) -> Result<bool, SyncError> {
        let reason = match err {
            RemoteError::NotFound { .. } => InaccessibleReason::NotFound,
            RemoteError::Forbidden { .. } => InaccessibleReason::Forbidden,
            _ => InaccessibleReason::Unknown,
        };
        let outcome = self.detector.record_miss(&mut record, reason, Utc::now());
        self.db.upsert_item(&record)?;
        Ok(outcome == crate::conflict::MissOutcome::BecameInaccessible)
    }

    // -----------------------------------------------------------------------
    // Moves
    // -----------------------------------------------------------------------

    /// Apply planned moves, parent-first. Returns the ids whose move failed;
    /// nothing else is done to those items this run.
    ///
    /// An item sitting where another moving item is headed is first moved
    /// to a staging name next to it, so swaps and rotations complete.
    pub(crate) fn apply_moves(
        &self,
        planned: &Planned,
        summary: &mut RunSummary,
    ) -> Result<HashSet<String>, SyncError> {
        let mut blocked = HashSet::new();
        if planned.plan.moves.is_empty() {
            return Ok(blocked);
        }
        self.progress.stage("move", planned.plan.moves.len());

        let wanted: HashMap<&str, &str> = planned
            .plan
            .moves
            .iter()
            .map(|step| (step.to.as_str(), step.id.as_str()))
            .collect();
        for step in &planned.plan.moves {
            let Some(record) = self.db.get_item(&step.id)? else {
                continue;
            };
            if !wanted
                .get(record.path.as_str())
                .is_some_and(|other| *other != step.id)
            {
                continue;
            }
            let staging = staging_path(&record.path, &step.id);
            if let Err(err) = self.move_record(record, &staging, None)? {
                warn!(id = %step.id, error = %err, "could not stage move");
                summary.fail(&step.id, &err);
                blocked.insert(step.id.clone());
                self.progress.item_done(&step.id, false);
            }
        }

        for step in &planned.plan.moves {
            if blocked.contains(&step.id) {
                continue;
            }
            // An earlier parent move may already have carried this item.
            let Some(record) = self.db.get_item(&step.id)? else {
                continue;
            };
            let Some(target) = planned.targets.get(&step.id) else {
                continue;
            };
            if record.path == step.to {
                self.progress.item_done(&step.id, true);
                continue;
            }

            let from = record.path.clone();
            match self.move_record(record, &step.to, Some(target.chain.as_slice()))? {
                Ok(()) => {
                    info!(id = %step.id, from = %from, to = %step.to, "item moved");
                    summary.moved += 1;
                    self.progress.item_done(&step.id, true);
                }
                Err(err) => {
                    warn!(id = %step.id, from = %from, to = %step.to, error = %err, "move failed");
                    summary.fail(&step.id, &err);
                    blocked.insert(step.id.clone());
                    self.progress.item_done(&step.id, false);
                }
            }
        }
        Ok(blocked)
    }

    /// Move one item's file and child directory to `to` and record it, with
    /// its descendants' paths. `chain` replaces the ancestors when the item
    /// changes parent. The outer error is fatal to the run; the inner one
    /// fails this item only.
    fn move_record(
        &self,
        mut record: ItemRecord,
        to: &str,
        chain: Option<&[String]>,
    ) -> Result<Result<(), SyncError>, SyncError> {
        let from = record.path.clone();
        if let Err(err) = hierarchy::relocate(self.local.root(), &from, to) {
            return Ok(Err(err.into()));
        }

        record.path = to.to_string();
        if let Some(chain) = chain {
            record.parent_id = chain.last().cloned();
            record.ancestors = chain.to_vec();
        }
        let mut prefix = record.ancestors.clone();
        prefix.push(record.id.clone());

        let committed = self.db.transaction(|conn| {
            items::upsert_item(conn, &record)?;
            items::rewrite_path_prefix(conn, child_dir(&from), child_dir(to))?;
            if chain.is_some() {
                items::rewrite_descendant_chains(conn, &record.id, &prefix)?;
            }
            Ok(())
        });
        match committed {
            Ok(()) => {
                debug!(id = %record.id, from = %from, to = %to, "move recorded");
                Ok(Ok(()))
            }
            Err(err @ DatabaseError::Corruption(_)) => Err(err.into()),
            Err(err) => Ok(Err(err.into())),
        }
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    #[instrument(skip(self, ctx, targets), fields(run_id = %ctx.run_id))]
    pub(crate) async fn pull_one(
        &self,
        ctx: &RunContext,
        targets: &HashMap<String, Target>,
        id: String,
    ) -> Result<PullOutcome, SyncError> {
        let stored = self.db.get_item(&id)?;
        let item = match self.gateway.get_item(&id).await {
            Ok(item) => item,
            Err(err @ (RemoteError::NotFound { .. } | RemoteError::Forbidden { .. })) => {
                return match stored {
                    Some(record) => Ok(PullOutcome::Missing(self.record_miss(record, &err)?)),
                    None => Err(err.into()),
                };
            }
            Err(err) => return Err(err.into()),
        };

        let (path, chain) = match (targets.get(&id), &stored) {
            (Some(target), _) => (target.path.clone(), target.chain.clone()),
            (None, Some(record)) => (record.path.clone(), record.ancestors.clone()),
            (None, None) => (
                format!("{}.{ITEM_EXT}", hierarchy::slugify(&item.title)),
                Vec::new(),
            ),
        };

        self.ensure_path_free(&id, &path)?;

        let remote_text = self.codec.decode(&item.body);
        let remote_hash = self.codec.hash(&remote_text);
        let local_text = self.local.read_text(&path)?;
        let local_hash = local_text.as_deref().map(|t| self.codec.hash(t));
        let base_hash = stored.as_ref().and_then(|r| r.base_hash.clone());

        let mut record = stored
            .clone()
            .unwrap_or_else(|| ItemRecord::new(&id, &path, &item.title));
        ChangeDetector::record_hit(&mut record);
        apply_remote(&mut record, &item, &path, chain);
        record.remote_hash = Some(remote_hash.clone());

        let state = match (&local_hash, &base_hash) {
            // Missing locally: restore.
            (None, _) => SyncState::RemoteModified,
            (Some(local), None) if *local == remote_hash => SyncState::Synced,
            (Some(_), None) => SyncState::Conflict,
            (Some(local), Some(base)) => {
                let classification =
                    ChangeDetector::classify(Some(local), Some(&remote_hash), Some(base));
                classification.state
            }
        };

        match state {
            SyncState::Synced => {
                record.local_hash = Some(remote_hash.clone());
                record.base_hash = Some(remote_hash);
                record.state = SyncState::Synced;
                record.last_synced_at = Some(Utc::now());
                let base_moved = base_hash.as_deref() != record.base_hash.as_deref();
                self.commit(Commit {
                    base: base_moved.then_some(remote_text.as_str()),
                    item: Some(&item),
                    ..Commit::record(&record)
                })?;
                debug!(path = %path, version = item.version, "already in sync");
                Ok(PullOutcome::Unchanged)
            }
            SyncState::LocalModified => {
                record.local_hash = local_hash;
                record.state = SyncState::LocalModified;
                self.commit(Commit {
                    item: Some(&item),
                    ..Commit::record(&record)
                })?;
                Ok(PullOutcome::LocalAhead)
            }
            SyncState::Conflict => {
                debug!(path = %path, "both sides changed");
                Ok(PullOutcome::Conflict(Box::new(item)))
            }
            _ => {
                self.local.write_text(&path, &remote_text)?;
                record.local_hash = Some(remote_hash.clone());
                record.base_hash = Some(remote_hash);
                record.state = SyncState::Synced;
                record.last_synced_at = Some(Utc::now());
                self.commit(Commit {
                    base: Some(&remote_text),
                    item: Some(&item),
                    clear_conflict: true,
                    ..Commit::record(&record)
                })?;
                info!(path = %path, version = item.version, "pulled");
                Ok(PullOutcome::Written)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    pub(crate) async fn push_one(
        &self,
        ctx: &RunContext,
        id: String,
    ) -> Result<PushOutcome, SyncError> {
        let mut record = self.db.get_item(&id)?.ok_or_else(|| DatabaseError::NotFound {
            entity: "item".into(),
            id: id.clone(),
        })?;
        let path = record.path.clone();
        let Some(text) = self.local.read_text(&path)? else {
            return Ok(PushOutcome::Unchanged);
        };

        if record.state == SyncState::Conflict {
            // The user removed the markers: the remote side of the conflict
            // becomes the base and their text is pushed on top of it.
            if let Some(conflict) = self.db.get_conflict(&id)? {
                record.version = conflict.remote_version;
                record.base_hash = Some(self.codec.hash(&conflict.remote));
                record.local_hash = Some(self.codec.hash(&text));
                record.state = SyncState::LocalModified;
                self.commit(Commit {
                    base: Some(&conflict.remote),
                    clear_conflict: true,
                    ..Commit::record(&record)
                })?;
                info!(path = %path, "conflict resolved locally");
            }
        }

        let body = self.encode(&path, &text)?;
        let draft = ItemDraft {
            title: record.title.clone(),
            parent_id: record.parent_id.clone(),
            collection: record.collection.clone(),
            body,
            base_version: Some(record.version),
        };
        let updated = match self.gateway.update_item(&id, &draft).await {
            Ok(updated) => updated,
            Err(RemoteError::VersionConflict { .. }) => {
                debug!(path = %path, "remote changed under us");
                return Ok(PushOutcome::Conflict);
            }
            Err(err) => return Err(err.into()),
        };

        let normalised = self.codec.decode(&updated.body);
        if normalised != text {
            self.local.write_text(&path, &normalised)?;
        }
        let hash = self.codec.hash(&normalised);
        let chain = record.ancestors.clone();
        apply_remote(&mut record, &updated, &path, chain);
        record.local_hash = Some(hash.clone());
        record.remote_hash = Some(hash.clone());
        record.base_hash = Some(hash);
        record.state = SyncState::Synced;
        record.last_synced_at = Some(Utc::now());
        self.commit(Commit {
            base: Some(&normalised),
            item: Some(&updated),
            clear_conflict: true,
            ..Commit::record(&record)
        })?;
        info!(path = %path, version = updated.version, "pushed");
        Ok(PushOutcome::Pushed)
    }

    /// Parent, chain and collection for a new document at `path`.
    fn placement_for_new(
        &self,
        path: &str,
    ) -> Result<(Option<String>, Vec<String>, String), SyncError> {
        let reject = |detail: &str| {
            SyncError::from(ValidationError {
                path: path.to_string(),
                detail: detail.to_string(),
            })
        };
        if let Scope::Item(_) = self.scope {
            return Err(reject("an item scope does not accept new documents"));
        }
        match path.rsplit_once('/') {
            Some((dir, _)) => {
                let parent_path = format!("{dir}.{ITEM_EXT}");
                let parent = self
                    .db
                    .get_item_by_path(&parent_path)?
                    .ok_or_else(|| reject(&format!("no tracked parent document at '{parent_path}'")))?;
                let mut chain = parent.ancestors.clone();
                chain.push(parent.id.clone());
                Ok((Some(parent.id), chain, parent.collection))
            }
            None => match &self.scope {
                Scope::Collection(key) => Ok((None, Vec::new(), key.clone())),
                _ => Err(reject(
                    "top-level documents are only accepted in a collection scope",
                )),
            },
        }
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    pub(crate) async fn create_one(&self, ctx: &RunContext, path: String) -> Result<String, SyncError> {
        let text = self.local.read_text(&path)?.ok_or_else(|| {
            SyncError::io(
                self.local.abs(&path),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )
        })?;
        let body = self.encode(&path, &text)?;
        let (parent_id, chain, collection) = self.placement_for_new(&path)?;
        let title = std::path::Path::new(&path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());

        let created = self
            .gateway
            .create_item(&ItemDraft {
                title,
                parent_id,
                collection,
                body,
                base_version: None,
            })
            .await?;

        let normalised = self.codec.decode(&created.body);
        if normalised != text {
            self.local.write_text(&path, &normalised)?;
        }
        let hash = self.codec.hash(&normalised);
        let mut record = ItemRecord::new(&created.id, &path, &created.title);
        apply_remote(&mut record, &created, &path, chain);
        record.local_hash = Some(hash.clone());
        record.remote_hash = Some(hash.clone());
        record.base_hash = Some(hash);
        record.state = SyncState::Synced;
        record.last_synced_at = Some(Utc::now());
        self.commit(Commit {
            base: Some(&normalised),
            item: Some(&created),
            ..Commit::record(&record)
        })?;
        info!(path = %path, id = %created.id, "created");
        Ok(created.id)
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    #[instrument(skip(self, ctx, targets, prefetched), fields(run_id = %ctx.run_id))]
    pub(crate) async fn merge_one(
        &self,
        ctx: &RunContext,
        targets: &HashMap<String, Target>,
        prefetched: &HashMap<String, RemoteItem>,
        id: String,
    ) -> Result<MergeOutcome, SyncError> {
        let stored = self.db.get_item(&id)?;
        let item = match prefetched.get(&id) {
            Some(item) => item.clone(),
            None => self.gateway.get_item(&id).await?,
        };
        let (path, chain) = match (targets.get(&id), &stored) {
            (Some(target), _) => (target.path.clone(), target.chain.clone()),
            (None, Some(record)) => (record.path.clone(), record.ancestors.clone()),
            (None, None) => (
                format!("{}.{ITEM_EXT}", hierarchy::slugify(&item.title)),
                Vec::new(),
            ),
        };

        self.ensure_path_free(&id, &path)?;

        let local = self.local.read_text(&path)?.unwrap_or_default();
        let remote = self.codec.decode(&item.body);
        let base = self.db.get_base_content(&id)?.unwrap_or_default();
        let resolution = ConflictResolver::resolve(&path, &base, &local, &remote, ctx.policy)?;

        let mut record = stored.unwrap_or_else(|| ItemRecord::new(&id, &path, &item.title));
        apply_remote(&mut record, &item, &path, chain);
        let remote_hash = self.codec.hash(&remote);
        record.remote_hash = Some(remote_hash.clone());

        if resolution.unresolved {
            self.local.write_text(&path, &resolution.content)?;
            record.local_hash = Some(self.codec.hash(&resolution.content));
            record.state = SyncState::Conflict;
            let conflict = ConflictRecord {
                item_id: id.clone(),
                base,
                local,
                remote,
                remote_version: item.version,
                regions: resolution.regions,
                detected_at: Utc::now(),
            };
            self.commit(Commit {
                item: Some(&item),
                conflict: Some(&conflict),
                ..Commit::record(&record)
            })?;
            warn!(path = %path, regions = resolution.regions, "conflict left for the user");
            return Ok(MergeOutcome::Unresolved {
                regions: resolution.regions,
            });
        }

        let merged = resolution.content;
        if merged != local {
            self.local.write_text(&path, &merged)?;
        }

        if merged == remote || !ctx.direction.pushes() {
            let merged_hash = self.codec.hash(&merged);
            record.state = if merged == remote {
                SyncState::Synced
            } else {
                SyncState::LocalModified
            };
            record.local_hash = Some(merged_hash);
            record.base_hash = Some(remote_hash);
            record.last_synced_at = Some(Utc::now());
            self.commit(Commit {
                base: Some(&remote),
                item: Some(&item),
                clear_conflict: true,
                ..Commit::record(&record)
            })?;
            info!(path = %path, "merged");
            return Ok(MergeOutcome::Merged { pushed: false });
        }

        let body = self.encode(&path, &merged)?;
        let updated = self
            .gateway
            .update_item(
                &id,
                &ItemDraft {
                    title: item.title.clone(),
                    parent_id: item.parent_id.clone(),
                    collection: item.collection.clone(),
                    body,
                    base_version: Some(item.version),
                },
            )
            .await?;
        let normalised = self.codec.decode(&updated.body);
        if normalised != merged {
            self.local.write_text(&path, &normalised)?;
        }
        let hash = self.codec.hash(&normalised);
        let chain = record.ancestors.clone();
        apply_remote(&mut record, &updated, &path, chain);
        record.local_hash = Some(hash.clone());
        record.remote_hash = Some(hash.clone());
        record.base_hash = Some(hash);
        record.state = SyncState::Synced;
        record.last_synced_at = Some(Utc::now());
        self.commit(Commit {
            base: Some(&normalised),
            item: Some(&updated),
            clear_conflict: true,
            ..Commit::record(&record)
        })?;
        info!(path = %path, version = updated.version, "merged and pushed");
        Ok(MergeOutcome::Merged { pushed: true })
    }

    // -----------------------------------------------------------------------
    // Attachments
    // -----------------------------------------------------------------------

    /// List and download the changed attachments of `item_ids`. Returns
    /// whether cancellation interrupted the listing.
    pub(crate) async fn transfer_attachments(
        &self,
        ctx: &RunContext,
        item_ids: Vec<String>,
        observer: &RunObserver<'_>,
        summary: &mut RunSummary,
    ) -> Result<bool, SyncError> {
        let executor = self.executor();
        let listed = executor
            .run(
                item_ids,
                move |id| async move {
                    with_retry("list_attachments", &ctx.retry, || async {
                        self.gateway
                            .list_attachments(&id)
                            .await
                            .map_err(SyncError::from)
                    })
                    .await
                },
                &ctx.batch,
                observer,
            )
            .await;
        let cancelled = listed.cancelled;
        let listed = summary.absorb(listed)?;

        let mut jobs = Vec::new();
        for (item_id, remote_atts) in listed {
            let Some(record) = self.db.get_item(&item_id)? else {
                continue;
            };
            let mut work = Vec::new();
            for att in remote_atts {
                let path = attachment_path(&record.path, &att.file_name);
                let current = self.db.get_attachment(&att.id)?.is_some_and(|stored| {
                    stored.version == att.version
                        && stored.path == path
                        && self.local.abs(&stored.path).is_file()
                });
                if !current {
                    work.push((att.id.clone(), (att, path)));
                }
            }
            if !work.is_empty() {
                jobs.push(NestedJob {
                    owner: item_id,
                    items: work,
                });
            }
        }
        if jobs.is_empty() || cancelled {
            return Ok(cancelled);
        }

        let outcomes = run_nested(
            jobs,
            self.config.sync.attachment_items,
            self.config.sync.attachments_per_item,
            move |owner, (att, path): (RemoteAttachment, String)| async move {
                self.download_attachment(ctx, &owner, att, path).await
            },
        )
        .await;

        for outcome in outcomes {
            summary.attachments += outcome.succeeded.len();
            for (att_id, err) in &outcome.failed {
                warn!(item = %outcome.owner, attachment = %att_id, error = %err, "attachment failed");
                summary.fail(format!("{}/{}", outcome.owner, att_id), err);
            }
        }
        Ok(false)
    }

    async fn download_attachment(
        &self,
        ctx: &RunContext,
        owner: &str,
        att: RemoteAttachment,
        path: String,
    ) -> Result<(), SyncError> {
        let bytes = with_retry("download_attachment", &ctx.retry, || async {
            self.gateway
                .download_attachment(&att)
                .await
                .map_err(SyncError::from)
        })
        .await?;
        self.local.write_bytes(&path, &bytes)?;
        let hash = hash_bytes(&bytes);
        let record = AttachmentRecord {
            id: att.id.clone(),
            item_id: owner.to_string(),
            file_name: att.file_name.clone(),
            media_type: att.media_type.clone(),
            size: bytes.len() as i64,
            path: path.clone(),
            version: att.version,
            local_hash: Some(hash.clone()),
            remote_hash: Some(hash.clone()),
            base_hash: Some(hash),
            state: SyncState::Synced,
        };
        self.db
            .transaction(|conn| attachments::upsert_attachment(conn, &record))?;
        debug!(path = %path, bytes = bytes.len(), "attachment downloaded");
        Ok(())
    }
}

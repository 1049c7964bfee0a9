//! Planning: diff the inventory against the store and the local tree.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{Direction, RunContext, SyncEngine};
use crate::batch::with_retry;
use crate::conflict::{contains_markers, ChangeDetector};
use crate::errors::SyncError;
use crate::hierarchy::PathMapper;
use crate::models::{ItemFilter, ItemRecord, SyncState};
use crate::remote::{RemoteSummary, Scope};

/// A file relocation caused by a remote rename or move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoveStep {
    pub id: String,
    pub from: String,
    pub to: String,
    /// Ancestor count at the destination; moves run shallowest first.
    pub depth: usize,
}

/// An item that could not be planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanFailure {
    pub id: String,
    pub error: String,
}

/// What a run intends to do.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    pub pulls: Vec<String>,
    pub pushes: Vec<String>,
    pub conflicts: Vec<String>,
    pub moves: Vec<MoveStep>,
    /// Local paths of new documents.
    pub creates: Vec<String>,
    pub skips: Vec<String>,
    pub failures: Vec<PlanFailure>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.pulls.is_empty()
            && self.pushes.is_empty()
            && self.conflicts.is_empty()
            && self.moves.is_empty()
            && self.creates.is_empty()
    }
}

/// Where an inventory item belongs locally.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub path: String,
    pub chain: Vec<String>,
}

/// A plan plus the per-item placement the stages need.
#[derive(Debug, Default)]
pub(crate) struct Planned {
    pub plan: Plan,
    pub targets: HashMap<String, Target>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Pull,
    Push,
    Conflict,
    Skip,
}

/// Make a chain agree with the parent the remote reports: the last entry
/// must be the parent, and a parentless item has no chain.
pub(crate) fn consistent_chain(mut chain: Vec<String>, parent_id: Option<&str>) -> Vec<String> {
    let Some(parent) = parent_id else {
        return Vec::new();
    };
    match chain.iter().position(|a| a == parent) {
        Some(pos) => chain.truncate(pos + 1),
        None => chain.push(parent.to_string()),
    }
    chain
}

impl SyncEngine {
    /// Build the plan for one run.
    pub(crate) async fn plan(
        &self,
        ctx: &RunContext,
        inventory: &[RemoteSummary],
    ) -> Result<Planned, SyncError> {
        let scope_root = self.scope.root_id().map(str::to_string);
        let stored: HashMap<String, ItemRecord> = self
            .db
            .list_items(&ItemFilter::default())?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut mapper = PathMapper::new(scope_root.clone());
        for item in inventory {
            mapper.insert(&item.id, &item.title, item.parent_id.as_deref());
        }

        // Chains for the tops of what the inventory shows.
        for item in inventory {
            let Some(parent) = item.parent_id.as_deref() else {
                continue;
            };
            if mapper.contains(parent) {
                continue;
            }
            let known = stored
                .get(&item.id)
                .filter(|r| r.parent_id.as_deref() == Some(parent))
                .map(|r| r.ancestors.clone());
            let chain = match known {
                Some(chain) => chain,
                None if scope_root.as_deref() == Some(item.id.as_str()) => {
                    self.remote_chain(ctx, &item.id).await?
                }
                None => continue,
            };
            mapper.set_known_chain(&item.id, consistent_chain(chain, Some(parent)));
        }

        Self::avoid_held_paths(&mut mapper, inventory, &stored);

        let mut planned = Planned::default();
        let in_inventory: HashSet<&str> = inventory.iter().map(|i| i.id.as_str()).collect();

        for item in inventory {
            let chain = match mapper.chain(&item.id) {
                Ok(chain) => consistent_chain(chain, item.parent_id.as_deref()),
                Err(err) => {
                    warn!(id = %item.id, error = %err, "cannot place item");
                    planned.plan.failures.push(PlanFailure {
                        id: item.id.clone(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            let path = mapper.path_for(&item.id, &chain);
            let record = stored.get(&item.id);

            // Inaccessible items stay where they are until a recheck.
            if let Some(record) = record.filter(|r| !r.is_inaccessible()) {
                if record.path != path {
                    planned.plan.moves.push(MoveStep {
                        id: item.id.clone(),
                        from: record.path.clone(),
                        to: path.clone(),
                        depth: chain.len(),
                    });
                }
            }

            match self.route(ctx, item, record)? {
                Route::Pull => planned.plan.pulls.push(item.id.clone()),
                Route::Push => planned.plan.pushes.push(item.id.clone()),
                Route::Conflict => planned.plan.conflicts.push(item.id.clone()),
                Route::Skip => planned.plan.skips.push(item.id.clone()),
            }
            planned
                .targets
                .insert(item.id.clone(), Target { path, chain });
        }

        // Tracked items the inventory no longer lists are fetched directly.
        if ctx.direction.pulls() {
            for record in stored.values() {
                if in_inventory.contains(record.id.as_str())
                    || record.is_inaccessible()
                    || !self.tracked_in_scope(record)
                {
                    continue;
                }
                debug!(id = %record.id, path = %record.path, "tracked item missing from inventory");
                planned.plan.pulls.push(record.id.clone());
            }
        }

        if ctx.direction.pushes() {
            let claimed: HashSet<&str> = stored
                .values()
                .map(|r| r.path.as_str())
                .chain(planned.targets.values().map(|t| t.path.as_str()))
                .collect();
            for path in self.local.scan_documents()? {
                if !claimed.contains(path.as_str()) {
                    planned.plan.creates.push(path);
                }
            }
        }

        planned.plan.moves.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then_with(|| a.to.cmp(&b.to))
        });

        info!(
            pulls = planned.plan.pulls.len(),
            pushes = planned.plan.pushes.len(),
            conflicts = planned.plan.conflicts.len(),
            moves = planned.plan.moves.len(),
            creates = planned.plan.creates.len(),
            skips = planned.plan.skips.len(),
            failures = planned.plan.failures.len(),
            "plan built"
        );
        Ok(planned)
    }

    /// Suffix inventory items whose computed path is held by a tracked item
    /// this run will not place: one missing from the inventory, one that
    /// cannot be placed, or one that is remote-inaccessible. Parents are
    /// settled before their children.
    fn avoid_held_paths(
        mapper: &mut PathMapper,
        inventory: &[RemoteSummary],
        stored: &HashMap<String, ItemRecord>,
    ) {
        let mut placed: Vec<(usize, &RemoteSummary)> = inventory
            .iter()
            .filter_map(|item| mapper.chain(&item.id).ok().map(|c| (c.len(), item)))
            .collect();
        let placed_ids: HashSet<&str> = placed.iter().map(|(_, i)| i.id.as_str()).collect();
        let held: HashMap<&str, &str> = stored
            .values()
            .filter(|r| !placed_ids.contains(r.id.as_str()) || r.is_inaccessible())
            .map(|r| (r.path.as_str(), r.id.as_str()))
            .collect();
        if held.is_empty() {
            return;
        }

        placed.sort_by_key(|(depth, _)| *depth);
        for (_, item) in placed {
            let Ok(chain) = mapper.chain(&item.id) else {
                continue;
            };
            let chain = consistent_chain(chain, item.parent_id.as_deref());
            let path = mapper.path_for(&item.id, &chain);
            if let Some(holder) = held.get(path.as_str()).filter(|h| **h != item.id) {
                debug!(id = %item.id, path = %path, holder = %holder, "path held by another item");
                mapper.force_suffix(&item.id);
            }
        }
    }

    /// Ancestors of `id` as the remote reports them.
    async fn remote_chain(&self, ctx: &RunContext, id: &str) -> Result<Vec<String>, SyncError> {
        let ancestors = with_retry("get_ancestors", &ctx.retry, || async {
            self.gateway.get_ancestors(id).await.map_err(SyncError::from)
        })
        .await?;
        Ok(ancestors.into_iter().map(|a| a.id).collect())
    }

    fn tracked_in_scope(&self, record: &ItemRecord) -> bool {
        match &self.scope {
            Scope::Item(id) => &record.id == id,
            Scope::Subtree(root) => &record.id == root || record.ancestors.contains(root),
            Scope::Collection(key) => &record.collection == key,
        }
    }

    /// Decide what one inventory item needs. Local state is read at the
    /// record's current path, before any move.
    fn route(
        &self,
        ctx: &RunContext,
        item: &RemoteSummary,
        record: Option<&ItemRecord>,
    ) -> Result<Route, SyncError> {
        let Some(record) = record else {
            return Ok(if ctx.direction.pulls() {
                Route::Pull
            } else {
                Route::Skip
            });
        };

        // Only an explicit recheck brings these back.
        if record.is_inaccessible() {
            debug!(id = %record.id, "remote-inaccessible, skipped until rechecked");
            return Ok(Route::Skip);
        }

        let local = self.local.read_text(&record.path)?;

        if record.state == SyncState::Conflict {
            let resolved_by_user = local.as_deref().is_some_and(|t| !contains_markers(t));
            return Ok(if resolved_by_user && ctx.direction.pushes() {
                debug!(id = %record.id, "conflict markers removed, pushing resolution");
                Route::Push
            } else {
                Route::Skip
            });
        }

        let Some(local) = local else {
            // Local deletions are not propagated; a pull restores the file.
            return Ok(if ctx.direction.pulls() {
                Route::Pull
            } else {
                Route::Skip
            });
        };

        let local_hash = self.codec.hash(&local);
        let local_changed = record.base_hash.as_deref() != Some(local_hash.as_str());
        let version_changed = ChangeDetector::remote_changed_hint(record, item.version);
        let remote_changed = version_changed
            || (ctx.options.force && !ctx.resume.should_skip(&record.id, Some(record), item.version));
        // A failed item is attempted again in whichever direction its
        // changes point; with no visible change it is refetched.
        let retry = ctx.resume.must_retry(&record.id);

        let route = match ctx.direction {
            Direction::Pull if remote_changed || retry => Route::Pull,
            Direction::Pull => Route::Skip,
            Direction::Push if local_changed && version_changed => Route::Conflict,
            Direction::Push if local_changed => Route::Push,
            Direction::Push => Route::Skip,
            Direction::Sync => match (local_changed, remote_changed) {
                (true, true) => Route::Conflict,
                (false, true) => Route::Pull,
                (true, false) => Route::Push,
                (false, false) if retry => Route::Pull,
                (false, false) => Route::Skip,
            },
        };
        Ok(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_consistent_chain() {
        assert_eq!(consistent_chain(ids(&["1", "2"]), Some("2")), ids(&["1", "2"]));
        assert_eq!(consistent_chain(ids(&["1", "2", "3"]), Some("2")), ids(&["1", "2"]));
        assert_eq!(consistent_chain(ids(&["1"]), Some("5")), ids(&["1", "5"]));
        assert!(consistent_chain(ids(&["1", "2"]), None).is_empty());
    }

    #[test]
    fn test_plan_is_empty() {
        let mut plan = Plan::default();
        assert!(plan.is_empty());
        plan.skips.push("1".into());
        assert!(plan.is_empty());
        plan.creates.push("new.md".into());
        assert!(!plan.is_empty());
    }
}

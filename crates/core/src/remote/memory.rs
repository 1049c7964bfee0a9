//! In-process [`RemoteApi`] with failure injection and call counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    AncestorRef, InventoryPage, ItemDraft, RateLimitHints, RemoteApi, RemoteAttachment, RemoteItem,
    RemoteResponse, RemoteResult, Scope,
};
use crate::errors::RemoteError;
use crate::models::ContentStatus;

/// A failure to inject on `get_item` / `update_item` for one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NotFound,
    Forbidden,
    RateLimited,
    Transient,
}

impl Fault {
    fn to_error(self, id: &str) -> RemoteError {
        match self {
            Self::NotFound => RemoteError::NotFound { id: id.to_string() },
            Self::Forbidden => RemoteError::Forbidden { id: id.to_string() },
            Self::RateLimited => RemoteError::RateLimited {
                retry_after: Some(Duration::from_millis(10)),
            },
            Self::Transient => RemoteError::TransientServer {
                status: 503,
                detail: "injected".into(),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct FaultPlan {
    fault: Fault,
    /// Remaining triggers; `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    items: BTreeMap<String, RemoteItem>,
    attachments: BTreeMap<String, (RemoteAttachment, Vec<u8>)>,
    faults: HashMap<String, FaultPlan>,
    /// Ids left out of inventory listings but still fetchable (or not).
    hidden: std::collections::HashSet<String>,
    hints: RateLimitHints,
    update_counts: HashMap<String, usize>,
    next_id: u64,
}

/// In-memory remote store.
pub struct MemoryRemote {
    collection: String,
    state: Mutex<State>,
    page_size: usize,
    latency: Option<Duration>,
    get_calls: AtomicUsize,
    update_calls: AtomicUsize,
    create_calls: AtomicUsize,
    list_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryRemote {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            state: Mutex::new(State {
                next_id: 10_000,
                ..State::default()
            }),
            page_size: 50,
            latency: None,
            get_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sleep this long inside every item call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // -- fixture helpers ----------------------------------------------------

    /// Insert or replace an item at version 1.
    pub fn put_item(&self, id: &str, title: &str, parent_id: Option<&str>, body: &str) {
        let now = Utc::now();
        let item = RemoteItem {
            id: id.to_string(),
            title: title.to_string(),
            parent_id: parent_id.map(str::to_string),
            collection: self.collection.clone(),
            version: 1,
            body: body.to_string(),
            status: ContentStatus::Current,
            restricted: false,
            created_by: Some("author".into()),
            created_at: Some(now),
            modified_by: Some("author".into()),
            modified_at: Some(now),
            labels: Vec::new(),
            contributors: Vec::new(),
        };
        self.state().items.insert(id.to_string(), item);
    }

    /// Change an item's body as another user would, bumping its version.
    pub fn edit_body(&self, id: &str, body: &str) {
        let mut state = self.state();
        if let Some(item) = state.items.get_mut(id) {
            item.body = body.to_string();
            item.version += 1;
            item.modified_at = Some(Utc::now());
            item.modified_by = Some("someone-else".into());
        }
    }

    /// Re-parent an item, bumping its version.
    pub fn move_item(&self, id: &str, new_parent: Option<&str>) {
        let mut state = self.state();
        if let Some(item) = state.items.get_mut(id) {
            item.parent_id = new_parent.map(str::to_string);
            item.version += 1;
        }
    }

    pub fn rename_item(&self, id: &str, title: &str) {
        let mut state = self.state();
        if let Some(item) = state.items.get_mut(id) {
            item.title = title.to_string();
            item.version += 1;
        }
    }

    pub fn set_labels(&self, id: &str, labels: &[&str]) {
        if let Some(item) = self.state().items.get_mut(id) {
            item.labels = labels.iter().map(|s| s.to_string()).collect();
        }
    }

    pub fn remove_item(&self, id: &str) {
        self.state().items.remove(id);
    }

    /// Keep the item fetchable but leave it out of inventory listings.
    pub fn hide_from_listing(&self, id: &str) {
        self.state().hidden.insert(id.to_string());
    }

    /// Undo [`MemoryRemote::hide_from_listing`].
    pub fn show_in_listing(&self, id: &str) {
        self.state().hidden.remove(id);
    }

    pub fn add_attachment(&self, item_id: &str, att_id: &str, file_name: &str, bytes: &[u8]) {
        let att = RemoteAttachment {
            id: att_id.to_string(),
            item_id: item_id.to_string(),
            file_name: file_name.to_string(),
            media_type: "application/octet-stream".into(),
            size: bytes.len() as i64,
            version: 1,
            download_url: None,
        };
        self.state()
            .attachments
            .insert(att_id.to_string(), (att, bytes.to_vec()));
    }

    /// Fail calls for `id`. `times = None` fails until cleared.
    pub fn inject(&self, id: &str, fault: Fault, times: Option<u32>) {
        if times == Some(0) {
            return;
        }
        self.state().faults.insert(
            id.to_string(),
            FaultPlan {
                fault,
                remaining: times,
            },
        );
    }

    pub fn clear_fault(&self, id: &str) {
        self.state().faults.remove(id);
    }

    pub fn set_hints(&self, hints: RateLimitHints) {
        self.state().hints = hints;
    }

    pub fn item(&self, id: &str) -> Option<RemoteItem> {
        self.state().items.get(id).cloned()
    }

    pub fn item_count(&self) -> usize {
        self.state().items.len()
    }

    // -- counters -----------------------------------------------------------

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Successful updates applied to one id.
    pub fn updates_for(&self, id: &str) -> usize {
        self.state().update_counts.get(id).copied().unwrap_or(0)
    }

    /// Highest number of item calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    // -- internals ----------------------------------------------------------

    fn take_fault(&self, id: &str) -> Option<Fault> {
        let mut state = self.state();
        let plan = state.faults.get_mut(id)?;
        let fault = plan.fault;
        let spent = match plan.remaining.as_mut() {
            None => false,
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
        };
        if spent {
            state.faults.remove(id);
        }
        Some(fault)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        InFlight(&self.in_flight)
    }

    fn respond<T>(&self, data: T) -> RemoteResult<T> {
        Ok(RemoteResponse {
            data,
            hints: self.state().hints.clone(),
        })
    }

    fn in_scope(state: &State, scope: &Scope, item: &RemoteItem) -> bool {
        match scope {
            Scope::Item(id) => &item.id == id,
            Scope::Collection(key) => &item.collection == key,
            Scope::Subtree(root) => {
                let mut current = Some(item.id.clone());
                let mut steps = 0;
                while let Some(id) = current {
                    if &id == root {
                        return true;
                    }
                    steps += 1;
                    if steps > state.items.len() {
                        return false;
                    }
                    current = state.items.get(&id).and_then(|i| i.parent_id.clone());
                }
                false
            }
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn list_scope(&self, scope: &Scope, cursor: Option<&str>) -> RemoteResult<InventoryPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let offset: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| RemoteError::Parse(format!("bad cursor '{c}'")))?,
            None => 0,
        };
        let page = {
            let state = self.state();
            let all: Vec<_> = state
                .items
                .values()
                .filter(|item| !state.hidden.contains(&item.id))
                .filter(|item| Self::in_scope(&state, scope, item))
                .map(RemoteItem::summary)
                .collect();
            let end = (offset + self.page_size).min(all.len());
            InventoryPage {
                items: all.get(offset..end).map(<[_]>::to_vec).unwrap_or_default(),
                next_cursor: (end < all.len()).then(|| end.to_string()),
            }
        };
        self.respond(page)
    }

    async fn get_item(&self, id: &str) -> RemoteResult<RemoteItem> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        if let Some(fault) = self.take_fault(id) {
            return Err(fault.to_error(id));
        }
        let item = self
            .state()
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound { id: id.to_string() })?;
        self.respond(item)
    }

    async fn get_ancestors(&self, id: &str) -> RemoteResult<Vec<AncestorRef>> {
        let chain = {
            let state = self.state();
            let mut chain = Vec::new();
            let mut current = state
                .items
                .get(id)
                .ok_or_else(|| RemoteError::NotFound { id: id.to_string() })?
                .parent_id
                .clone();
            while let Some(pid) = current {
                if chain.len() > state.items.len() || pid == id {
                    break;
                }
                let parent = state.items.get(&pid);
                chain.push(AncestorRef {
                    id: pid.clone(),
                    title: parent.map(|p| p.title.clone()),
                });
                current = parent.and_then(|p| p.parent_id.clone());
            }
            chain.reverse();
            chain
        };
        self.respond(chain)
    }

    async fn create_item(&self, draft: &ItemDraft) -> RemoteResult<RemoteItem> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        let item = {
            let mut state = self.state();
            state.next_id += 1;
            let now = Utc::now();
            let item = RemoteItem {
                id: state.next_id.to_string(),
                title: draft.title.clone(),
                parent_id: draft.parent_id.clone(),
                collection: if draft.collection.is_empty() {
                    self.collection.clone()
                } else {
                    draft.collection.clone()
                },
                version: 1,
                body: draft.body.clone(),
                status: ContentStatus::Current,
                restricted: false,
                created_by: Some("me".into()),
                created_at: Some(now),
                modified_by: Some("me".into()),
                modified_at: Some(now),
                labels: Vec::new(),
                contributors: Vec::new(),
            };
            state.items.insert(item.id.clone(), item.clone());
            item
        };
        self.respond(item)
    }

    async fn update_item(&self, id: &str, draft: &ItemDraft) -> RemoteResult<RemoteItem> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        if let Some(fault) = self.take_fault(id) {
            return Err(fault.to_error(id));
        }
        let item = {
            let mut state = self.state();
            let item = state
                .items
                .get_mut(id)
                .ok_or_else(|| RemoteError::NotFound { id: id.to_string() })?;
            if let Some(expected) = draft.base_version {
                if expected != item.version {
                    return Err(RemoteError::VersionConflict {
                        id: id.to_string(),
                        expected,
                    });
                }
            }
            item.title = draft.title.clone();
            item.body = draft.body.clone();
            item.version += 1;
            item.modified_at = Some(Utc::now());
            item.modified_by = Some("me".into());
            let item = item.clone();
            *state.update_counts.entry(id.to_string()).or_insert(0) += 1;
            item
        };
        self.respond(item)
    }

    async fn delete_item(&self, id: &str) -> RemoteResult<()> {
        let removed = self.state().items.remove(id);
        match removed {
            Some(_) => self.respond(()),
            None => Err(RemoteError::NotFound { id: id.to_string() }),
        }
    }

    async fn list_attachments(&self, id: &str) -> RemoteResult<Vec<RemoteAttachment>> {
        let _guard = self.enter().await;
        let list = self
            .state()
            .attachments
            .values()
            .filter(|(att, _)| att.item_id == id)
            .map(|(att, _)| att.clone())
            .collect();
        self.respond(list)
    }

    async fn download_attachment(&self, attachment: &RemoteAttachment) -> RemoteResult<Vec<u8>> {
        let _guard = self.enter().await;
        if let Some(fault) = self.take_fault(&attachment.id) {
            return Err(fault.to_error(&attachment.id));
        }
        let bytes = self
            .state()
            .attachments
            .get(&attachment.id)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| RemoteError::NotFound {
                id: attachment.id.clone(),
            })?;
        self.respond(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> MemoryRemote {
        let remote = MemoryRemote::new("ENG").with_page_size(2);
        remote.put_item("1", "Root", None, "root\n");
        remote.put_item("2", "Child", Some("1"), "child\n");
        remote.put_item("3", "Leaf", Some("2"), "leaf\n");
        remote.put_item("4", "Elsewhere", None, "x\n");
        remote
    }

    async fn list_all(remote: &MemoryRemote, scope: &Scope) -> Vec<String> {
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = remote.list_scope(scope, cursor.as_deref()).await.unwrap().data;
            ids.extend(page.items.into_iter().map(|s| s.id));
            match page.next_cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        ids
    }

    #[tokio::test]
    async fn test_listing_paginates_and_scopes() {
        let remote = tree();
        assert_eq!(
            list_all(&remote, &Scope::Subtree("1".into())).await,
            vec!["1", "2", "3"]
        );
        assert_eq!(list_all(&remote, &Scope::Item("2".into())).await, vec!["2"]);
        assert_eq!(
            list_all(&remote, &Scope::Collection("ENG".into())).await.len(),
            4
        );
        assert!(remote.list_calls() >= 3);
    }

    #[tokio::test]
    async fn test_ancestors_root_first() {
        let remote = tree();
        let chain = remote.get_ancestors("3").await.unwrap().data;
        let ids: Vec<_> = chain.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_injected_faults_expire() {
        let remote = tree();
        remote.inject("2", Fault::Transient, Some(1));
        assert!(matches!(
            remote.get_item("2").await,
            Err(RemoteError::TransientServer { .. })
        ));
        assert!(remote.get_item("2").await.is_ok());
        assert_eq!(remote.get_calls(), 2);
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let remote = tree();
        let draft = ItemDraft {
            title: "Root".into(),
            parent_id: None,
            collection: "ENG".into(),
            body: "new\n".into(),
            base_version: Some(7),
        };
        assert!(matches!(
            remote.update_item("1", &draft).await,
            Err(RemoteError::VersionConflict { .. })
        ));
        let ok = ItemDraft {
            base_version: Some(1),
            ..draft
        };
        let updated = remote.update_item("1", &ok).await.unwrap().data;
        assert_eq!(updated.version, 2);
        assert_eq!(remote.updates_for("1"), 1);
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let remote = tree();
        let created = remote
            .create_item(&ItemDraft {
                title: "New".into(),
                parent_id: Some("1".into()),
                collection: String::new(),
                body: "b\n".into(),
                base_version: None,
            })
            .await
            .unwrap()
            .data;
        assert_eq!(created.collection, "ENG");
        assert_eq!(remote.item_count(), 5);
        remote.delete_item(&created.id).await.unwrap();
        assert!(remote.delete_item(&created.id).await.is_err());
    }

    #[tokio::test]
    async fn test_attachments() {
        let remote = tree();
        remote.add_attachment("1", "a1", "diagram.png", b"\x89PNG");
        let list = remote.list_attachments("1").await.unwrap().data;
        assert_eq!(list.len(), 1);
        let bytes = remote.download_attachment(&list[0]).await.unwrap().data;
        assert_eq!(bytes, b"\x89PNG");
    }
}

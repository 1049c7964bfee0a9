//! Remote content store interface.
//!
//! [`RemoteApi`] is the seam between the engine and whatever hosts the
//! pages. [`HttpRemote`] talks to a Confluence-style REST API;
//! [`MemoryRemote`] is an in-process store used by tests.

pub mod http;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::Throttle;
use crate::errors::RemoteError;
use crate::models::{ContentStatus, Contributor};

pub use http::HttpRemote;
pub use memory::MemoryRemote;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The part of the remote store a tree mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// A single item.
    Item(String),
    /// An item and all of its descendants.
    Subtree(String),
    /// Every item in a collection.
    Collection(String),
}

impl Scope {
    /// Stable key identifying this scope in checkpoints.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Item(id) => format!("item:{id}"),
            Self::Subtree(id) => format!("subtree:{id}"),
            Self::Collection(key) => format!("collection:{key}"),
        }
    }

    /// The item at the top of the scope, if the scope is item-rooted.
    pub fn root_id(&self) -> Option<&str> {
        match self {
            Self::Item(id) | Self::Subtree(id) => Some(id),
            Self::Collection(_) => None,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Rate-limit information attached to every response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHints {
    /// Requests left in the current window, if the server says.
    pub remaining: Option<u32>,
    /// Server signalled that the quota is nearly exhausted.
    pub near_limit: bool,
    /// Server asked us to wait this long before the next request.
    pub retry_after: Option<Duration>,
}

/// A payload plus the rate-limit hints that came with it.
#[derive(Debug, Clone)]
pub struct RemoteResponse<T> {
    pub data: T,
    pub hints: RateLimitHints,
}

impl<T> RemoteResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            hints: RateLimitHints::default(),
        }
    }
}

pub type RemoteResult<T> = Result<RemoteResponse<T>, RemoteError>;

/// One entry of a scope inventory listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSummary {
    pub id: String,
    pub title: String,
    pub parent_id: Option<String>,
    pub collection: String,
    pub version: i64,
    pub modified_at: Option<DateTime<Utc>>,
    pub status: ContentStatus,
}

/// A page of inventory; `next_cursor` is `None` on the last page.
#[derive(Debug, Clone, Default)]
pub struct InventoryPage {
    pub items: Vec<RemoteSummary>,
    pub next_cursor: Option<String>,
}

/// A fully fetched item.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteItem {
    pub id: String,
    pub title: String,
    pub parent_id: Option<String>,
    pub collection: String,
    pub version: i64,
    /// Remote markup.
    pub body: String,
    pub status: ContentStatus,
    pub restricted: bool,
    pub created_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_by: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    pub labels: Vec<String>,
    pub contributors: Vec<Contributor>,
}

impl RemoteItem {
    pub fn summary(&self) -> RemoteSummary {
        RemoteSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            parent_id: self.parent_id.clone(),
            collection: self.collection.clone(),
            version: self.version,
            modified_at: self.modified_at,
            status: self.status,
        }
    }
}

/// An ancestor as reported by the remote, root first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncestorRef {
    pub id: String,
    pub title: Option<String>,
}

/// Binary attachment metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAttachment {
    pub id: String,
    pub item_id: String,
    pub file_name: String,
    pub media_type: String,
    pub size: i64,
    pub version: i64,
    pub download_url: Option<String>,
}

/// Content to create or update an item with.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDraft {
    pub title: String,
    pub parent_id: Option<String>,
    pub collection: String,
    /// Remote markup.
    pub body: String,
    /// For updates: the version our change is based on. A mismatch is a
    /// [`RemoteError::VersionConflict`].
    pub base_version: Option<i64>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Operations the engine needs from the remote content store.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// One page of the scope inventory.
    async fn list_scope(&self, scope: &Scope, cursor: Option<&str>) -> RemoteResult<InventoryPage>;

    async fn get_item(&self, id: &str) -> RemoteResult<RemoteItem>;

    /// Ancestors of `id`, root first, not including `id`.
    async fn get_ancestors(&self, id: &str) -> RemoteResult<Vec<AncestorRef>>;

    async fn create_item(&self, draft: &ItemDraft) -> RemoteResult<RemoteItem>;

    async fn update_item(&self, id: &str, draft: &ItemDraft) -> RemoteResult<RemoteItem>;

    async fn delete_item(&self, id: &str) -> RemoteResult<()>;

    async fn list_attachments(&self, id: &str) -> RemoteResult<Vec<RemoteAttachment>>;

    async fn download_attachment(&self, attachment: &RemoteAttachment) -> RemoteResult<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// A [`RemoteApi`] handle that feeds every response's rate-limit hints into
/// a shared [`Throttle`] and hands back plain payloads.
#[derive(Clone)]
pub struct Gateway {
    api: Arc<dyn RemoteApi>,
    throttle: Arc<Throttle>,
}

impl Gateway {
    pub fn new(api: Arc<dyn RemoteApi>, throttle: Arc<Throttle>) -> Self {
        Self { api, throttle }
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    fn settle<T>(&self, result: RemoteResult<T>) -> Result<T, RemoteError> {
        match result {
            Ok(resp) => {
                self.throttle.observe(&resp.hints);
                Ok(resp.data)
            }
            Err(RemoteError::RateLimited { retry_after }) => {
                self.throttle.observe(&RateLimitHints {
                    remaining: Some(0),
                    near_limit: true,
                    retry_after,
                });
                Err(RemoteError::RateLimited { retry_after })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_scope(
        &self,
        scope: &Scope,
        cursor: Option<&str>,
    ) -> Result<InventoryPage, RemoteError> {
        self.throttle.wait().await;
        self.settle(self.api.list_scope(scope, cursor).await)
    }

    pub async fn get_item(&self, id: &str) -> Result<RemoteItem, RemoteError> {
        self.throttle.wait().await;
        self.settle(self.api.get_item(id).await)
    }

    pub async fn get_ancestors(&self, id: &str) -> Result<Vec<AncestorRef>, RemoteError> {
        self.throttle.wait().await;
        self.settle(self.api.get_ancestors(id).await)
    }

    pub async fn create_item(&self, draft: &ItemDraft) -> Result<RemoteItem, RemoteError> {
        self.throttle.wait().await;
        self.settle(self.api.create_item(draft).await)
    }

    pub async fn update_item(&self, id: &str, draft: &ItemDraft) -> Result<RemoteItem, RemoteError> {
        self.throttle.wait().await;
        self.settle(self.api.update_item(id, draft).await)
    }

    pub async fn list_attachments(&self, id: &str) -> Result<Vec<RemoteAttachment>, RemoteError> {
        self.throttle.wait().await;
        self.settle(self.api.list_attachments(id).await)
    }

    pub async fn download_attachment(
        &self,
        attachment: &RemoteAttachment,
    ) -> Result<Vec<u8>, RemoteError> {
        self.throttle.wait().await;
        self.settle(self.api.download_attachment(attachment).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_fingerprint() {
        assert_eq!(Scope::Item("1".into()).fingerprint(), "item:1");
        assert_eq!(Scope::Subtree("9".into()).fingerprint(), "subtree:9");
        assert_eq!(Scope::Collection("ENG".into()).fingerprint(), "collection:ENG");
        assert_eq!(Scope::Collection("ENG".into()).root_id(), None);
        assert_eq!(Scope::Subtree("9".into()).root_id(), Some("9"));
    }

    #[tokio::test]
    async fn test_gateway_records_rate_limit_hints() {
        let remote = Arc::new(MemoryRemote::new("ENG"));
        remote.put_item("1", "Root", None, "hello\n");
        remote.set_hints(RateLimitHints {
            remaining: Some(3),
            near_limit: true,
            retry_after: Some(Duration::from_secs(60)),
        });
        let throttle = Arc::new(Throttle::new());
        let gateway = Gateway::new(remote, throttle.clone());

        let item = gateway.get_item("1").await.unwrap();
        assert_eq!(item.title, "Root");
        assert!(throttle.is_paused());
    }
}

//! Domain model types used throughout pagesync.
//!
//! These types bridge the sync engine, the state store, and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Sync State
// ---------------------------------------------------------------------------

/// Per-item sync state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    Synced,
    LocalModified,
    RemoteModified,
    Conflict,
    Untracked,
    RemoteInaccessible,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::LocalModified => "local-modified",
            Self::RemoteModified => "remote-modified",
            Self::Conflict => "conflict",
            Self::Untracked => "untracked",
            Self::RemoteInaccessible => "remote-inaccessible",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "local-modified" => Ok(Self::LocalModified),
            "remote-modified" => Ok(Self::RemoteModified),
            "conflict" => Ok(Self::Conflict),
            "untracked" => Ok(Self::Untracked),
            "remote-inaccessible" => Ok(Self::RemoteInaccessible),
            other => Err(format!("unknown sync state '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Content status / inaccessibility
// ---------------------------------------------------------------------------

/// Lifecycle status of the remote item.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    #[default]
    Current,
    Draft,
    Trashed,
    Archived,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Draft => "draft",
            Self::Trashed => "trashed",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ContentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current" => Ok(Self::Current),
            "draft" => Ok(Self::Draft),
            "trashed" => Ok(Self::Trashed),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown content status '{other}'")),
        }
    }
}

/// Why an item can no longer be fetched. The remote does not let us tell a
/// deletion apart from a permission change, so this is only the last symptom.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InaccessibleReason {
    NotFound,
    Forbidden,
    Unknown,
}

impl InaccessibleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::Forbidden => "forbidden",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for InaccessibleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InaccessibleReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not-found" => Ok(Self::NotFound),
            "forbidden" => Ok(Self::Forbidden),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown inaccessible reason '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// One synced content unit and its local mirror.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemRecord {
    pub id: String,
    /// Path relative to the tree root, `/`-separated.
    pub path: String,
    pub title: String,
    pub collection: String,
    pub version: i64,
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub base_hash: Option<String>,
    pub state: SyncState,
    pub parent_id: Option<String>,
    /// Ancestor ids, root first. Does not include the item itself.
    pub ancestors: Vec<String>,
    pub created_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_by: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    pub status: ContentStatus,
    pub restricted: bool,
    pub inaccessible: Option<InaccessibleReason>,
    pub inaccessible_since: Option<DateTime<Utc>>,
    pub miss_count: u32,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl ItemRecord {
    /// A fresh, untracked record with every optional field empty.
    pub fn new(id: impl Into<String>, path: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            title: title.into(),
            collection: String::new(),
            version: 0,
            local_hash: None,
            remote_hash: None,
            base_hash: None,
            state: SyncState::Untracked,
            parent_id: None,
            ancestors: Vec::new(),
            created_by: None,
            created_at: None,
            modified_by: None,
            modified_at: None,
            status: ContentStatus::Current,
            restricted: false,
            inaccessible: None,
            inaccessible_since: None,
            miss_count: 0,
            last_synced_at: None,
        }
    }

    pub fn is_inaccessible(&self) -> bool {
        self.state == SyncState::RemoteInaccessible
    }
}

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// A binary sub-resource of an item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentRecord {
    pub id: String,
    pub item_id: String,
    pub file_name: String,
    pub media_type: String,
    pub size: i64,
    pub path: String,
    pub version: i64,
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub base_hash: Option<String>,
    pub state: SyncState,
}

// ---------------------------------------------------------------------------
// Graph records
// ---------------------------------------------------------------------------

/// Where a link points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "target", rename_all = "lowercase")]
pub enum LinkTarget {
    Item(String),
    External(String),
    Broken(String),
}

impl LinkTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Item(_) => "item",
            Self::External(_) => "external",
            Self::Broken(_) => "broken",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Item(v) | Self::External(v) | Self::Broken(v) => v,
        }
    }

    pub fn from_parts(kind: &str, value: String) -> Result<Self, String> {
        match kind {
            "item" => Ok(Self::Item(value)),
            "external" => Ok(Self::External(value)),
            "broken" => Ok(Self::Broken(value)),
            other => Err(format!("unknown link kind '{other}'")),
        }
    }
}

/// Directed edge extracted from an item's markup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkRecord {
    pub source_id: String,
    pub target: LinkTarget,
}

/// Per-item author aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contributor {
    pub account_id: String,
    pub display_name: String,
    pub edit_count: i64,
    pub last_edit_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Conflict
// ---------------------------------------------------------------------------

/// The unresolved three-way triple for an item in `conflict` state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictRecord {
    pub item_id: String,
    pub base: String,
    pub local: String,
    pub remote: String,
    /// Remote version the merge was computed against.
    pub remote_version: i64,
    pub regions: usize,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Minimal progress marker for a resumable run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub fingerprint: String,
    pub processed: u64,
    pub failed_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub total: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Item filter
// ---------------------------------------------------------------------------

/// Query filter for [`list_items`](crate::db::Database::list_items).
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub collection: Option<String>,
    pub state: Option<SyncState>,
    /// Items at or below this path (a file path or directory prefix).
    pub path_prefix: Option<String>,
    /// Items that have this id anywhere in their ancestor chain.
    pub ancestor: Option<String>,
    pub modified_after: Option<DateTime<Utc>>,
    pub modified_before: Option<DateTime<Utc>>,
    /// `Some(true)` for only inaccessible items, `Some(false)` to exclude them.
    pub inaccessible: Option<bool>,
    pub limit: Option<u32>,
}

impl ItemFilter {
    pub fn state(state: SyncState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

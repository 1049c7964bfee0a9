//! Error types for the pagesync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and
//! [`SyncError`] unifies them for the orchestrator and the batch executor,
//! which needs to know whether a failure is skippable, retryable, or fatal.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for a sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Local filesystem failure on a specific path.
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another run already holds this engine.
    #[error("sync already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// The scope inventory could not be fetched, so no plan can be built.
    #[error("failed to fetch remote inventory: {0}")]
    Inventory(String),
}

/// How the batch executor treats a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Remote says the item does not exist (or is hidden from us).
    NotFound,
    /// Worth another attempt after backoff.
    Retryable,
    /// The store is unusable; the run must stop.
    Fatal,
    /// Reported and left alone.
    Terminal,
}

impl SyncError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify this error for the batch executor.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Remote(e) => e.kind(),
            Self::Database(DatabaseError::Corruption(_)) => FailureKind::Fatal,
            _ => FailureKind::Terminal,
        }
    }

    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        self.kind() == FailureKind::Fatal
    }

    /// Server-supplied delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Remote(RemoteError::RateLimited { retry_after }) => *retry_after,
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Remote API errors
// ---------------------------------------------------------------------------

/// Errors from the remote content store.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The item is missing. The remote cannot tell us whether it was deleted
    /// or whether we lost permission to see it.
    #[error("remote item not found: {id}")]
    NotFound { id: String },

    /// Access to the item was refused.
    #[error("access to remote item {id} forbidden")]
    Forbidden { id: String },

    /// Quota exhausted; retry after the given delay if the server sent one.
    #[error("remote rate limit exceeded (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// 5xx or a dropped connection.
    #[error("transient remote failure (HTTP {status}): {detail}")]
    TransientServer { status: u16, detail: String },

    /// The remote version moved on between our read and our write.
    #[error("version conflict on {id}: expected version {expected}")]
    VersionConflict { id: String, expected: i64 },

    /// HTTP-level transport error (network, TLS, etc.).
    #[error("remote HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API returned an unexpected non-success status code.
    #[error("remote API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    /// JSON deserialization failure.
    #[error("remote response parse error: {0}")]
    Parse(String),
}

impl RemoteError {
    /// Classify for the batch executor.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NotFound { .. } => FailureKind::NotFound,
            Self::RateLimited { .. } | Self::TransientServer { .. } => FailureKind::Retryable,
            Self::Http(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                FailureKind::Retryable
            }
            _ => FailureKind::Terminal,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Local content that the codec refuses to encode.
#[derive(Debug, Error)]
#[error("cannot encode '{path}': {detail}")]
pub struct ValidationError {
    pub path: String,
    pub detail: String,
}

impl ValidationError {
    /// Attach the local path the rejected content came from.
    pub fn at(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from the merge / resolution subsystem.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The merge left conflicts and the policy forbids writing markers.
    #[error("unresolved conflict on '{path}' ({regions} region(s))")]
    Unresolved { path: String, regions: usize },

    /// No open conflict is recorded for the item.
    #[error("no open conflict for item {0}")]
    NotFound(String),

    /// The requested resolution cannot be applied.
    #[error("invalid resolution for item {id}: {detail}")]
    InvalidResolution { id: String, detail: String },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite state store.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(rusqlite::Error),

    /// The store is damaged or holds records that fail validation.
    #[error("state store corrupted: {0}")]
    Corruption(String),

    /// Another item already owns this local path.
    #[error("path '{path}' is already tracked by item {existing_id}")]
    PathConflict { path: String, existing_id: String },

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Snapshot export/import failure.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                Self::Corruption(err.to_string())
            }
            _ => Self::SqliteError(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Hierarchy errors
// ---------------------------------------------------------------------------

/// Errors from ancestor-chain resolution and file relocation.
#[derive(Debug, Error)]
pub enum HierarchyError {
    /// The ancestor chain loops back on itself.
    #[error("ancestor cycle for item {id} at {repeated}")]
    Cycle { id: String, repeated: String },

    /// The relocation target is occupied by different content.
    #[error("cannot move '{from}' to '{to}': destination exists")]
    DestinationExists { from: String, to: String },

    /// Content changed while being relocated.
    #[error("content hash changed while moving '{from}' to '{to}'")]
    ContentChanged { from: String, to: String },

    /// Filesystem failure during relocation.
    #[error("relocation I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = RemoteError::NotFound { id: "42".into() };
        assert_eq!(err.to_string(), "remote item not found: 42");

        let err = DatabaseError::PathConflict {
            path: "docs/a.md".into(),
            existing_id: "7".into(),
        };
        assert_eq!(
            err.to_string(),
            "path 'docs/a.md' is already tracked by item 7"
        );

        let err = HierarchyError::Cycle {
            id: "3".into(),
            repeated: "1".into(),
        };
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_failure_kinds() {
        let e: SyncError = RemoteError::NotFound { id: "1".into() }.into();
        assert_eq!(e.kind(), FailureKind::NotFound);

        let e: SyncError = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        }
        .into();
        assert_eq!(e.kind(), FailureKind::Retryable);
        assert_eq!(e.retry_after(), Some(Duration::from_secs(3)));

        let e: SyncError = RemoteError::TransientServer {
            status: 503,
            detail: "busy".into(),
        }
        .into();
        assert_eq!(e.kind(), FailureKind::Retryable);

        let e: SyncError = RemoteError::Forbidden { id: "1".into() }.into();
        assert_eq!(e.kind(), FailureKind::Terminal);

        let e: SyncError = DatabaseError::Corruption("bad page".into()).into();
        assert!(e.is_fatal());

        let e: SyncError = ValidationError {
            path: "a.md".into(),
            detail: "NUL byte".into(),
        }
        .into();
        assert_eq!(e.kind(), FailureKind::Terminal);
    }
}

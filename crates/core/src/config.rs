//! TOML-based configuration for pagesync.
//!
//! The remote API token is never stored in the file: `remote.token_env` names
//! an environment variable that is read at runtime by
//! [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch::RetryPolicy;
use crate::conflict::ConflictPolicy;
use crate::errors::ConfigError;
use crate::remote::Scope;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from `pagesync.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Remote content store connection.
    pub remote: RemoteConfig,

    /// Local tree settings.
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// What part of the remote store to mirror.
    pub scope: ScopeConfig,

    /// Sync behaviour settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Retry/backoff for transient remote failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// Remote API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// API base URL (e.g. `https://wiki.example.com/api/v2`).
    pub base_url: String,

    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Inventory page size.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_token_env() -> String {
    "PAGESYNC_TOKEN".into()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_page_size() -> usize {
    100
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// Local tree settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root of the local document tree.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// State database, relative to `root` unless absolute.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Glob patterns ignored when scanning for new local files.
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_state_file() -> PathBuf {
    PathBuf::from(".pagesync/state.db")
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            state_file: default_state_file(),
            exclude: Vec::new(),
        }
    }
}

impl WorkspaceConfig {
    /// Absolute-or-root-relative path of the state database.
    pub fn state_path(&self) -> PathBuf {
        if self.state_file.is_absolute() {
            self.state_file.clone()
        } else {
            self.root.join(&self.state_file)
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Which kind of scope `scope.id` names.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Item,
    #[default]
    Subtree,
    Collection,
}

/// Scope settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    #[serde(default)]
    pub kind: ScopeKind,
    pub id: String,
}

impl ScopeConfig {
    pub fn to_scope(&self) -> Scope {
        match self.kind {
            ScopeKind::Item => Scope::Item(self.id.clone()),
            ScopeKind::Subtree => Scope::Subtree(self.id.clone()),
            ScopeKind::Collection => Scope::Collection(self.id.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Sync behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum remote operations in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Items per batch (checkpoint granularity).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Download attachments of pulled items.
    #[serde(default = "default_true")]
    pub attachments: bool,

    /// Items whose attachments are fetched in parallel.
    #[serde(default = "default_attachment_items")]
    pub attachment_items: usize,

    /// Attachments per item fetched in parallel.
    #[serde(default = "default_attachments_per_item")]
    pub attachments_per_item: usize,

    /// Treat not-found responses as skips rather than failures.
    #[serde(default = "default_true")]
    pub skip_on_404: bool,

    /// Consecutive misses before an item is marked remote-inaccessible.
    #[serde(default = "default_inaccessible_threshold")]
    pub inaccessible_threshold: u32,

    /// What to do when both sides changed the same lines.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

fn default_concurrency() -> usize {
    8
}
fn default_batch_size() -> usize {
    50
}
fn default_attachment_items() -> usize {
    3
}
fn default_attachments_per_item() -> usize {
    2
}
fn default_inaccessible_threshold() -> u32 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            attachments: true,
            attachment_items: default_attachment_items(),
            attachments_per_item: default_attachments_per_item(),
            skip_on_404: true,
            inaccessible_threshold: default_inaccessible_threshold(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Retry/backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Concurrency used for retry passes.
    #[serde(default = "default_retry_concurrency")]
    pub retry_concurrency: usize,
}

fn default_max_retries() -> u32 {
    1
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_retry_concurrency() -> usize {
    2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retry_concurrency: default_retry_concurrency(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            retry_concurrency: self.retry_concurrency,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum level when `RUST_LOG` is unset: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional daily-rolling log file.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `remote.token_env`. A missing variable only warns; offline
    /// commands (status, export) do not need a token.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        self.remote.token = resolve_optional_env(&self.remote.token_env, "remote.token_env");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.base_url.is_empty() {
            return Err(invalid("remote.base_url", "base URL must not be empty"));
        }
        if !self.remote.base_url.starts_with("http://")
            && !self.remote.base_url.starts_with("https://")
        {
            return Err(invalid("remote.base_url", "base URL must be http(s)"));
        }
        if self.scope.id.is_empty() {
            return Err(invalid("scope.id", "scope id must not be empty"));
        }
        if self.remote.page_size == 0 {
            return Err(invalid("remote.page_size", "page size must be > 0"));
        }
        if self.sync.concurrency == 0 {
            return Err(invalid("sync.concurrency", "concurrency must be > 0"));
        }
        if self.sync.batch_size == 0 {
            return Err(invalid("sync.batch_size", "batch size must be > 0"));
        }
        if self.sync.attachment_items == 0 || self.sync.attachments_per_item == 0 {
            return Err(invalid(
                "sync.attachment_items",
                "attachment pool sizes must be > 0",
            ));
        }
        if self.sync.inaccessible_threshold == 0 {
            return Err(invalid(
                "sync.inaccessible_threshold",
                "threshold must be at least 1",
            ));
        }
        if self.retry.retry_concurrency == 0 {
            return Err(invalid("retry.retry_concurrency", "must be > 0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "retry.base_delay_ms",
                "base delay must not exceed max delay",
            ));
        }
        for pattern in &self.workspace.exclude {
            if pattern.is_empty() {
                return Err(invalid("workspace.exclude", "empty glob pattern"));
            }
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// A config for the given base URL and scope with every other value
    /// defaulted. Used by `pagesync init` and by tests.
    pub fn minimal(base_url: &str, scope: ScopeConfig, root: PathBuf) -> Self {
        Self {
            remote: RemoteConfig {
                base_url: base_url.to_string(),
                token_env: default_token_env(),
                timeout_secs: default_timeout_secs(),
                page_size: default_page_size(),
                token: None,
            },
            workspace: WorkspaceConfig {
                root,
                ..WorkspaceConfig::default()
            },
            scope,
            sync: SyncConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Serialize back to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[remote]
base_url = "https://wiki.example.com/api/v2"
token_env = "WIKI_TOKEN"
timeout_secs = 10
page_size = 25

[workspace]
root = "/tmp/docs"
exclude = ["drafts/**", "*.tmp.md"]

[scope]
kind = "collection"
id = "ENG"

[sync]
concurrency = 4
batch_size = 20
attachments = false
conflict_policy = "prefer-remote"

[retry]
max_retries = 3
base_delay_ms = 100
max_delay_ms = 2000

[logging]
level = "debug"
file = "/tmp/pagesync.log"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.remote.page_size, 25);
        assert_eq!(config.scope.kind, ScopeKind::Collection);
        assert_eq!(config.scope.to_scope(), Scope::Collection("ENG".into()));
        assert_eq!(config.sync.concurrency, 4);
        assert!(!config.sync.attachments);
        assert_eq!(config.sync.conflict_policy, ConflictPolicy::PreferRemote);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.workspace.exclude.len(), 2);
        assert_eq!(
            config.workspace.state_path(),
            PathBuf::from("/tmp/docs/.pagesync/state.db")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pagesync.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/pagesync.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.remote.base_url = "ftp://nope".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "remote.base_url"
        ));

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.sync.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "sync.concurrency"
        ));

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.retry.base_delay_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("PAGESYNC_TEST_TOKEN_A", "tok-123");
        let mut config = AppConfig::minimal(
            "https://wiki.example.com",
            ScopeConfig {
                kind: ScopeKind::Item,
                id: "1".into(),
            },
            PathBuf::from("."),
        );
        config.remote.token_env = "PAGESYNC_TEST_TOKEN_A".into();
        config.resolve_env_vars().unwrap();
        assert_eq!(config.remote.token.as_deref(), Some("tok-123"));
        std::env::remove_var("PAGESYNC_TEST_TOKEN_A");

        config.remote.token_env = "PAGESYNC_TEST_TOKEN_UNSET".into();
        config.resolve_env_vars().unwrap();
        assert!(config.remote.token.is_none());
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[remote]
base_url = "https://wiki.example.com"
[scope]
id = "123"
"#;
        let config: AppConfig = toml::from_str(minimal).unwrap();
        config.validate().unwrap();
        assert_eq!(config.remote.token_env, "PAGESYNC_TOKEN");
        assert_eq!(config.scope.kind, ScopeKind::Subtree);
        assert_eq!(config.sync.concurrency, 8);
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.attachment_items, 3);
        assert_eq!(config.sync.attachments_per_item, 2);
        assert_eq!(config.sync.inaccessible_threshold, 2);
        assert_eq!(config.sync.conflict_policy, ConflictPolicy::KeepMarkers);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.logging.level, "info");

        let policy = config.retry.policy();
        assert_eq!(policy.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_roundtrip_minimal_to_toml() {
        let config = AppConfig::minimal(
            "https://wiki.example.com",
            ScopeConfig {
                kind: ScopeKind::Subtree,
                id: "9".into(),
            },
            PathBuf::from("docs"),
        );
        let text = config.to_toml().unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.scope.id, "9");
        assert_eq!(parsed.workspace.root, PathBuf::from("docs"));
    }
}

//! pagesync core library.
//!
//! This crate provides the foundational components for mirroring a remote
//! page store into a local document tree: configuration, the SQLite state
//! store, change detection and three-way merging, the batch executor, the
//! hierarchy mapper, resumable checkpoints, remote clients, and the sync
//! engine that sequences them.

pub mod batch;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod hierarchy;
pub mod local;
pub mod models;
pub mod remote;
pub mod sync_engine;

// Re-exports for convenience.
pub use batch::CancelSignal;
pub use codec::{ContentCodec, PlainTextCodec};
pub use config::AppConfig;
pub use conflict::ConflictPolicy;
pub use db::Database;
pub use errors::SyncError;
pub use remote::{HttpRemote, MemoryRemote, RemoteApi, Scope};
pub use sync_engine::{Direction, ProgressReporter, RunSummary, SyncEngine, SyncOptions};

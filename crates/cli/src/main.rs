//! pagesync command-line tool.
//!
//! Mirrors a remote page store into a local document tree. Every subcommand
//! maps onto one sync engine or state store entry point; this binary adds
//! the tree lock, progress display, and styled output.

mod lock;
mod output;
mod progress;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use pagesync_core::config::{AppConfig, LoggingConfig, ScopeConfig, ScopeKind};
use pagesync_core::{
    CancelSignal, ConflictPolicy, Database, HttpRemote, PlainTextCodec, RunSummary, SyncEngine,
    SyncOptions,
};

use crate::lock::TreeLock;
use crate::progress::BarProgress;

/// Exit status of a run that finished but left failures or conflicts.
const EXIT_INCOMPLETE: u8 = 2;
/// Exit status of a run stopped by Ctrl+C.
const EXIT_INTERRUPTED: u8 = 130;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Mirror a remote page store into a local document tree.
#[derive(Parser, Debug)]
#[command(name = "pagesync", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./pagesync.toml")]
    config: String,

    /// More log output on stderr (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring remote changes into the local tree.
    Pull(RunArgs),

    /// Send local edits and new documents to the remote.
    Push(RunArgs),

    /// Pull and push in one run, merging where both sides changed.
    Sync(RunArgs),

    /// Show tracked items and their states without contacting the remote.
    Status {
        /// List synced items too.
        #[arg(short, long)]
        all: bool,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Re-merge open conflicts under a policy.
    Resolve {
        /// Item ids to resolve. Defaults to every open conflict.
        ids: Vec<String>,

        /// How conflicting regions are settled.
        #[arg(long, value_parser = parse_policy)]
        policy: Option<ConflictPolicy>,

        /// Print the local-to-remote diff of each conflict instead.
        #[arg(long, conflicts_with = "policy")]
        diff: bool,
    },

    /// Try remote-inaccessible items again.
    Recheck,

    /// Forget remote-inaccessible items and delete their local files.
    Cleanup {
        /// Item ids to remove. Defaults to every inaccessible item.
        ids: Vec<String>,

        /// Actually delete; without this only the candidates are listed.
        #[arg(long)]
        yes: bool,
    },

    /// Write the state store as a JSON snapshot.
    Export {
        /// Output file; stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace the state store with a JSON snapshot.
    Import {
        /// Snapshot file written by `pagesync export`.
        file: PathBuf,

        /// Overwrite a store that already tracks items.
        #[arg(long)]
        force: bool,
    },

    /// Write a configuration file and create the state store.
    Init {
        /// Base URL of the remote API.
        #[arg(long)]
        base_url: String,

        /// What the scope id names.
        #[arg(long, value_enum, default_value_t = ScopeArg::Subtree)]
        scope: ScopeArg,

        /// Item id or collection key.
        #[arg(long)]
        id: String,

        /// Root of the local tree.
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Replace an existing configuration file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Only print the plan.
    #[arg(long)]
    dry_run: bool,

    /// Refetch items whose version looks unchanged.
    #[arg(long)]
    force: bool,

    /// Conflict policy for this run (prefer-local, prefer-remote,
    /// keep-markers, fail).
    #[arg(long, value_parser = parse_policy)]
    policy: Option<ConflictPolicy>,

    /// Parallel remote calls.
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn options(&self) -> SyncOptions {
        SyncOptions {
            dry_run: self.dry_run,
            force: self.force,
            policy: self.policy,
            concurrency: self.concurrency,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ScopeArg {
    Item,
    Subtree,
    Collection,
}

impl From<ScopeArg> for ScopeKind {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Item => ScopeKind::Item,
            ScopeArg::Subtree => ScopeKind::Subtree,
            ScopeArg::Collection => ScopeKind::Collection,
        }
    }
}

fn parse_policy(s: &str) -> Result<ConflictPolicy, String> {
    s.parse()
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = PathBuf::from(expand_tilde(&cli.config));

    if let Commands::Init {
        base_url,
        scope,
        id,
        root,
        force,
    } = cli.command
    {
        let _guard = init_logging(&LoggingConfig::default(), cli.verbose, Path::new("."));
        cmd_init(&config_path, &base_url, scope, &id, &root, force)?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(&config_path)?;
    let _guard = init_logging(&config.logging, cli.verbose, &config.workspace.root);

    match cli.command {
        Commands::Pull(args) => cmd_run(&config, pagesync_core::Direction::Pull, &args).await,
        Commands::Push(args) => cmd_run(&config, pagesync_core::Direction::Push, &args).await,
        Commands::Sync(args) => cmd_run(&config, pagesync_core::Direction::Sync, &args).await,
        Commands::Status { all, json } => cmd_status(&config, all, json),
        Commands::Resolve { ids, policy, diff } => cmd_resolve(&config, &ids, policy, diff).await,
        Commands::Recheck => cmd_recheck(&config).await,
        Commands::Cleanup { ids, yes } => cmd_cleanup(&config, &ids, yes),
        Commands::Export { output } => cmd_export(&config, output.as_deref()),
        Commands::Import { file, force } => cmd_import(&config, &file, force),
        Commands::Init { .. } => unreachable!("handled above"),
    }
}

// ---------------------------------------------------------------------------
// Setup helpers
// ---------------------------------------------------------------------------

/// Install the stderr subscriber and, when configured, a daily-rolling log
/// file. The returned guard flushes the file writer on drop.
fn init_logging(logging: &LoggingConfig, verbose: u8, root: &Path) -> Option<WorkerGuard> {
    let stderr_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(stderr_level));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(stderr_filter);

    let (file_layer, guard) = match &logging.file {
        Some(file) => {
            let path = PathBuf::from(expand_tilde(&file.to_string_lossy()));
            let path = if path.is_absolute() {
                path
            } else {
                root.join(path)
            };
            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "pagesync.log".into());
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(&logging.level));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}/{}", home.display(), rest);
        }
    }
    path.to_string()
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config =
        AppConfig::load_from_file(path).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    config.validate().context("invalid configuration")?;
    config.workspace.root = PathBuf::from(expand_tilde(&config.workspace.root.to_string_lossy()));
    Ok(config)
}

fn open_database(config: &AppConfig) -> Result<Database> {
    let db_path = config.workspace.state_path();
    let db = Database::new(&db_path)
        .with_context(|| format!("failed to open state store {}", db_path.display()))?;
    db.initialize().context("failed to initialize state store")?;
    Ok(db)
}

fn build_engine(config: &AppConfig, show_progress: bool) -> Result<SyncEngine> {
    let remote = HttpRemote::new(
        config.remote.base_url.clone(),
        config.remote.token.clone(),
        Duration::from_secs(config.remote.timeout_secs),
        config.remote.page_size,
    )
    .context("failed to build remote client")?;
    let db = open_database(config)?;
    Ok(SyncEngine::new(
        config.clone(),
        db,
        Arc::new(remote),
        Arc::new(PlainTextCodec),
    )
    .with_progress(Arc::new(BarProgress::new(show_progress))))
}

/// Cancel the run at the next batch boundary on Ctrl+C.
fn cancel_on_interrupt(signal: CancelSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{}",
                style::warn("Interrupted, finishing the current batch and saving a checkpoint")
            );
            signal.cancel();
        }
    });
}

fn exit_code(summary: &RunSummary) -> ExitCode {
    if summary.cancelled {
        ExitCode::from(EXIT_INTERRUPTED)
    } else if summary.failed.is_empty() && summary.conflicts == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INCOMPLETE)
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: &AppConfig,
    direction: pagesync_core::Direction,
    args: &RunArgs,
) -> Result<ExitCode> {
    let _lock = TreeLock::acquire(&config.workspace.root)?;
    let engine = build_engine(config, !args.json)?;
    cancel_on_interrupt(engine.signal().clone());

    let summary = engine
        .run(direction, args.options())
        .await
        .with_context(|| format!("{direction} failed"))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        output::print_summary(&summary);
    }
    Ok(exit_code(&summary))
}

fn cmd_status(config: &AppConfig, all: bool, json: bool) -> Result<ExitCode> {
    let engine = build_engine(config, false)?;
    let report = engine.status().context("failed to read status")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        output::print_status(&report, all);
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_resolve(
    config: &AppConfig,
    ids: &[String],
    policy: Option<ConflictPolicy>,
    diff: bool,
) -> Result<ExitCode> {
    if diff {
        let engine = build_engine(config, false)?;
        let ids = if ids.is_empty() {
            engine.status()?.conflicts
        } else {
            ids.to_vec()
        };
        for id in &ids {
            println!("{}", style::header(&format!("Conflict {id}")));
            println!("{}", engine.conflict_diff(id)?);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let Some(policy) = policy else {
        bail!("pass --policy to resolve, or --diff to inspect");
    };
    let _lock = TreeLock::acquire(&config.workspace.root)?;
    let engine = build_engine(config, true)?;
    let summary = engine.resolve(ids, policy).await.context("resolve failed")?;
    output::print_summary(&summary);
    Ok(exit_code(&summary))
}

async fn cmd_recheck(config: &AppConfig) -> Result<ExitCode> {
    let _lock = TreeLock::acquire(&config.workspace.root)?;
    let engine = build_engine(config, true)?;
    let report = engine
        .recheck_inaccessible()
        .await
        .context("recheck failed")?;
    output::print_recheck(&report);
    Ok(if report.failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INCOMPLETE)
    })
}

fn cmd_cleanup(config: &AppConfig, ids: &[String], yes: bool) -> Result<ExitCode> {
    let _lock = TreeLock::acquire(&config.workspace.root)?;
    let engine = build_engine(config, false)?;

    if !yes {
        let status = engine.status()?;
        let candidates: Vec<&String> = status
            .inaccessible
            .iter()
            .filter(|id| ids.is_empty() || ids.contains(id))
            .collect();
        if candidates.is_empty() {
            println!("{}", style::success("No inaccessible items"));
        } else {
            println!("{}", style::header("Would remove"));
            for id in candidates {
                let path = status
                    .items
                    .iter()
                    .find(|i| &i.id == id)
                    .map(|i| i.path.as_str())
                    .unwrap_or("-");
                println!("  {id}  {}", style::dim(path));
            }
            println!();
            println!("Re-run with --yes to delete them.");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let report = engine
        .cleanup_inaccessible(ids)
        .context("cleanup failed")?;
    output::print_cleanup(&report);
    Ok(ExitCode::SUCCESS)
}

fn cmd_export(config: &AppConfig, output: Option<&Path>) -> Result<ExitCode> {
    let db = open_database(config)?;
    let json = db
        .export_snapshot_json()
        .context("failed to export snapshot")?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!(
                "{}",
                style::success(&format!("Snapshot written to {}", path.display()))
            );
        }
        None => println!("{json}"),
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_import(config: &AppConfig, file: &Path, force: bool) -> Result<ExitCode> {
    let _lock = TreeLock::acquire(&config.workspace.root)?;
    let db = open_database(config)?;
    let tracked = db.count_items().context("failed to count items")?;
    if tracked > 0 && !force {
        bail!(
            "the state store already tracks {} item(s); pass --force to replace it",
            tracked
        );
    }
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let count = db
        .import_snapshot_json(&json)
        .context("failed to import snapshot")?;
    println!(
        "{}",
        style::success(&format!("Imported {} item(s) from {}", count, file.display()))
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_init(
    output: &Path,
    base_url: &str,
    scope: ScopeArg,
    id: &str,
    root: &Path,
    force: bool,
) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "file already exists: {}. Use --force or a different --config path.",
            output.display()
        );
    }

    let config = AppConfig::minimal(
        base_url,
        ScopeConfig {
            kind: scope.into(),
            id: id.to_string(),
        },
        root.to_path_buf(),
    );
    config.validate().context("invalid settings")?;

    let toml = config.to_toml().context("failed to render configuration")?;
    std::fs::write(output, toml).context("failed to write config file")?;
    open_database(&config)?;

    println!(
        "{}",
        style::success(&format!("Configuration written to {}", output.display()))
    );
    println!();
    println!("Next steps:");
    println!(
        "  1. Export the API token as {}",
        config.remote.token_env
    );
    println!("  2. Preview with: pagesync pull --dry-run --config {}", output.display());
    println!("  3. Mirror the tree: pagesync pull --config {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "pagesync",
            "sync",
            "--dry-run",
            "--policy",
            "prefer-remote",
            "-j",
            "4",
        ])
        .unwrap();
        let Commands::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        let options = args.options();
        assert!(options.dry_run);
        assert!(!options.force);
        assert_eq!(options.policy, Some(ConflictPolicy::PreferRemote));
        assert_eq!(options.concurrency, Some(4));
    }

    #[test]
    fn test_cli_rejects_unknown_policy() {
        assert!(Cli::try_parse_from(["pagesync", "pull", "--policy", "coin-flip"]).is_err());
    }

    #[test]
    fn test_resolve_diff_conflicts_with_policy() {
        assert!(Cli::try_parse_from([
            "pagesync",
            "resolve",
            "--diff",
            "--policy",
            "fail"
        ])
        .is_err());
    }

    #[test]
    fn test_init_writes_loadable_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("pagesync.toml");
        let root = dir.path().join("tree");

        cmd_init(
            &output,
            "https://wiki.example.com",
            ScopeArg::Collection,
            "ENG",
            &root,
            false,
        )
        .unwrap();

        let config = load_config(&output).unwrap();
        assert_eq!(config.scope.kind, ScopeKind::Collection);
        assert_eq!(config.scope.id, "ENG");
        assert!(root.join(".pagesync/state.db").exists());

        assert!(cmd_init(
            &output,
            "https://wiki.example.com",
            ScopeArg::Collection,
            "ENG",
            &root,
            false,
        )
        .is_err());
    }
}

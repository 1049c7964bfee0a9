//! Per-tree lock file so only one pagesync process works on a tree.
//!
//! The lock holds the owning pid. A lock whose process is gone is stale and
//! is taken over.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

/// Location of the lock file inside a tree.
pub fn lock_path(root: &Path) -> PathBuf {
    root.join(".pagesync").join("lock")
}

/// Held for the duration of a command; removes the lock file on drop.
#[derive(Debug)]
pub struct TreeLock {
    path: PathBuf,
}

impl TreeLock {
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = lock_path(root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create lock directory")?;
        }

        match read_pid(&path)? {
            Some(pid) if pid != std::process::id() && is_process_alive(pid) => {
                bail!(
                    "another pagesync process (pid {}) is working on this tree; \
                     remove {} if that is wrong",
                    pid,
                    path.display()
                );
            }
            Some(pid) => {
                warn!(pid, path = %path.display(), "removing stale lock");
                fs::remove_file(&path).context("failed to remove stale lock")?;
            }
            None => {}
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("failed to create lock {}", path.display()))?;
        write!(file, "{}", std::process::id()).context("failed to write lock")?;
        info!(path = %path.display(), "lock acquired");
        Ok(Self { path })
    }
}

impl Drop for TreeLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock");
        }
    }
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).context("failed to read lock")?;
    // Unparseable contents count as stale.
    Ok(Some(contents.trim().parse().unwrap_or(0)))
}

/// Check whether a process with the given pid is alive.
fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        // Signal 0 only checks that the process exists. EPERM means it
        // exists under another user.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

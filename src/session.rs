//! Per-run context owning the scratch directories.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::apply::revert::RevertStore;
use crate::config::SpitoConfig;
use crate::exec::Executor;
use crate::logging::Log;
use crate::overlay::OverlayStore;

/// Distinguishes sessions created by the same process.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Everything one evaluation run needs: configuration, logging, command
/// execution and its own scratch space.
///
/// The scratch root (`<scratch_dir>/spito-<pid>-<n>`) holds the overlay,
/// the staging tree and pending backups. It is removed when the session is
/// dropped, whether the run succeeded or not.
pub struct Session {
    /// Engine configuration.
    pub config: SpitoConfig,
    /// Logger for output and rule recording.
    pub log: Arc<dyn Log>,
    /// Command executor (for testing or real system calls).
    pub executor: Arc<dyn Executor>,
    scratch: PathBuf,
    overlay: OverlayStore,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("log", &"<dyn Log>")
            .field("executor", &self.executor)
            .field("scratch", &self.scratch)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session with a fresh scratch root under `config.scratch_dir`.
    #[must_use]
    pub fn new(config: SpitoConfig, log: Arc<dyn Log>, executor: Arc<dyn Executor>) -> Self {
        let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let scratch = config
            .scratch_dir
            .join(format!("spito-{}-{n}", std::process::id()));
        let overlay = OverlayStore::new(scratch.join("fs"));
        Self {
            config,
            log,
            executor,
            scratch,
            overlay,
        }
    }

    /// The overlay of pending changes.
    #[must_use]
    pub const fn overlay(&self) -> &OverlayStore {
        &self.overlay
    }

    /// Root of this session's scratch space.
    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    /// Where merged files are staged before being moved into place.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.scratch.join("staging")
    }

    /// Where overwritten files are backed up until the batch is persisted.
    #[must_use]
    pub fn backup_scratch_dir(&self) -> PathBuf {
        self.scratch.join("backup")
    }

    /// Durable state: revert batches and the environment ledger.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.config.state_dir
    }

    /// Where rule collections are cloned.
    #[must_use]
    pub fn rulesets_dir(&self) -> &Path {
        &self.config.rulesets_dir
    }

    /// The revert batch store under the state directory.
    #[must_use]
    pub fn revert_store(&self) -> RevertStore {
        RevertStore::in_state_dir(&self.config.state_dir)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.scratch)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            self.log.debug(&format!(
                "failed to remove scratch dir {}: {e}",
                self.scratch.display()
            ));
        }
    }
}

//! Durable, numbered revert batches.
//!
//! Layout under the store root:
//!
//! ```text
//! latest-id
//! <id>/batch.json
//! <id>/backup/<real path without leading />
//! ```
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::RevertError;

/// One undo action recorded while applying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RevertStep {
    /// Delete a file that did not exist before.
    RemoveFile {
        /// Real path.
        path: PathBuf,
    },
    /// Delete the top-most directory that did not exist before.
    RemoveDirAll {
        /// Real path.
        path: PathBuf,
    },
    /// Put back the content that was overwritten.
    RestoreBackup {
        /// Real path.
        path: PathBuf,
        /// Location of the saved content, relative to the batch's backup dir.
        backup: PathBuf,
    },
}

impl fmt::Display for RevertStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoveFile { path } => write!(f, "remove {}", path.display()),
            Self::RemoveDirAll { path } => write!(f, "remove directory {}", path.display()),
            Self::RestoreBackup { path, .. } => write!(f, "restore {}", path.display()),
        }
    }
}

/// A persisted batch. Steps are stored in reverse application order and
/// replayed in stored order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertBatch {
    /// Batch id.
    pub id: u64,
    /// RFC 3339 creation time.
    pub created: String,
    /// Undo steps, replay order.
    pub steps: Vec<RevertStep>,
}

/// Directory of revert batches.
#[derive(Debug, Clone)]
pub struct RevertStore {
    root: PathBuf,
}

impl RevertStore {
    /// Create a store rooted at `root`; the directory is created on first persist.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store kept under a state directory, at `<state_dir>/revert`.
    #[must_use]
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join("revert"))
    }

    /// Directory holding batch `id`.
    #[must_use]
    pub fn batch_dir(&self, id: u64) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Persist `applied` (in application order) under a fresh id, moving the
    /// backups collected in `backup_scratch` into the batch.
    ///
    /// # Errors
    ///
    /// Returns [`RevertError::Io`] if the batch cannot be written.
    pub fn persist(&self, applied: Vec<RevertStep>, backup_scratch: &Path) -> Result<u64, RevertError> {
        fs::create_dir_all(&self.root).map_err(|e| RevertError::io(&self.root, e))?;
        let id = self.next_id()?;
        let dir = self.batch_dir(id);
        fs::create_dir_all(&dir).map_err(|e| RevertError::io(&dir, e))?;

        if backup_scratch.is_dir() {
            move_dir(backup_scratch, &dir.join("backup"))?;
        }

        let mut steps = applied;
        steps.reverse();
        let batch = RevertBatch {
            id,
            created: chrono::Utc::now().to_rfc3339(),
            steps,
        };
        let encoded = serde_json::to_vec_pretty(&batch)
            .map_err(|e| RevertError::io(&dir, io::Error::from(e)))?;
        let batch_file = dir.join("batch.json");
        fs::write(&batch_file, encoded).map_err(|e| RevertError::io(&batch_file, e))?;

        let latest = self.root.join("latest-id");
        fs::write(&latest, id.to_string()).map_err(|e| RevertError::io(&latest, e))?;
        Ok(id)
    }

    fn next_id(&self) -> Result<u64, RevertError> {
        let latest = fs::read_to_string(self.root.join("latest-id"))
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let highest_dir = self.list()?.last().copied().unwrap_or(0);
        Ok(latest.max(highest_dir) + 1)
    }

    /// Load batch `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RevertError::NotFound`] if no such batch exists and
    /// [`RevertError::Corrupt`] if it cannot be decoded.
    pub fn load(&self, id: u64) -> Result<RevertBatch, RevertError> {
        let path = self.batch_dir(id).join("batch.json");
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RevertError::NotFound { id });
            }
            Err(e) => return Err(RevertError::io(&path, e)),
        };
        serde_json::from_slice(&raw).map_err(|e| RevertError::Corrupt {
            id,
            message: e.to_string(),
        })
    }

    /// Replay batch `id` in stored order, stopping at the first failing step.
    /// The batch is discarded once every step succeeded.
    ///
    /// Returns the number of steps replayed.
    ///
    /// # Errors
    ///
    /// Returns [`RevertError::StepFailed`] for the first step that fails;
    /// later steps are not attempted and the batch is kept.
    pub fn revert(&self, id: u64) -> Result<usize, RevertError> {
        let batch = self.load(id)?;
        let backup_root = self.batch_dir(id).join("backup");

        for (index, step) in batch.steps.iter().enumerate() {
            replay(step, &backup_root).map_err(|source| RevertError::StepFailed {
                index,
                step: step.to_string(),
                source,
            })?;
        }

        let dir = self.batch_dir(id);
        fs::remove_dir_all(&dir).map_err(|e| RevertError::io(&dir, e))?;
        Ok(batch.steps.len())
    }

    /// Ids of all persisted batches, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`RevertError::Io`] if the store cannot be listed.
    pub fn list(&self) -> Result<Vec<u64>, RevertError> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RevertError::io(&self.root, e)),
        };
        let mut ids = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| RevertError::io(&self.root, e))?;
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok())
                && entry.path().join("batch.json").is_file()
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

fn replay(step: &RevertStep, backup_root: &Path) -> io::Result<()> {
    match step {
        RevertStep::RemoveFile { path } => ignore_missing(fs::remove_file(path)),
        RevertStep::RemoveDirAll { path } => ignore_missing(fs::remove_dir_all(path)),
        RevertStep::RestoreBackup { path, backup } => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            // Recreate the file so it takes the backup's mode.
            ignore_missing(fs::remove_file(path))?;
            fs::copy(backup_root.join(backup), path).map(|_| ())
        }
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Move a directory tree, copying when a rename across filesystems fails.
fn move_dir(src: &Path, dst: &Path) -> Result<(), RevertError> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    copy_dir_recursive(src, dst)?;
    fs::remove_dir_all(src).map_err(|e| RevertError::io(src, e))
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), RevertError> {
    fs::create_dir_all(dst).map_err(|e| RevertError::io(dst, e))?;
    for entry in fs::read_dir(src).map_err(|e| RevertError::io(src, e))? {
        let entry = entry.map_err(|e| RevertError::io(src, e))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).map_err(|e| RevertError::io(&src_path, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, RevertStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = RevertStore::new(tmp.path().join("revert"));
        (tmp, store)
    }

    #[test]
    fn ids_increase_monotonically() {
        let (tmp, store) = store();
        let empty = tmp.path().join("none");
        assert_eq!(store.persist(vec![], &empty).unwrap(), 1);
        assert_eq!(store.persist(vec![], &empty).unwrap(), 2);
        assert_eq!(store.list().unwrap(), vec![1, 2]);
    }

    #[test]
    fn ids_do_not_reuse_reverted_numbers() {
        let (tmp, store) = store();
        let empty = tmp.path().join("none");
        let first = store.persist(vec![], &empty).unwrap();
        store.revert(first).unwrap();
        assert_eq!(store.persist(vec![], &empty).unwrap(), first + 1);
    }

    #[test]
    fn steps_are_stored_in_reverse() {
        let (tmp, store) = store();
        let a = RevertStep::RemoveFile {
            path: tmp.path().join("a"),
        };
        let b = RevertStep::RemoveFile {
            path: tmp.path().join("b"),
        };
        let id = store
            .persist(vec![a.clone(), b.clone()], &tmp.path().join("none"))
            .unwrap();
        assert_eq!(store.load(id).unwrap().steps, vec![b, a]);
    }

    #[test]
    fn revert_restores_backup_and_removes_new_files() {
        let (tmp, store) = store();
        let scratch = tmp.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        fs::write(scratch.join("saved"), "orig").unwrap();

        let existing = tmp.path().join("existing");
        let created = tmp.path().join("created");
        fs::write(&existing, "new").unwrap();
        fs::write(&created, "new").unwrap();

        let id = store
            .persist(
                vec![
                    RevertStep::RestoreBackup {
                        path: existing.clone(),
                        backup: PathBuf::from("saved"),
                    },
                    RevertStep::RemoveFile {
                        path: created.clone(),
                    },
                ],
                &scratch,
            )
            .unwrap();
        assert!(!scratch.exists(), "backups should move into the batch");

        assert_eq!(store.revert(id).unwrap(), 2);
        assert_eq!(fs::read_to_string(&existing).unwrap(), "orig");
        assert!(!created.exists());
        assert!(matches!(store.load(id), Err(RevertError::NotFound { .. })));
    }

    #[test]
    fn revert_stops_at_first_failure() {
        let (tmp, store) = store();
        let survivor = tmp.path().join("survivor");
        fs::write(&survivor, "x").unwrap();
        // Stored order is reversed: the missing backup is replayed first.
        let id = store
            .persist(
                vec![
                    RevertStep::RemoveFile {
                        path: survivor.clone(),
                    },
                    RevertStep::RestoreBackup {
                        path: tmp.path().join("target"),
                        backup: PathBuf::from("missing"),
                    },
                ],
                &tmp.path().join("none"),
            )
            .unwrap();
        let err = store.revert(id).unwrap_err();
        assert!(matches!(err, RevertError::StepFailed { index: 0, .. }));
        assert!(survivor.exists(), "later steps must not run");
        assert!(store.load(id).is_ok(), "failed batch is kept");
    }

    #[test]
    fn removing_missing_paths_is_not_an_error() {
        let (tmp, store) = store();
        let id = store
            .persist(
                vec![
                    RevertStep::RemoveFile {
                        path: tmp.path().join("gone"),
                    },
                    RevertStep::RemoveDirAll {
                        path: tmp.path().join("gone-dir"),
                    },
                ],
                &tmp.path().join("none"),
            )
            .unwrap();
        store.revert(id).unwrap();
    }

    #[test]
    fn unknown_batch_is_not_found() {
        let (_tmp, store) = store();
        assert!(matches!(store.revert(42), Err(RevertError::NotFound { id: 42 })));
    }

    #[test]
    fn batch_json_uses_tagged_steps() {
        let (tmp, store) = store();
        let id = store
            .persist(
                vec![RevertStep::RemoveDirAll {
                    path: PathBuf::from("/opt/x"),
                }],
                &tmp.path().join("none"),
            )
            .unwrap();
        let raw = fs::read_to_string(store.batch_dir(id).join("batch.json")).unwrap();
        assert!(raw.contains("\"action\": \"remove_dir_all\""));
    }
}

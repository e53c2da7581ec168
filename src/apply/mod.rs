//! Committing the overlay to the real filesystem.
//!
//! [`apply`] runs in three phases:
//!
//! 1. merge every pending descriptor (in parallel) into a staging tree that
//!    mirrors real paths;
//! 2. walk the staging tree, backing up each real file before it is replaced
//!    and recording the undo step;
//! 3. persist the undo steps as a revert batch and clear the overlay.
//!
//! The walk is not transactional. Every overwritten byte is backed up first,
//! and if the walk stops midway the steps taken so far are still persisted
//! so the partial change can be reverted.
pub mod environment;
pub mod revert;

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use rayon::prelude::*;
use sha2::{Digest as _, Sha256};

use crate::error::ApplyError;
use crate::logging::Log;
use crate::overlay::OverlayStore;
use crate::session::Session;

pub use environment::{EnvironmentLedger, EnvironmentRecord};
pub use revert::{RevertBatch, RevertStep, RevertStore};

/// Commit the session's overlay and return the id of the new revert batch.
///
/// # Errors
///
/// Returns an [`ApplyError`] if a descriptor cannot be merged (nothing has
/// been touched yet in that case) or if the commit fails;
/// [`ApplyError::Interrupted`] names the batch holding the partial change.
pub fn apply(session: &Session) -> Result<u64, ApplyError> {
    let overlay = session.overlay();
    let staging = session.staging_dir();
    let backup_dir = session.backup_scratch_dir();
    reset_dir(&staging)?;
    reset_dir(&backup_dir)?;

    let prototypes = overlay.prototypes()?;
    session
        .log
        .debug(&format!("staging {} pending file(s)", prototypes.len()));
    stage_all(overlay, &prototypes, &staging)?;

    let mut commit = Commit {
        log: session.log.as_ref(),
        backup_dir: &backup_dir,
        steps: Vec::new(),
    };
    let walked = commit.walk(&staging, Path::new("/"), false);
    let store = session.revert_store();

    if let Err(e) = walked {
        if commit.steps.is_empty() {
            return Err(e);
        }
        let revert_id = store.persist(commit.steps, &backup_dir)?;
        return Err(ApplyError::Interrupted {
            revert_id,
            source: Box::new(e),
        });
    }

    let revert_id = store.persist(commit.steps, &backup_dir)?;
    overlay.clear()?;
    fs::remove_dir_all(&staging).ok();
    session.log.info(&format!("applied changes, revert batch {revert_id}"));
    Ok(revert_id)
}

fn reset_dir(dir: &Path) -> Result<(), ApplyError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(ApplyError::io(dir, e)),
    }
    fs::create_dir_all(dir).map_err(|e| ApplyError::io(dir, e))
}

/// `path` without its root, for joining under the staging or backup dir.
fn strip_root(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

fn stage_all(overlay: &OverlayStore, prototypes: &[PathBuf], staging: &Path) -> Result<(), ApplyError> {
    prototypes.par_iter().try_for_each(|path| -> Result<(), ApplyError> {
        let Some(bytes) = overlay.materialize(path)? else {
            return Ok(());
        };
        let target = staging.join(strip_root(path));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| ApplyError::io(parent, e))?;
        }
        fs::write(&target, bytes).map_err(|e| ApplyError::io(&target, e))
    })
}

struct Commit<'a> {
    log: &'a dyn Log,
    backup_dir: &'a Path,
    steps: Vec<RevertStep>,
}

impl Commit<'_> {
    /// Move everything under `staged` to `real`. Inside a directory that was
    /// created by this commit (`covered`) no further steps are recorded.
    fn walk(&mut self, staged: &Path, real: &Path, covered: bool) -> Result<(), ApplyError> {
        let mut children: Vec<_> = fs::read_dir(staged)
            .map_err(|e| ApplyError::io(staged, e))?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<Result<_, _>>()
            .map_err(|e| ApplyError::io(staged, e))?;
        children.sort();

        for name in children {
            let staged_child = staged.join(&name);
            let real_child = real.join(&name);
            if staged_child.is_dir() {
                self.enter_dir(&staged_child, &real_child, covered)?;
            } else {
                self.place_file(&staged_child, &real_child, covered)?;
            }
        }
        Ok(())
    }

    fn enter_dir(&mut self, staged: &Path, real: &Path, covered: bool) -> Result<(), ApplyError> {
        match fs::symlink_metadata(real) {
            Ok(meta) if meta.is_dir() => self.walk(staged, real, covered),
            Ok(_) if real.is_dir() => self.walk(staged, real, covered),
            Ok(_) => Err(ApplyError::Conflict {
                path: real.to_path_buf(),
                reason: "a file exists where a directory is needed".to_string(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(real).map_err(|e| ApplyError::io(real, e))?;
                if !covered {
                    self.log.debug(&format!("created directory {}", real.display()));
                    self.steps.push(RevertStep::RemoveDirAll {
                        path: real.to_path_buf(),
                    });
                }
                self.walk(staged, real, true)
            }
            Err(e) => Err(ApplyError::io(real, e)),
        }
    }

    fn place_file(&mut self, staged: &Path, real: &Path, covered: bool) -> Result<(), ApplyError> {
        if real.is_dir() {
            return Err(ApplyError::Conflict {
                path: real.to_path_buf(),
                reason: "a directory exists where a file is needed".to_string(),
            });
        }

        match fs::read(real) {
            Ok(current) => {
                let staged_bytes = fs::read(staged).map_err(|e| ApplyError::io(staged, e))?;
                if Sha256::digest(&current) == Sha256::digest(&staged_bytes) {
                    self.log.debug(&format!("unchanged {}", real.display()));
                    return Ok(());
                }

                let backup = strip_root(real);
                let backup_path = self.backup_dir.join(&backup);
                if let Some(parent) = backup_path.parent() {
                    fs::create_dir_all(parent).map_err(|e| ApplyError::io(parent, e))?;
                }
                fs::copy(real, &backup_path).map_err(|e| ApplyError::io(&backup_path, e))?;
                self.steps.push(RevertStep::RestoreBackup {
                    path: real.to_path_buf(),
                    backup,
                });

                let permissions = fs::metadata(real).ok().map(|m| m.permissions());
                fs::remove_file(real).map_err(|e| ApplyError::io(real, e))?;
                move_file(staged, real)?;
                if let Some(permissions) = permissions {
                    fs::set_permissions(real, permissions).map_err(|e| ApplyError::io(real, e))?;
                }
                self.log.debug(&format!("replaced {}", real.display()));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                move_file(staged, real)?;
                if !covered {
                    self.steps.push(RevertStep::RemoveFile {
                        path: real.to_path_buf(),
                    });
                }
                self.log.debug(&format!("created {}", real.display()));
            }
            Err(e) => return Err(ApplyError::io(real, e)),
        }
        Ok(())
    }
}

/// Rename `src` to `dst`, copying when they are on different filesystems.
fn move_file(src: &Path, dst: &Path) -> Result<(), ApplyError> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).map_err(|e| ApplyError::io(dst, e))?;
    fs::remove_file(src).map_err(|e| ApplyError::io(src, e))
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::config::SpitoConfig;
    use crate::exec::SystemExecutor;
    use crate::logging::Logger;
    use crate::overlay::FileType;
    use std::sync::Arc;

    struct Fixture {
        tmp: tempfile::TempDir,
        session: Session,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let session = Session::new(
                SpitoConfig::rooted_at(&tmp.path().join("spito")),
                Arc::new(Logger::detached()),
                Arc::new(SystemExecutor),
            );
            fs::create_dir_all(tmp.path().join("real")).unwrap();
            Self { tmp, session }
        }

        fn real(&self, rel: &str) -> PathBuf {
            self.tmp.path().join("real").join(rel)
        }
    }

    #[test]
    fn apply_then_revert_restores_original_bytes() {
        let f = Fixture::new();
        let path = f.real("hosts");
        fs::write(&path, "orig").unwrap();
        f.session.overlay().write_file(&path, b"new", false).unwrap();

        let id = apply(&f.session).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");

        f.session.revert_store().revert(id).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"orig");
    }

    #[cfg(unix)]
    #[test]
    fn revert_restores_file_mode() {
        use std::os::unix::fs::PermissionsExt as _;

        let f = Fixture::new();
        let path = f.real("secret");
        fs::write(&path, "orig").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        f.session.overlay().write_file(&path, b"new", false).unwrap();

        let id = apply(&f.session).unwrap();
        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&path), 0o600);

        f.session.revert_store().revert(id).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"orig");
        assert_eq!(mode(&path), 0o600);
    }

    #[test]
    fn apply_then_revert_removes_new_file() {
        let f = Fixture::new();
        let path = f.real("fresh.conf");
        f.session.overlay().write_file(&path, b"new", false).unwrap();

        let id = apply(&f.session).unwrap();
        assert!(path.exists());
        f.session.revert_store().revert(id).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn new_directory_tree_is_removed_as_one_step() {
        let f = Fixture::new();
        let top = f.real("opt-app");
        f.session
            .overlay()
            .write_file(&top.join("etc").join("a"), b"1", false)
            .unwrap();
        f.session
            .overlay()
            .write_file(&top.join("etc").join("b"), b"2", false)
            .unwrap();

        let id = apply(&f.session).unwrap();
        let batch = f.session.revert_store().load(id).unwrap();
        assert_eq!(batch.steps, vec![RevertStep::RemoveDirAll { path: top.clone() }]);

        f.session.revert_store().revert(id).unwrap();
        assert!(!top.exists());
    }

    #[test]
    fn unchanged_files_record_no_step() {
        let f = Fixture::new();
        let path = f.real("same");
        fs::write(&path, "same").unwrap();
        f.session.overlay().write_file(&path, b"same", false).unwrap();
        let id = apply(&f.session).unwrap();
        assert!(f.session.revert_store().load(id).unwrap().steps.is_empty());
    }

    #[test]
    fn apply_clears_overlay() {
        let f = Fixture::new();
        f.session
            .overlay()
            .write_file(&f.real("x"), b"1", false)
            .unwrap();
        apply(&f.session).unwrap();
        assert!(f.session.overlay().prototypes().unwrap().is_empty());
    }

    #[test]
    fn merge_conflict_touches_nothing() {
        let f = Fixture::new();
        let path = f.real("conflict");
        f.session.overlay().write_file(&path, b"a", false).unwrap();
        f.session.overlay().write_file(&path, b"b", false).unwrap();
        let err = apply(&f.session).unwrap_err();
        assert!(matches!(err, ApplyError::Overlay(_)));
        assert!(!path.exists());
        assert!(f.session.revert_store().list().unwrap().is_empty());
    }

    #[test]
    fn structured_config_is_rendered_in_place() {
        let f = Fixture::new();
        let path = f.real("app.toml");
        fs::write(&path, "keep = 1\n").unwrap();
        f.session
            .overlay()
            .write_config(&path, "port = 80\n", FileType::Toml, None, false)
            .unwrap();
        apply(&f.session).unwrap();
        let written: toml::Value = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.get("keep").and_then(toml::Value::as_integer), Some(1));
        assert_eq!(written.get("port").and_then(toml::Value::as_integer), Some(80));
    }

    #[test]
    fn file_in_place_of_directory_is_interrupted_after_earlier_steps() {
        let f = Fixture::new();
        let early = f.real("a-early");
        let blocked = f.real("b-blocker");
        fs::write(&blocked, "i am a file").unwrap();
        f.session.overlay().write_file(&early, b"1", false).unwrap();
        f.session
            .overlay()
            .write_file(&blocked.join("child"), b"2", false)
            .unwrap();

        let err = apply(&f.session).unwrap_err();
        let ApplyError::Interrupted { revert_id, .. } = err else {
            panic!("expected Interrupted, got {err:?}");
        };
        assert!(early.exists());
        f.session.revert_store().revert(revert_id).unwrap();
        assert!(!early.exists());
    }
}

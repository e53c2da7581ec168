//! Fetching rule collections with git.
use std::fs;
use std::path::Path;

use git2::build::CheckoutBuilder;
use git2::{Repository, ResetType};

use crate::error::RuleError;

/// Source of collection checkouts.
///
/// Implementations must be callable from several threads at once; the
/// resolver fetches one dependency per thread.
#[cfg_attr(test, mockall::automock)]
pub trait Fetcher: Send + Sync {
    /// Clone `url` into `dir`, which does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::FetchFailure`] if the clone fails.
    fn clone_repo(&self, url: &str, dir: &Path) -> Result<(), RuleError>;

    /// Bring the existing checkout at `dir` up to date, discarding local
    /// changes. A detached checkout is moved back onto the remote's default
    /// branch.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::FetchFailure`] if fetching or resetting fails.
    fn force_pull(&self, dir: &Path) -> Result<(), RuleError>;

    /// Check out `version` (tag, branch or commit) in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::FetchFailure`] if the version does not exist.
    fn checkout(&self, dir: &Path, version: &str) -> Result<(), RuleError>;
}

/// [`Fetcher`] backed by libgit2.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitFetcher;

fn failure(dir: &Path, e: impl std::fmt::Display) -> RuleError {
    RuleError::FetchFailure {
        url: dir.display().to_string(),
        message: e.to_string(),
    }
}

impl Fetcher for GitFetcher {
    fn clone_repo(&self, url: &str, dir: &Path) -> Result<(), RuleError> {
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent).map_err(|e| failure(parent, e))?;
        }
        Repository::clone(url, dir)
            .map(drop)
            .map_err(|e| RuleError::FetchFailure {
                url: url.to_string(),
                message: e.message().to_string(),
            })
    }

    fn force_pull(&self, dir: &Path) -> Result<(), RuleError> {
        let repo = Repository::open(dir).map_err(|e| failure(dir, e.message()))?;
        let mut remote = repo
            .find_remote("origin")
            .map_err(|e| failure(dir, e.message()))?;
        remote
            .fetch::<&str>(&[], None, None)
            .map_err(|e| failure(dir, e.message()))?;

        let current = repo
            .head()
            .ok()
            .filter(git2::Reference::is_branch)
            .and_then(|head| head.shorthand().map(str::to_string));
        let detached = current.is_none();
        let branch = current
            .or_else(|| default_branch(&repo))
            .ok_or_else(|| failure(dir, "no default branch on origin"))?;

        let target = repo
            .revparse_single(&format!("refs/remotes/origin/{branch}"))
            .map_err(|e| failure(dir, e.message()))?;
        if detached {
            // Left detached by a pinned checkout; move back onto the branch.
            let commit = target.peel_to_commit().map_err(|e| failure(dir, e.message()))?;
            repo.branch(&branch, &commit, true)
                .map_err(|e| failure(dir, e.message()))?;
            repo.set_head(&format!("refs/heads/{branch}"))
                .map_err(|e| failure(dir, e.message()))?;
        }
        repo.reset(&target, ResetType::Hard, None)
            .map_err(|e| failure(dir, e.message()))
    }

    fn checkout(&self, dir: &Path, version: &str) -> Result<(), RuleError> {
        let repo = Repository::open(dir).map_err(|e| failure(dir, e.message()))?;
        let (object, reference) = repo
            .revparse_ext(version)
            .or_else(|_| repo.revparse_ext(&format!("origin/{version}")))
            .map_err(|e| failure(dir, format!("version '{version}': {}", e.message())))?;

        repo.checkout_tree(&object, Some(CheckoutBuilder::new().force()))
            .map_err(|e| failure(dir, e.message()))?;
        let moved = match reference.as_ref().and_then(git2::Reference::name) {
            Some(name) => repo.set_head(name),
            None => repo.set_head_detached(object.id()),
        };
        moved.map_err(|e| failure(dir, e.message()))
    }
}

/// Branch `origin/HEAD` points at, falling back to `main` or `master`.
fn default_branch(repo: &Repository) -> Option<String> {
    if let Ok(head) = repo.find_reference("refs/remotes/origin/HEAD")
        && let Some(name) = head
            .symbolic_target()
            .and_then(|t| t.strip_prefix("refs/remotes/origin/"))
    {
        return Some(name.to_string());
    }
    ["main", "master"]
        .into_iter()
        .find(|b| {
            repo.find_reference(&format!("refs/remotes/origin/{b}"))
                .is_ok()
        })
        .map(str::to_string)
}

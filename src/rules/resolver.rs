//! Collection fetching and transitive dependency flattening.
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use super::fetch::Fetcher;
use super::identifier::{CollectionId, DependencySpec};
use super::lock::{DependencyLock, LockedDependency};
use super::manifest::{Manifest, RuleConfig};
use crate::error::RuleError;
use crate::logging::Log;

/// A fetched collection and its flattened dependencies.
#[derive(Debug, Clone)]
pub struct Collection {
    /// Canonical identifier.
    pub id: CollectionId,
    /// Local checkout.
    pub dir: PathBuf,
    /// Parsed manifest.
    pub manifest: Manifest,
    /// Flattened dependency list.
    pub lock: DependencyLock,
}

impl Collection {
    /// Look up `rule` and the absolute path of its script.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::NotFound`] if the rule is not declared or its
    /// script is missing.
    pub fn rule(&self, rule: &str) -> Result<(&RuleConfig, PathBuf), RuleError> {
        let config = self.manifest.rule(rule)?;
        let script = self.dir.join(&config.path);
        if !script.is_file() {
            return Err(RuleError::NotFound {
                what: format!("script {} for rule '{rule}'", script.display()),
            });
        }
        Ok((config, script))
    }
}

/// Collections already claimed during one resolution.
#[derive(Debug, Default)]
struct Claims(Mutex<HashSet<String>>);

impl Claims {
    /// Claim `id`; returns `false` if another thread already holds it.
    fn claim(&self, id: &CollectionId) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string())
    }
}

/// Fetches collections into the rulesets directory and flattens their
/// dependencies into `spito-lock.yml`.
pub struct Resolver {
    fetcher: Arc<dyn Fetcher>,
    rulesets_dir: PathBuf,
    default_host: String,
    log: Arc<dyn Log>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("rulesets_dir", &self.rulesets_dir)
            .field("default_host", &self.default_host)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Create a resolver cloning into `rulesets_dir`.
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        rulesets_dir: impl Into<PathBuf>,
        default_host: impl Into<String>,
        log: Arc<dyn Log>,
    ) -> Self {
        Self {
            fetcher,
            rulesets_dir: rulesets_dir.into(),
            default_host: default_host.into(),
            log,
        }
    }

    /// Canonicalize a user-supplied identifier.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidIdentifier`] if it is malformed.
    pub fn normalize(&self, identifier: &str) -> Result<CollectionId, RuleError> {
        CollectionId::normalize(identifier, &self.default_host)
    }

    /// Local checkout directory of `id`.
    #[must_use]
    pub fn local_dir(&self, id: &CollectionId) -> PathBuf {
        id.local_dir(&self.rulesets_dir)
    }

    /// Fetch `identifier` and make sure its dependencies are available.
    ///
    /// The collection is cloned if absent and force-pulled otherwise. If an
    /// existing lockfile covers every declared dependency and all locked
    /// collections are checked out, dependencies are not fetched again.
    /// Otherwise every dependency is fetched, level by level, and the
    /// deduplicated list is written to the lockfile.
    ///
    /// # Errors
    ///
    /// Returns the first fetch, manifest or identifier error.
    pub fn resolve(&self, identifier: &str) -> Result<Collection, RuleError> {
        let spec = DependencySpec::parse(identifier, &self.default_host)?;
        let dir = self.fetch(&spec)?;
        let manifest = Manifest::load(&dir, &self.default_host)?;

        if let Some(lock) = DependencyLock::load(&dir)?
            && lock.covers(&manifest.dependencies)
            && self.all_present(&lock)?
        {
            self.log
                .debug(&format!("{}: lockfile up to date", spec.collection));
            return Ok(Collection {
                id: spec.collection,
                dir,
                manifest,
                lock,
            });
        }

        let lock = self.flatten(&spec.collection, &manifest)?;
        lock.save(&dir)?;
        self.log.info(&format!(
            "{}: locked {} dependencies",
            spec.collection,
            lock.dependencies.len()
        ));
        Ok(Collection {
            id: spec.collection,
            dir,
            manifest,
            lock,
        })
    }

    /// Load an already fetched collection without touching the network.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::NotFound`] if it was never fetched.
    pub fn open(&self, id: &CollectionId) -> Result<Collection, RuleError> {
        let dir = self.local_dir(id);
        if !dir.is_dir() {
            return Err(RuleError::NotFound {
                what: format!("collection {id}"),
            });
        }
        let manifest = Manifest::load(&dir, &self.default_host)?;
        let lock = DependencyLock::load(&dir)?.unwrap_or_default();
        Ok(Collection {
            id: id.clone(),
            dir,
            manifest,
            lock,
        })
    }

    fn all_present(&self, lock: &DependencyLock) -> Result<bool, RuleError> {
        Ok(lock
            .specs(&self.default_host)?
            .iter()
            .all(|spec| self.local_dir(&spec.collection).is_dir()))
    }

    /// Clone or force-pull `spec`, then check out its version.
    fn fetch(&self, spec: &DependencySpec) -> Result<PathBuf, RuleError> {
        let dir = self.local_dir(&spec.collection);
        if dir.exists() {
            self.log.debug(&format!("pulling {}", spec.collection));
            self.fetcher.force_pull(&dir)?;
        } else {
            self.log.debug(&format!("cloning {}", spec.collection));
            self.fetcher.clone_repo(&spec.collection.clone_url(), &dir)?;
        }
        if let Some(version) = &spec.version {
            self.fetcher.checkout(&dir, version)?;
        }
        Ok(dir)
    }

    /// Fetch every transitive dependency of `root`, one breadth level at a
    /// time, with one thread per dependency.
    ///
    /// Each level is claimed in declaration order before any fetch starts,
    /// so when a collection is pinned to different versions the first
    /// declaration wins on every run.
    fn flatten(&self, root: &CollectionId, manifest: &Manifest) -> Result<DependencyLock, RuleError> {
        let claims = Claims::default();
        claims.claim(root);
        let mut lock = DependencyLock::default();
        let mut level = manifest.dependencies.clone();

        while !level.is_empty() {
            let mut claimed = Vec::new();
            for spec in level {
                if claims.claim(&spec.collection) {
                    lock.insert(LockedDependency::from(&spec));
                    claimed.push(spec);
                } else if let Some(held) = lock
                    .dependencies
                    .iter()
                    .find(|d| d.collection == spec.collection.as_str())
                    && held.version != spec.version
                {
                    let kept = held.version.as_deref().unwrap_or("latest");
                    self.log.warn(&format!(
                        "{root}: {} stays at {kept}, ignoring {spec}",
                        held.collection
                    ));
                }
            }

            self.log.debug(&format!(
                "{root}: fetching {} dependencies at this level",
                claimed.len()
            ));
            let manifests = thread::scope(|s| {
                let handles: Vec<_> = claimed
                    .iter()
                    .map(|spec| s.spawn(move || self.fetch_dependency(spec)))
                    .collect();
                handles
                    .into_iter()
                    .zip(&claimed)
                    .map(|(handle, spec)| {
                        handle.join().unwrap_or_else(|_| {
                            Err(RuleError::FetchFailure {
                                url: spec.collection.clone_url(),
                                message: "fetch thread panicked".to_string(),
                            })
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })?;

            level = manifests
                .into_iter()
                .flat_map(|m| m.dependencies)
                .collect();
        }
        Ok(lock)
    }

    /// Clone `spec` if it is not on disk yet, then check out its version.
    ///
    /// Existing dependency checkouts are not pulled; only the collection
    /// being resolved is refreshed.
    fn fetch_dependency(&self, spec: &DependencySpec) -> Result<Manifest, RuleError> {
        let dir = self.local_dir(&spec.collection);
        if dir.exists() {
            self.log
                .debug(&format!("{} already present", spec.collection));
            if let Some(version) = &spec.version {
                self.fetcher.checkout(&dir, version)?;
            }
        } else {
            self.fetch(spec)?;
        }
        Manifest::load(&dir, &self.default_host)
    }
}

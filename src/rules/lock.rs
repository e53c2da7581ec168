//! Dependency lockfile (`spito-lock.yml`).
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::identifier::{CollectionId, DependencySpec};
use crate::error::RuleError;

/// Lockfile name inside a collection checkout.
pub const LOCK_NAME: &str = "spito-lock.yml";

/// One flattened dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedDependency {
    /// Canonical collection identifier.
    pub collection: String,
    /// Pinned version, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl From<&DependencySpec> for LockedDependency {
    fn from(spec: &DependencySpec) -> Self {
        Self {
            collection: spec.collection.to_string(),
            version: spec.version.clone(),
        }
    }
}

/// The deduplicated transitive dependency list of a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyLock {
    /// Locked dependencies in resolution order.
    #[serde(default)]
    pub dependencies: Vec<LockedDependency>,
}

impl DependencyLock {
    /// Path of the lockfile for the collection checked out at `dir`.
    #[must_use]
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(LOCK_NAME)
    }

    /// Read the lockfile in `dir`; `None` if the collection is not locked.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::ManifestError`] if the file exists but cannot be
    /// read or parsed.
    pub fn load(dir: &Path) -> Result<Option<Self>, RuleError> {
        let path = Self::path_in(dir);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RuleError::ManifestError {
                    path,
                    message: e.to_string(),
                });
            }
        };
        if text.trim().is_empty() {
            return Ok(Some(Self::default()));
        }
        serde_yaml::from_str(&text)
            .map(Some)
            .map_err(|e| RuleError::ManifestError {
                path,
                message: e.to_string(),
            })
    }

    /// Write the lockfile into `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::ManifestError`] if it cannot be rendered or written.
    pub fn save(&self, dir: &Path) -> Result<(), RuleError> {
        let path = Self::path_in(dir);
        let fail = |message: String| RuleError::ManifestError {
            path: path.clone(),
            message,
        };
        let text = self.render().map_err(|e| fail(e.to_string()))?;
        fs::write(&path, text).map_err(|e| fail(e.to_string()))
    }

    /// Render as YAML.
    ///
    /// # Errors
    ///
    /// Returns the serializer error.
    pub fn render(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Add `dep` unless the same collection is already locked.
    ///
    /// Returns whether it was added.
    pub fn insert(&mut self, dep: LockedDependency) -> bool {
        if self.dependencies.iter().any(|d| d.collection == dep.collection) {
            return false;
        }
        self.dependencies.push(dep);
        true
    }

    /// Whether every spec in `declared` is locked at the declared version.
    #[must_use]
    pub fn covers(&self, declared: &[DependencySpec]) -> bool {
        declared.iter().all(|spec| {
            let collection = spec.collection.as_str();
            self.dependencies
                .iter()
                .any(|d| d.collection == collection && d.version == spec.version)
        })
    }

    /// Parse the locked entries back into specs.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidIdentifier`] for a malformed entry.
    pub fn specs(&self, default_host: &str) -> Result<Vec<DependencySpec>, RuleError> {
        self.dependencies
            .iter()
            .map(|d| {
                Ok(DependencySpec {
                    collection: CollectionId::normalize(&d.collection, default_host)?,
                    version: d.version.clone(),
                })
            })
            .collect()
    }
}

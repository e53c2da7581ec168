//! Mutually exclusive environments.
//!
//! Applying an environment rule first reverts whatever environment is
//! currently applied, so at most one is materialized at any time.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::revert::RevertStore;
use crate::error::RevertError;

/// One application of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    /// Revert batch produced when it was applied.
    pub revert_id: u64,
    /// Rule identifier, `collection#rule`.
    pub identifier: String,
    /// Whether the environment is still materialized.
    pub applied: bool,
}

/// Durable list of environment applications, stored as JSON.
#[derive(Debug, Clone)]
pub struct EnvironmentLedger {
    path: PathBuf,
    records: Vec<EnvironmentRecord>,
}

impl EnvironmentLedger {
    /// File name of the ledger inside the state directory.
    pub const FILE_NAME: &'static str = "environments.json";

    /// Load the ledger from `state_dir`; a missing file is an empty ledger.
    ///
    /// # Errors
    ///
    /// Returns [`RevertError::Io`] if the file cannot be read or decoded.
    pub fn load(state_dir: &Path) -> Result<Self, RevertError> {
        let path = state_dir.join(Self::FILE_NAME);
        let records = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| RevertError::io(&path, io::Error::from(e)))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(RevertError::io(&path, e)),
        };
        Ok(Self { path, records })
    }

    /// Write the ledger back to disk.
    ///
    /// # Errors
    ///
    /// Returns [`RevertError::Io`] if the file cannot be written.
    pub fn save(&self) -> Result<(), RevertError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| RevertError::io(parent, e))?;
        }
        let encoded = serde_json::to_vec_pretty(&self.records)
            .map_err(|e| RevertError::io(&self.path, io::Error::from(e)))?;
        fs::write(&self.path, encoded).map_err(|e| RevertError::io(&self.path, e))
    }

    /// All records, oldest first.
    #[must_use]
    pub fn records(&self) -> &[EnvironmentRecord] {
        &self.records
    }

    /// The environment currently materialized, if any.
    #[must_use]
    pub fn current(&self) -> Option<&EnvironmentRecord> {
        self.records.iter().rev().find(|r| r.applied)
    }

    /// Mark the environment applied as batch `revert_id` as no longer
    /// materialized. Returns whether a record matched.
    pub fn mark_reverted(&mut self, revert_id: u64) -> bool {
        let mut matched = false;
        for record in self
            .records
            .iter_mut()
            .filter(|r| r.applied && r.revert_id == revert_id)
        {
            record.applied = false;
            matched = true;
        }
        matched
    }

    /// Revert every applied environment, then run `apply` and record its
    /// batch as the applied environment `identifier`.
    ///
    /// Re-activating the environment that is already applied reverts it
    /// first, so its changes are rebuilt rather than stacked. A batch that no
    /// longer exists counts as already reverted.
    ///
    /// # Errors
    ///
    /// Returns the first revert error (the ledger keeps what succeeded) or
    /// the error returned by `apply`.
    pub fn activate<E>(
        &mut self,
        identifier: &str,
        store: &RevertStore,
        apply: impl FnOnce() -> Result<u64, E>,
    ) -> Result<u64, E>
    where
        E: From<RevertError>,
    {
        for index in 0..self.records.len() {
            let Some(record) = self.records.get(index).filter(|r| r.applied).cloned() else {
                continue;
            };
            match store.revert(record.revert_id) {
                Ok(_) | Err(RevertError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(record) = self.records.get_mut(index) {
                record.applied = false;
            }
            self.save()?;
        }

        let revert_id = apply()?;
        self.records.push(EnvironmentRecord {
            revert_id,
            identifier: identifier.to_string(),
            applied: true,
        });
        self.save()?;
        Ok(revert_id)
    }
}

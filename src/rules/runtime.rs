//! The interface between the engine and rule scripts.
//!
//! Scripts are run by a [`ScriptRuntime`], which receives a [`RuleApi`]
//! through which every effect of the script flows: filesystem writes land in
//! the session overlay, host queries go through the session executor and
//! nested rules go back through the engine.
use std::path::{Path, PathBuf};

use super::engine::{Engine, Request};
use super::history::RuleKey;
use super::manifest::RuleConfig;
use crate::error::{DaemonError, OverlayError, RuleError};
use crate::exec::ExecResult;
use crate::overlay::{Entry, FileType, KeyOptions};
use crate::system::{DaemonInfo, PackageInfo, query_daemon, query_package};

/// A rule script ready to run.
#[derive(Debug, Clone)]
pub struct RuleScript {
    /// The rule being evaluated.
    pub key: RuleKey,
    /// Script file.
    pub path: PathBuf,
    /// Script source.
    pub source: String,
    /// Manifest configuration of the rule.
    pub config: RuleConfig,
}

/// Executes rule scripts.
pub trait ScriptRuntime: Send + Sync {
    /// Run `script` and return whether the rule passed.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::ScriptFault`] if the script raises an error, or
    /// any error returned by `api` that the script chooses to propagate.
    fn execute(&self, script: &RuleScript, api: &RuleApi<'_>) -> Result<bool, RuleError>;
}

/// Capabilities handed to a running script.
pub struct RuleApi<'a> {
    engine: &'a Engine,
    request: &'a Request,
    script: &'a RuleScript,
}

impl std::fmt::Debug for RuleApi<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleApi")
            .field("rule", &self.script.key)
            .finish_non_exhaustive()
    }
}

impl<'a> RuleApi<'a> {
    pub(crate) const fn new(engine: &'a Engine, request: &'a Request, script: &'a RuleScript) -> Self {
        Self {
            engine,
            request,
            script,
        }
    }

    /// The rule this API belongs to.
    #[must_use]
    pub const fn rule(&self) -> &RuleKey {
        &self.script.key
    }

    /// Filesystem view backed by the session overlay.
    #[must_use]
    pub const fn fs(&self) -> RuleFs<'a> {
        RuleFs { engine: self.engine }
    }

    /// Query a service unit.
    ///
    /// # Errors
    ///
    /// See [`query_daemon`].
    pub fn daemon(&self, name: &str) -> Result<DaemonInfo, DaemonError> {
        let session = self.engine.session();
        query_daemon(
            session.executor.as_ref(),
            name,
            session.config.daemon_timeout(),
        )
    }

    /// Query an installed package.
    ///
    /// # Errors
    ///
    /// See [`query_package`].
    pub fn package(&self, name: &str) -> Result<Option<PackageInfo>, RuleError> {
        query_package(self.engine.session().executor.as_ref(), name)
    }

    /// Log an informational message tagged with the rule.
    pub fn info(&self, msg: &str) {
        self.engine.session().log.info(&format!("[{}] {msg}", self.script.key));
    }

    /// Log a debug message tagged with the rule.
    pub fn debug(&self, msg: &str) {
        self.engine.session().log.debug(&format!("[{}] {msg}", self.script.key));
    }

    /// Log a warning tagged with the rule.
    pub fn warn(&self, msg: &str) {
        self.engine.session().log.warn(&format!("[{}] {msg}", self.script.key));
    }

    /// Log an error tagged with the rule.
    pub fn error(&self, msg: &str) {
        self.engine.session().log.error(&format!("[{}] {msg}", self.script.key));
    }

    /// Evaluate `rule` from collection `identifier` as a dependency.
    ///
    /// A dependency that faults evaluates to `false`.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::CyclicDependency`] if the dependency is already
    /// being evaluated; the whole request fails in that case regardless of
    /// what the script does with the error. Resolution errors are returned
    /// as-is.
    pub fn require(&self, identifier: &str, rule: &str) -> Result<bool, RuleError> {
        self.engine.evaluate_nested(self.request, identifier, rule)
    }

    /// Evaluate another rule from the same collection.
    ///
    /// # Errors
    ///
    /// See [`require`](Self::require).
    pub fn require_local(&self, rule: &str) -> Result<bool, RuleError> {
        self.require(&self.script.key.collection, rule)
    }

    /// Run `command` with `sh -c`. Only rules declared `unsafe` may do this.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::UnsafeNotAllowed`] for other rules and
    /// [`RuleError::CommandFailed`] if the shell cannot be started.
    pub fn shell(&self, command: &str) -> Result<ExecResult, RuleError> {
        if !self.script.config.is_unsafe {
            return Err(RuleError::UnsafeNotAllowed {
                rule: self.script.key.to_string(),
            });
        }
        self.debug(&format!("shell: {command}"));
        self.engine
            .session()
            .executor
            .run_unchecked("sh", &["-c", command])
            .map_err(|e| RuleError::CommandFailed {
                command: command.to_string(),
                message: format!("{e:#}"),
            })
    }
}

/// Overlay-backed filesystem operations for scripts.
#[derive(Debug, Clone, Copy)]
pub struct RuleFs<'a> {
    engine: &'a Engine,
}

impl RuleFs<'_> {
    /// Whether `path` exists in the overlay or on disk.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::InvalidPath`] for relative paths.
    pub fn exists(&self, path: &Path) -> Result<bool, OverlayError> {
        self.engine.session().overlay().exists(path)
    }

    /// Contents of `path` with pending layers merged in.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::NotFound`] if it exists nowhere.
    pub fn read(&self, path: &Path) -> Result<String, OverlayError> {
        self.engine.session().overlay().read_to_string(path)
    }

    /// Directory entries of `path`, virtual and real.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::NotADirectory`] for files.
    pub fn read_dir(&self, path: &Path) -> Result<Vec<Entry>, OverlayError> {
        self.engine.session().overlay().list_directory(path)
    }

    /// Propose whole-file contents for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::InvalidPath`] for relative paths.
    pub fn write(&self, path: &Path, contents: &str, is_optional: bool) -> Result<(), OverlayError> {
        self.engine
            .session()
            .overlay()
            .write_file(path, contents.as_bytes(), is_optional)
    }

    /// Propose config keys for `path`, parsed according to its extension.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Format`] if `text` does not parse.
    pub fn write_config(
        &self,
        path: &Path,
        text: &str,
        key_options: Option<KeyOptions>,
        is_optional: bool,
    ) -> Result<(), OverlayError> {
        self.engine.session().overlay().write_config(
            path,
            text,
            FileType::from_path(path),
            key_options,
            is_optional,
        )
    }
}

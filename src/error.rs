//! Domain-specific error types for the spito engine.
//!
//! Internal modules return typed errors (e.g., [`OverlayError`], [`RuleError`])
//! while command handlers at the CLI boundary convert them to [`anyhow::Error`]
//! via the standard `?` operator.
//!
//! # Error hierarchy
//!
//! ```text
//! SpitoError
//! ├── Overlay(OverlayError): prototype storage, reads, merges
//! ├── Rule(RuleError)      : resolution, fetching, evaluation
//! ├── Apply(ApplyError)    : staging and committing the overlay
//! ├── Revert(RevertError)  : replaying a revert batch
//! └── Daemon(DaemonError)  : init-system queries
//! ```
//!
//! A rule that evaluates to `false` is *not* an error: every variant here is
//! distinguishable from a normal "did not pass" result.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the spito engine.
#[derive(Error, Debug)]
pub enum SpitoError {
    /// Overlay store or merge failure.
    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),

    /// Rule resolution or evaluation failure.
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Committing the overlay to the real filesystem failed.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Replaying a revert batch failed.
    #[error("Revert error: {0}")]
    Revert(#[from] RevertError),

    /// Daemon query failure.
    #[error("Daemon error: {0}")]
    Daemon(#[from] DaemonError),
}

/// Why a set of layers could not be folded into one result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// Two required text layers carry different content.
    #[error("layer {layer} conflicts with an earlier required layer")]
    LayerConflict {
        /// Insertion index of the offending layer.
        layer: usize,
    },

    /// Two required values disagree for the same key.
    #[error("conflicting required values for key '{key}'")]
    KeyConflict {
        /// Dotted path of the conflicting key.
        key: String,
    },

    /// Merging list values is not supported.
    #[error("cannot merge arrays at key '{key}'")]
    UnsupportedArray {
        /// Dotted path of the array-valued key.
        key: String,
    },

    /// A structured layer's root is not a key/value tree.
    #[error("layer {layer} is not a key/value tree")]
    NonTreeRoot {
        /// Insertion index of the offending layer.
        layer: usize,
    },

    /// Whole-file text and structured trees were written to the same path.
    #[error("cannot merge text content with structured content")]
    MixedContent,
}

/// Errors from the path overlay store.
#[derive(Error, Debug)]
pub enum OverlayError {
    /// Neither the overlay nor the real filesystem has this path.
    #[error("path not found: {}", path.display())]
    NotFound {
        /// Requested path.
        path: PathBuf,
    },

    /// The path is relative or contains `.`/`..` components.
    #[error("path must be absolute and normalized: {}", path.display())]
    InvalidPath {
        /// Rejected path.
        path: PathBuf,
    },

    /// A directory listing was requested for something that is not a directory.
    #[error("not a directory: {}", path.display())]
    NotADirectory {
        /// Requested path.
        path: PathBuf,
    },

    /// Required layers disagree.
    #[error("merge conflict in {}: {source}", path.display())]
    MergeConflict {
        /// Path whose layers conflict.
        path: PathBuf,
        /// The conflicting layer or key.
        source: MergeError,
    },

    /// The requested merge is not supported (arrays, mixed content).
    #[error("unsupported merge in {}: {source}", path.display())]
    UnsupportedMerge {
        /// Path whose layers cannot be merged.
        path: PathBuf,
        /// The unsupported construct.
        source: MergeError,
    },

    /// Config text could not be parsed or rendered in its format.
    #[error("invalid {format} content for {}: {message}", path.display())]
    Format {
        /// Path of the config file.
        path: PathBuf,
        /// Format name (`json`, `yaml`, `toml`).
        format: String,
        /// Parser or serializer message.
        message: String,
    },

    /// A persisted prototype descriptor could not be decoded.
    #[error("corrupt prototype {}: {message}", path.display())]
    Corrupt {
        /// Path of the descriptor file.
        path: PathBuf,
        /// Decoder message.
        message: String,
    },

    /// An I/O error occurred on the overlay or the real filesystem.
    #[error("IO error on {}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

impl OverlayError {
    /// Wrap an I/O error with the path that caused it.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify a [`MergeError`] for `path` as a conflict or an unsupported merge.
    #[must_use]
    pub fn from_merge(path: impl Into<PathBuf>, source: MergeError) -> Self {
        let path = path.into();
        match source {
            MergeError::UnsupportedArray { .. }
            | MergeError::NonTreeRoot { .. }
            | MergeError::MixedContent => Self::UnsupportedMerge { path, source },
            MergeError::LayerConflict { .. } | MergeError::KeyConflict { .. } => {
                Self::MergeConflict { path, source }
            }
        }
    }
}

/// Errors that arise while resolving or evaluating rules.
#[derive(Error, Debug)]
pub enum RuleError {
    /// A rule, script or collection does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing item.
        what: String,
    },

    /// The identifier cannot be turned into a collection URL.
    #[error("invalid rule identifier '{0}'")]
    InvalidIdentifier(String),

    /// A rule was requested while it was still being evaluated.
    #[error("cyclic rule dependency: {chain}")]
    CyclicDependency {
        /// The evaluation chain, e.g. `a -> b -> a`.
        chain: String,
    },

    /// Cloning, pulling or checking out a collection failed.
    #[error("failed to fetch {url}: {message}")]
    FetchFailure {
        /// Collection URL.
        url: String,
        /// Underlying git or I/O message.
        message: String,
    },

    /// A manifest or lockfile is missing or malformed.
    #[error("invalid manifest {}: {message}", path.display())]
    ManifestError {
        /// Manifest or lockfile path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// A rule script faulted or raised an error inside the runtime.
    #[error("rule '{rule}' faulted: {message}")]
    ScriptFault {
        /// Rule key.
        rule: String,
        /// Fault message.
        message: String,
    },

    /// A shell command was requested by a rule not declared unsafe.
    #[error("rule '{rule}' is not declared unsafe and cannot run shell commands")]
    UnsafeNotAllowed {
        /// Rule key.
        rule: String,
    },

    /// A shell command requested by an unsafe rule could not be run.
    #[error("command '{command}' failed: {message}")]
    CommandFailed {
        /// Command line.
        command: String,
        /// Failure message.
        message: String,
    },

    /// An overlay operation performed on behalf of a rule failed.
    #[error(transparent)]
    Overlay(#[from] OverlayError),

    /// Committing a passed rule's overlay failed.
    #[error(transparent)]
    Apply(#[from] ApplyError),

    /// Reverting a previously applied environment failed.
    #[error(transparent)]
    Revert(#[from] RevertError),
}

/// Errors from committing the overlay to the real filesystem.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// Reading or merging a prototype failed.
    #[error(transparent)]
    Overlay(#[from] OverlayError),

    /// A staged entry cannot replace the real entry (file vs directory).
    #[error("cannot replace {}: {reason}", path.display())]
    Conflict {
        /// Real path.
        path: PathBuf,
        /// Why the replacement is impossible.
        reason: String,
    },

    /// An I/O error occurred while staging, backing up or moving a file.
    #[error("IO error on {}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The commit stopped midway; the steps taken so far are in the batch.
    #[error("apply interrupted, partial changes recorded in revert batch {revert_id}: {source}")]
    Interrupted {
        /// Revert batch holding the steps performed before the failure.
        revert_id: u64,
        /// The failure that stopped the commit.
        source: Box<ApplyError>,
    },

    /// The revert batch could not be persisted.
    #[error(transparent)]
    Persist(#[from] RevertError),
}

impl ApplyError {
    /// Wrap an I/O error with the path that caused it.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from persisting or replaying revert batches.
#[derive(Error, Debug)]
pub enum RevertError {
    /// No batch with this id exists.
    #[error("revert batch {id} not found")]
    NotFound {
        /// Requested batch id.
        id: u64,
    },

    /// A batch file could not be decoded.
    #[error("corrupt revert batch {id}: {message}")]
    Corrupt {
        /// Batch id.
        id: u64,
        /// Decoder message.
        message: String,
    },

    /// A step could not be replayed; later steps were not attempted.
    #[error("revert step {index} ({step}) failed: {source}")]
    StepFailed {
        /// Position of the step in the batch.
        index: usize,
        /// Human-readable step description.
        step: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An I/O error occurred on the revert store.
    #[error("IO error on {}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

impl RevertError {
    /// Wrap an I/O error with the path that caused it.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from init-system daemon queries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DaemonError {
    /// The query needs elevated privileges.
    #[error("querying daemons requires root")]
    RequiresRoot,

    /// The host does not run a supported init system.
    #[error("unsupported init system")]
    UnsupportedInit,

    /// No unit with this name is known to the init system.
    #[error("daemon '{0}' not found")]
    DaemonNotFound(String),

    /// The init system answered with output that could not be interpreted.
    #[error("unexpected init system output: {0}")]
    UnexpectedOutput(String),

    /// The query did not finish in time.
    #[error("daemon query timed out after {secs}s")]
    Timeout {
        /// Timeout that elapsed.
        secs: u64,
    },

    /// The query command could not be started.
    #[error("failed to run daemon query: {0}")]
    Exec(String),
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::io;

    // -----------------------------------------------------------------------
    // OverlayError
    // -----------------------------------------------------------------------

    #[test]
    fn overlay_not_found_display() {
        let e = OverlayError::NotFound {
            path: PathBuf::from("/etc/hosts"),
        };
        assert_eq!(e.to_string(), "path not found: /etc/hosts");
    }

    #[test]
    fn overlay_from_merge_classifies_conflicts() {
        let e = OverlayError::from_merge("/etc/a.json", MergeError::KeyConflict { key: "a".into() });
        assert!(matches!(e, OverlayError::MergeConflict { .. }));
        assert!(e.to_string().contains("conflicting required values for key 'a'"));
    }

    #[test]
    fn overlay_from_merge_classifies_arrays_as_unsupported() {
        let e = OverlayError::from_merge(
            "/etc/a.json",
            MergeError::UnsupportedArray {
                key: "list".into(),
            },
        );
        assert!(matches!(e, OverlayError::UnsupportedMerge { .. }));
    }

    #[test]
    fn overlay_io_has_source() {
        use std::error::Error as StdError;
        let e = OverlayError::io("/etc/x", io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(e.source().is_some());
    }

    // -----------------------------------------------------------------------
    // MergeError
    // -----------------------------------------------------------------------

    #[test]
    fn merge_layer_conflict_names_index() {
        let e = MergeError::LayerConflict { layer: 3 };
        assert_eq!(e.to_string(), "layer 3 conflicts with an earlier required layer");
    }

    // -----------------------------------------------------------------------
    // RuleError
    // -----------------------------------------------------------------------

    #[test]
    fn rule_cycle_display() {
        let e = RuleError::CyclicDependency {
            chain: "a -> b -> a".to_string(),
        };
        assert_eq!(e.to_string(), "cyclic rule dependency: a -> b -> a");
    }

    #[test]
    fn rule_fetch_failure_display() {
        let e = RuleError::FetchFailure {
            url: "github.com/o/n".to_string(),
            message: "network unreachable".to_string(),
        };
        assert!(e.to_string().contains("github.com/o/n"));
        assert!(e.to_string().contains("network unreachable"));
    }

    #[test]
    fn rule_error_wraps_overlay_transparently() {
        let e: RuleError = OverlayError::NotFound {
            path: PathBuf::from("/x"),
        }
        .into();
        assert_eq!(e.to_string(), "path not found: /x");
    }

    // -----------------------------------------------------------------------
    // ApplyError / RevertError
    // -----------------------------------------------------------------------

    #[test]
    fn apply_interrupted_names_batch() {
        let e = ApplyError::Interrupted {
            revert_id: 7,
            source: Box::new(ApplyError::io(
                "/etc/x",
                io::Error::other("disk full"),
            )),
        };
        assert!(e.to_string().contains("revert batch 7"));
    }

    #[test]
    fn revert_step_failed_display() {
        let e = RevertError::StepFailed {
            index: 2,
            step: "remove /etc/x".to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(e.to_string().starts_with("revert step 2 (remove /etc/x) failed"));
    }

    // -----------------------------------------------------------------------
    // DaemonError
    // -----------------------------------------------------------------------

    #[test]
    fn daemon_not_found_display() {
        let e = DaemonError::DaemonNotFound("dbus".to_string());
        assert_eq!(e.to_string(), "daemon 'dbus' not found");
    }

    // -----------------------------------------------------------------------
    // SpitoError conversions
    // -----------------------------------------------------------------------

    #[test]
    fn spito_error_from_rule_error() {
        let e: SpitoError = RuleError::InvalidIdentifier("???".to_string()).into();
        assert!(e.to_string().contains("Rule error"));
    }

    #[test]
    fn spito_error_from_daemon_error() {
        let e: SpitoError = DaemonError::UnsupportedInit.into();
        assert!(e.to_string().contains("Daemon error"));
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn all_error_types_are_send_sync() {
        assert_send_sync::<SpitoError>();
        assert_send_sync::<OverlayError>();
        assert_send_sync::<RuleError>();
        assert_send_sync::<ApplyError>();
        assert_send_sync::<RevertError>();
        assert_send_sync::<DaemonError>();
    }

    #[test]
    fn rule_error_converts_to_anyhow() {
        let e = RuleError::UnsafeNotAllowed {
            rule: "r".to_string(),
        };
        let _anyhow_err: anyhow::Error = e.into();
    }
}

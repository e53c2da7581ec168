//! Structured logger with rule summary collection.
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use super::subscriber::STAGE_TARGET;
use super::types::{Log, RuleEntry, RuleStatus};
use super::utils::log_file_path;

/// Implement the display methods of [`Log`] by delegating to inherent methods
/// of the same name on the implementing type.
macro_rules! forward_log_methods {
    ($($method:ident),+ $(,)?) => {
        $(
            fn $method(&self, msg: &str) {
                self.$method(msg);
            }
        )+
    };
}

/// Structured logger with summary collection.
///
/// Messages go through [`tracing`]; the file layer installed by
/// [`init_subscriber`](super::subscriber::init_subscriber) persists them to
/// `$XDG_CACHE_HOME/spito/<command>.log`, whose path is shown in the summary.
#[derive(Debug)]
pub struct Logger {
    rules: Mutex<Vec<RuleEntry>>,
    log_file: Option<PathBuf>,
}

impl Logger {
    /// Create a logger for `command`.
    ///
    /// Only the log file path is computed here; the file itself is created by
    /// the subscriber's file layer.
    #[must_use]
    pub fn new(command: &str) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            log_file: log_file_path(command),
        }
    }

    /// Create a logger that is not associated with any log file.
    #[must_use]
    pub const fn detached() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            log_file: None,
        }
    }

    #[cfg(test)]
    pub(crate) const fn with_log_file(path: PathBuf) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            log_file: Some(path),
        }
    }

    /// Return the log file path, if available.
    #[must_use]
    pub const fn log_path(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }

    /// Return a clone of all recorded rule entries.
    #[must_use]
    pub fn rule_entries(&self) -> Vec<RuleEntry> {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Log an error message.
    pub fn error(&self, msg: &str) {
        tracing::error!("{msg}");
    }

    /// Log a warning message.
    pub fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
    }

    /// Log a stage header (major section).
    pub fn stage(&self, msg: &str) {
        tracing::info!(target: STAGE_TARGET, "{msg}");
    }

    /// Log an informational message.
    pub fn info(&self, msg: &str) {
        tracing::info!("{msg}");
    }

    /// Log a debug message (suppressed on console unless verbose).
    pub fn debug(&self, msg: &str) {
        tracing::debug!("{msg}");
    }

    /// Record a rule result for the summary.
    pub fn record_rule(&self, name: &str, status: RuleStatus, message: Option<&str>) {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RuleEntry {
                name: name.to_string(),
                status,
                message: message.map(String::from),
            });
    }

    /// Count the rules that errored.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.status == RuleStatus::Errored)
            .count()
    }

    /// Print the summary of all recorded rules.
    pub fn print_summary(&self) {
        let rules = self.rule_entries();
        if rules.is_empty() {
            return;
        }

        self.stage("Summary");

        let mut passed = 0u32;
        let mut not_passed = 0u32;
        let mut errored = 0u32;

        for rule in &rules {
            let (icon, color) = match rule.status {
                RuleStatus::Passed => {
                    passed += 1;
                    ("✓", "\x1b[32m")
                }
                RuleStatus::NotPassed => {
                    not_passed += 1;
                    ("○", "\x1b[33m")
                }
                RuleStatus::Errored => {
                    errored += 1;
                    ("✗", "\x1b[31m")
                }
            };

            let suffix = rule
                .message
                .as_ref()
                .map_or_else(String::new, |msg| format!(" ({msg})"));

            self.info(&format!("{color}{icon} {}{suffix}\x1b[0m", rule.name));
        }

        let total = passed + not_passed + errored;
        self.info(&format!(
            "{total} rules: \x1b[32m{passed} passed\x1b[0m, \x1b[33m{not_passed} did not pass\x1b[0m, \x1b[31m{errored} errored\x1b[0m"
        ));

        if let Some(path) = &self.log_file {
            self.info(&format!("\x1b[2mlog: {}\x1b[0m", path.display()));
        }
    }
}

impl Log for Logger {
    forward_log_methods!(stage, info, debug, warn, error);

    fn record_rule(&self, name: &str, status: RuleStatus, message: Option<&str>) {
        self.record_rule(name, status, message);
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::logging::isolated_logger;
    use std::fs;

    #[test]
    fn logger_starts_empty() {
        let (log, _tmp, _guard) = isolated_logger();
        assert!(log.rule_entries().is_empty());
    }

    #[test]
    fn record_rule_with_message() {
        let (log, _tmp, _guard) = isolated_logger();
        log.record_rule("github.com/o/n#r", RuleStatus::Passed, Some("revert batch 3"));
        let rules = log.rule_entries();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "github.com/o/n#r");
        assert_eq!(rules[0].message.as_deref(), Some("revert batch 3"));
    }

    #[test]
    fn error_count_only_counts_errored() {
        let (log, _tmp, _guard) = isolated_logger();
        log.record_rule("a", RuleStatus::Passed, None);
        log.record_rule("b", RuleStatus::NotPassed, None);
        log.record_rule("c", RuleStatus::Errored, Some("cycle"));
        assert_eq!(log.error_count(), 1);
    }

    #[test]
    fn log_trait_delegates_to_logger() {
        let (log, _tmp, _guard) = isolated_logger();
        let log_ref: &dyn Log = &log;
        log_ref.record_rule("via-trait", RuleStatus::Passed, None);
        assert_eq!(log.rule_entries().len(), 1);
    }

    #[test]
    fn detached_logger_has_no_path() {
        assert!(Logger::detached().log_path().is_none());
    }

    #[test]
    fn debug_always_written_to_file() {
        let (log, _tmp, _guard) = isolated_logger();
        let marker = format!("debug-marker-{}", std::process::id());
        log.debug(&marker);
        let contents = fs::read_to_string(log.log_path().expect("log path")).unwrap();
        assert!(contents.contains("[debug]"));
        assert!(contents.contains(&marker));
    }

    #[test]
    fn warn_written_to_file() {
        let (log, _tmp, _guard) = isolated_logger();
        log.warn("careful");
        let contents = fs::read_to_string(log.log_path().expect("log path")).unwrap();
        assert!(contents.contains("[warn] careful"));
    }

    #[test]
    fn stage_written_to_file_with_arrow() {
        let (log, _tmp, _guard) = isolated_logger();
        log.stage("Resolving");
        let contents = fs::read_to_string(log.log_path().expect("log path")).unwrap();
        assert!(contents.contains("==> Resolving"));
    }

    #[test]
    fn summary_is_written_without_ansi() {
        let (log, _tmp, _guard) = isolated_logger();
        log.record_rule("x#y", RuleStatus::NotPassed, None);
        log.print_summary();
        let contents = fs::read_to_string(log.log_path().expect("log path")).unwrap();
        assert!(contents.contains("1 rules: 0 passed, 1 did not pass, 0 errored"));
        assert!(!contents.contains('\x1b'));
    }
}

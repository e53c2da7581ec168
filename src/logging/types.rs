//! Core logging types: rule entries, status, and the [`Log`] trait.

/// Rule evaluation result for summary reporting.
#[derive(Debug, Clone)]
pub struct RuleEntry {
    /// Rule key, `collection#rule`.
    pub name: String,
    /// Final status of the rule.
    pub status: RuleStatus,
    /// Optional detail message (e.g., revert batch id or error description).
    pub message: Option<String>,
}

/// Outcome of a top-level rule request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleStatus {
    /// The rule evaluated to `true`.
    Passed,
    /// The rule evaluated to `false`.
    NotPassed,
    /// The rule faulted, hit a cycle, or could not be resolved.
    Errored,
}

/// Abstraction over logging backends.
///
/// [`Logger`](super::logger::Logger) is the production implementation;
/// library code holds an `Arc<dyn Log>` so tests can substitute their own.
pub trait Log: Send + Sync {
    /// Log a stage header (major section).
    fn stage(&self, msg: &str);
    /// Log an informational message.
    fn info(&self, msg: &str);
    /// Log a debug message (may be suppressed on console).
    fn debug(&self, msg: &str);
    /// Log a warning message.
    fn warn(&self, msg: &str);
    /// Log an error message.
    fn error(&self, msg: &str);
    /// Record a rule result for the summary.
    fn record_rule(&self, name: &str, status: RuleStatus, message: Option<&str>);
}

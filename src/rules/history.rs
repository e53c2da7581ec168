//! Evaluation history: memoization and cycle detection.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::error::RuleError;

/// A rule within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    /// Canonical collection identifier.
    pub collection: String,
    /// Rule name from the manifest.
    pub rule: String,
}

impl RuleKey {
    /// Build a key.
    #[must_use]
    pub fn new(collection: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            rule: rule.into(),
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.collection, self.rule)
    }
}

/// Where a rule is in its evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleState {
    /// Started and not finished; seeing it again means a cycle.
    InProgress,
    /// Finished with this result.
    Resolved(bool),
}

/// What [`RuleHistory::begin`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    /// The caller owns the evaluation and must call [`RuleHistory::finish`].
    Started,
    /// Already evaluated; reuse the result.
    Memoized(bool),
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<RuleKey, RuleState>,
    stack: Vec<RuleKey>,
}

/// Per-request record of rule states, shared by nested evaluations.
#[derive(Debug, Default)]
pub struct RuleHistory {
    inner: Mutex<Inner>,
}

impl RuleHistory {
    /// An empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` as in progress, or return its memoized result.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::CyclicDependency`] with the evaluation chain if
    /// `key` is already in progress.
    pub fn begin(&self, key: &RuleKey) -> Result<Begin, RuleError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.states.get(key).copied() {
            Some(RuleState::Resolved(passed)) => Ok(Begin::Memoized(passed)),
            Some(RuleState::InProgress) => {
                let start = inner.stack.iter().position(|k| k == key).unwrap_or(0);
                let chain = inner
                    .stack
                    .iter()
                    .skip(start)
                    .chain(std::iter::once(key))
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" -> ");
                Err(RuleError::CyclicDependency { chain })
            }
            None => {
                inner.states.insert(key.clone(), RuleState::InProgress);
                inner.stack.push(key.clone());
                Ok(Begin::Started)
            }
        }
    }

    /// Record the result of `key`.
    pub fn finish(&self, key: &RuleKey, passed: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.states.insert(key.clone(), RuleState::Resolved(passed));
        inner.stack.retain(|k| k != key);
    }

    /// Forget an evaluation that ended in an error so the chain stays accurate.
    pub fn abandon(&self, key: &RuleKey) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.states.remove(key);
        inner.stack.retain(|k| k != key);
    }

    /// Current state of `key`.
    #[must_use]
    pub fn state(&self, key: &RuleKey) -> Option<RuleState> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.states.get(key).copied()
    }
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

    #[test]
    fn key_display() {
        assert_eq!(RuleKey::new("github.com/o/n", "r").to_string(), "github.com/o/n#r");
    }

    #[test]
    fn finished_rules_are_memoized() {
        let history = RuleHistory::new();
        let key = RuleKey::new("c", "a");
        assert_eq!(history.begin(&key).unwrap(), Begin::Started);
        history.finish(&key, true);
        assert_eq!(history.begin(&key).unwrap(), Begin::Memoized(true));
        assert_eq!(history.state(&key), Some(RuleState::Resolved(true)));
    }

    #[test]
    fn reentry_reports_the_cycle() {
        let history = RuleHistory::new();
        let a = RuleKey::new("c", "a");
        let b = RuleKey::new("c", "b");
        history.begin(&a).unwrap();
        history.begin(&b).unwrap();
        let err = history.begin(&a).unwrap_err();
        match err {
            RuleError::CyclicDependency { chain } => assert_eq!(chain, "c#a -> c#b -> c#a"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn abandoned_rules_can_start_again() {
        let history = RuleHistory::new();
        let key = RuleKey::new("c", "a");
        history.begin(&key).unwrap();
        history.abandon(&key);
        assert!(history.state(&key).is_none());
        assert_eq!(history.begin(&key).unwrap(), Begin::Started);
    }
}

//! Rule collections: resolution and evaluation.
//!
//! - **[`identifier`]**: canonical `host/owner/name` identifiers
//! - **[`manifest`]** / **[`lock`]**: `spito-rules.yml` and `spito-lock.yml`
//! - **[`fetch`]** / **[`resolver`]**: cloning collections and flattening
//!   their dependencies
//! - **[`history`]** / **[`engine`]**: memoized evaluation with cycle
//!   detection
//! - **[`runtime`]**: the capabilities scripts receive
pub mod engine;
pub mod fetch;
pub mod history;
pub mod identifier;
pub mod lock;
pub mod manifest;
pub mod resolver;
pub mod runtime;

pub use engine::{ApplyOutcome, Engine};
pub use fetch::{Fetcher, GitFetcher};
pub use history::{RuleHistory, RuleKey, RuleState};
pub use identifier::{CollectionId, DependencySpec};
pub use lock::{DependencyLock, LockedDependency};
pub use manifest::{Manifest, RuleConfig};
pub use resolver::{Collection, Resolver};
pub use runtime::{RuleApi, RuleFs, RuleScript, ScriptRuntime};

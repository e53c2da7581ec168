//! Thin host adapters exposed to rule scripts.
//!
//! Each adapter runs one external program through an [`Executor`] and turns
//! its output into a typed value.
//!
//! [`Executor`]: crate::exec::Executor
pub mod daemon;
pub mod package;

pub use daemon::{DaemonInfo, query_daemon};
pub use package::{PackageInfo, query_package};

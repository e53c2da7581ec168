//! Virtual filesystem overlay.
//!
//! Rules never write to the real filesystem directly. Each write appends a
//! [`Layer`] to the [`PrototypeDescriptor`] of the target path; reads merge
//! those layers on demand (see [`merge`]) and fall through to the real file
//! when nothing is pending. [`crate::apply`] commits the merged result.
pub mod format;
pub mod merge;
pub mod prototype;
pub mod store;

pub use merge::merge_layers;
pub use prototype::{FileType, KeyOption, KeyOptions, Layer, LayerContent, PrototypeDescriptor};
pub use store::{Entry, EntryKind, OverlayStore, Resolved};

//! kapply core types: cluster objects, references, change sets and the
//! store seams the reconciler is written against.

#![forbid(unsafe_code)]

pub mod changeset;
pub mod object;
pub mod store;

pub use changeset::{Action, ChangeSet, ChangeSetEntry};
pub use object::{Object, ObjectError, ObjectRef};
pub use store::{ApplyOptions, ObjectStore, RecordStore, StoreError};

/// Annotation that opts a live object out of garbage collection.
pub const PRUNE_ANNOTATION: &str = "kapply.io/prune";
/// Value of [`PRUNE_ANNOTATION`] that disables pruning.
pub const PRUNE_DISABLED: &str = "disabled";

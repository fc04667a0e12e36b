//! Store seams. The reconciler only talks to these traits; the kube client,
//! SQLite and in-memory backends live in their own crates.

use crate::{Object, ObjectRef};

/// Errors surfaced by a backing store, classified the way callers branch on them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("field is immutable: {0}")]
    Immutable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_immutable(&self) -> bool { matches!(self, StoreError::Immutable(_)) }
}

/// Parameters for a single apply request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Compute the result without persisting it.
    pub dry_run: bool,
}

impl ApplyOptions {
    pub fn dry_run() -> Self { Self { dry_run: true } }
    pub fn persist() -> Self { Self { dry_run: false } }
}

/// Key-addressed object store with server-side merge semantics.
///
/// `apply` must use the same merge and ownership rules for dry-run and real
/// requests, and must reject stale concurrency tokens with `Conflict`.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Live copy of the object, `None` when it does not exist.
    async fn get(&self, reference: &ObjectRef) -> Result<Option<Object>, StoreError>;

    /// Apply `object` and return what the store holds (or would hold) afterwards.
    async fn apply(&self, object: &Object, opts: ApplyOptions) -> Result<Object, StoreError>;

    /// Delete the object. Missing objects yield `StoreError::NotFound`.
    async fn delete(&self, reference: &ObjectRef) -> Result<(), StoreError>;
}

/// Durable store of single named, namespaced blobs with whole-record overwrite.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, name: &str, namespace: &str) -> Result<Option<String>, StoreError>;
    async fn put_record(&self, name: &str, namespace: &str, blob: &str) -> Result<(), StoreError>;
    async fn delete_record(&self, name: &str, namespace: &str) -> Result<(), StoreError>;
}

use std::fmt;

use kapply_core::ObjectRef;

/// Failure to apply (or diff) a single object. Every variant leads with the
/// object identity; secret values never appear in `detail`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("{subject} namespace not specified, error: {detail}")]
    NamespaceNotSpecified { subject: String, detail: String },
    #[error("{subject} is invalid, error: {detail}")]
    Validation { subject: String, detail: String },
    #[error("{subject} immutable field changed (use force to recreate), error: {detail}")]
    Conflict { subject: String, detail: String },
    #[error("{subject} apply failed, error: {detail}")]
    Apply { subject: String, detail: String },
    #[error("{subject} recreate failed, error: {detail}")]
    Recreate { subject: String, detail: String },
}

impl ApplyError {
    pub fn subject(&self) -> &str {
        match self {
            ApplyError::NamespaceNotSpecified { subject, .. }
            | ApplyError::Validation { subject, .. }
            | ApplyError::Conflict { subject, .. }
            | ApplyError::Apply { subject, .. }
            | ApplyError::Recreate { subject, .. } => subject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub object: ObjectRef,
    pub detail: String,
}

impl fmt::Display for DeleteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} delete failed, error: {}", self.object, self.detail)
    }
}

/// Per-object deletion failures collected across a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} object(s) failed to delete: {}", .failures.len(), join(.failures))]
pub struct DeleteError {
    pub failures: Vec<DeleteFailure>,
}

/// An object that had not reached the target state when the wait ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingObject {
    pub object: ObjectRef,
    /// Last observed status, e.g. `updated 1/3`.
    pub status: String,
}

impl fmt::Display for PendingObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.object, self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("timeout waiting for: [{}]", join(.pending))]
pub struct WaitTimeoutError {
    pub pending: Vec<PendingObject>,
}

impl WaitTimeoutError {
    pub fn is_pending(&self, r: &ObjectRef) -> bool {
        self.pending.iter().any(|p| p.object.same_object(r))
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

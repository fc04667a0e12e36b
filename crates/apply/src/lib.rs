//! kapply resource manager: dry-run server-side apply with drift detection,
//! masked diffs, forced recreate, pruning deletes and readiness waits.

#![forbid(unsafe_code)]

pub mod diff;
pub mod drift;
mod error;
mod manager;
pub mod manifest;
pub mod mask;
pub mod readiness;
mod wait;

pub use diff::{DiffRenderer, DiffSummary, YamlDiff};
pub use drift::{deep_derivative, has_drifted};
pub use error::{ApplyError, DeleteError, DeleteFailure, PendingObject, WaitTimeoutError};
pub use manager::{DeleteOutcome, ManagerOptions, ResourceManager};
pub use manifest::{parse_manifests, sort_for_apply, ManifestError, ManifestLimits};
pub use readiness::Readiness;

use std::sync::Arc;
use std::time::{Duration, Instant};

use kapply_core::{
    Action, ApplyOptions, ChangeSet, ChangeSetEntry, Object, ObjectRef, ObjectStore, StoreError, PRUNE_ANNOTATION,
    PRUNE_DISABLED,
};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::diff::{diff_summary, strip_managed_fields, DiffRenderer, YamlDiff};
use crate::drift::has_drifted;
use crate::error::{ApplyError, DeleteError, DeleteFailure};
use crate::mask::{mask_secret, redact, DESIRED_MASK, EXISTING_MASK};

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default))
}

fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default))
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Upper bound on waiting for a deleted object to disappear during a forced recreate.
    pub recreate_timeout: Duration,
    pub recreate_poll_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self { recreate_timeout: Duration::from_secs(60), recreate_poll_interval: Duration::from_millis(500) }
    }
}

impl ManagerOptions {
    /// `KAPPLY_RECREATE_TIMEOUT_SECS` (default 60), `KAPPLY_RECREATE_POLL_MS` (default 500).
    pub fn from_env() -> Self {
        Self {
            recreate_timeout: env_secs("KAPPLY_RECREATE_TIMEOUT_SECS", 60),
            recreate_poll_interval: env_millis("KAPPLY_RECREATE_POLL_MS", 500),
        }
    }
}

/// Result of [`ResourceManager::delete_all`]: the entries for every object
/// plus the aggregated failures, if any.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct DeleteOutcome {
    pub change_set: ChangeSet,
    pub error: Option<DeleteError>,
}

impl DeleteOutcome {
    pub fn into_result(self) -> Result<ChangeSet, DeleteError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.change_set),
        }
    }
}

/// Reconciles objects against an [`ObjectStore`].
pub struct ResourceManager {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) opts: ManagerOptions,
    renderer: Arc<dyn DiffRenderer>,
}

impl ResourceManager {
    pub fn new(store: Arc<dyn ObjectStore>, opts: ManagerOptions) -> Self {
        Self { store, opts, renderer: Arc::new(YamlDiff::default()) }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn DiffRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn options(&self) -> &ManagerOptions { &self.opts }

    /// Server-side apply `object` when it would change the live state.
    ///
    /// The dry-run result decides the action: no resourceVersion means
    /// `Created`, drift means `Configured` (with a diff), otherwise
    /// `Unchanged` and nothing is written. With `force`, an immutable-field
    /// rejection deletes and recreates the object.
    pub async fn apply(&self, object: &Object, force: bool) -> Result<ChangeSetEntry, ApplyError> {
        let t0 = Instant::now();
        counter!("apply_attempts", 1u64);
        let res = self.apply_inner(object, force).await;
        match &res {
            Ok(entry) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("apply_ok", 1u64);
                info!(object = %entry.object(), action = %entry.action(), "applied");
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(object = %e.subject(), error = %e, "apply failed");
            }
        }
        res
    }

    async fn apply_inner(&self, object: &Object, force: bool) -> Result<ChangeSetEntry, ApplyError> {
        let r = identify(object)?;
        let existing = self.fetch(object, &r).await?;
        let dry_run = match self.store.apply(object, ApplyOptions::dry_run()).await {
            Ok(o) => o,
            Err(e) if e.is_immutable() && force => return self.recreate(object, &r).await,
            Err(e) => return Err(validation_error(object, &r, e)),
        };

        let entry = self.classify(object, &r, existing, &dry_run);
        if matches!(entry.action(), Action::Created | Action::Configured) {
            self.store
                .apply(object, ApplyOptions::persist())
                .await
                .map_err(|e| ApplyError::Apply { subject: r.to_string(), detail: redact(&e.to_string(), object) })?;
        }
        Ok(entry)
    }

    /// Same classification as [`apply`](Self::apply) without writing anything.
    pub async fn diff(&self, object: &Object) -> Result<ChangeSetEntry, ApplyError> {
        let r = identify(object)?;
        let existing = self.fetch(object, &r).await?;
        let dry_run = self
            .store
            .apply(object, ApplyOptions::dry_run())
            .await
            .map_err(|e| validation_error(object, &r, e))?;
        let entry = self.classify(object, &r, existing, &dry_run);
        debug!(object = %r, action = %entry.action(), "diffed");
        Ok(entry)
    }

    /// Apply each object in order; the first failure stops the batch.
    pub async fn apply_all(&self, objects: &[Object], force: bool) -> Result<ChangeSet, ApplyError> {
        let mut cs = ChangeSet::new();
        for object in objects {
            cs.add(self.apply(object, force).await?);
        }
        Ok(cs)
    }

    /// Diff each object in order; the first failure stops the batch.
    pub async fn diff_all(&self, objects: &[Object]) -> Result<ChangeSet, ApplyError> {
        let mut cs = ChangeSet::new();
        for object in objects {
            cs.add(self.diff(object).await?);
        }
        Ok(cs)
    }

    async fn fetch(&self, object: &Object, r: &ObjectRef) -> Result<Option<Object>, ApplyError> {
        match self.store.get(r).await {
            Ok(found) => Ok(found),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(ApplyError::Apply { subject: r.to_string(), detail: redact(&e.to_string(), object) }),
        }
    }

    fn classify(&self, desired: &Object, r: &ObjectRef, existing: Option<Object>, dry_run: &Object) -> ChangeSetEntry {
        if dry_run.resource_version().is_none() {
            return ChangeSetEntry::new(r.clone(), Action::Created);
        }
        let existing = existing.unwrap_or_else(|| desired.clone());
        if !has_drifted(&existing, dry_run) {
            return ChangeSetEntry::new(r.clone(), Action::Unchanged);
        }

        let before = strip_managed_fields(&existing);
        let after = strip_managed_fields(dry_run);
        let summary = diff_summary(after.as_value(), before.as_value());
        debug!(object = %r, adds = summary.adds, updates = summary.updates, removes = summary.removes, "drift detected");
        let (before, after) = if dry_run.is_secret() {
            (mask_secret(&before, EXISTING_MASK), mask_secret(&after, DESIRED_MASK))
        } else {
            (before, after)
        };
        ChangeSetEntry::with_diff(r.clone(), Action::Configured, self.renderer.render(&before, &after))
    }

    async fn recreate(&self, object: &Object, r: &ObjectRef) -> Result<ChangeSetEntry, ApplyError> {
        warn!(object = %r, "immutable field changed; recreating");
        let failed = |detail: String| ApplyError::Recreate { subject: r.to_string(), detail: redact(&detail, object) };
        match self.store.delete(r).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(failed(e.to_string())),
        }
        self.wait_for_termination(
            std::slice::from_ref(r),
            self.opts.recreate_poll_interval,
            self.opts.recreate_timeout,
        )
        .await
        .map_err(|e| failed(e.to_string()))?;
        self.store.apply(object, ApplyOptions::persist()).await.map_err(|e| failed(e.to_string()))?;
        Ok(ChangeSetEntry::new(r.clone(), Action::Created))
    }

    /// Delete `object`. Already-gone objects count as deleted; objects
    /// annotated `kapply.io/prune: disabled` are skipped.
    pub async fn delete(&self, r: &ObjectRef) -> Result<ChangeSetEntry, DeleteFailure> {
        let fail = |e: StoreError| DeleteFailure { object: r.clone(), detail: e.to_string() };
        let live = match self.store.get(r).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(fail(e)),
        };
        let Some(live) = live else {
            debug!(object = %r, "already deleted");
            return Ok(ChangeSetEntry::new(r.clone(), Action::Deleted));
        };
        if live.annotation(PRUNE_ANNOTATION) == Some(PRUNE_DISABLED) {
            info!(object = %r, "deletion disabled by annotation");
            return Ok(ChangeSetEntry::new(r.clone(), Action::Skipped));
        }
        match self.store.delete(r).await {
            Ok(()) => Ok(ChangeSetEntry::new(r.clone(), Action::Deleted)),
            Err(e) if e.is_not_found() => Ok(ChangeSetEntry::new(r.clone(), Action::Deleted)),
            Err(e) => Err(fail(e)),
        }
    }

    /// Delete every object in order. Failures do not stop the batch; each is
    /// recorded as a `Failed` entry and collected into the outcome's error.
    pub async fn delete_all(&self, objects: &[ObjectRef]) -> DeleteOutcome {
        let mut change_set = ChangeSet::new();
        let mut failures = Vec::new();
        for r in objects {
            match self.delete(r).await {
                Ok(entry) => {
                    counter!("delete_ok", 1u64);
                    info!(object = %r, action = %entry.action(), "delete");
                    change_set.add(entry);
                }
                Err(f) => {
                    counter!("delete_err", 1u64);
                    warn!(object = %r, error = %f.detail, "delete failed");
                    change_set.add(ChangeSetEntry::new(r.clone(), Action::Failed));
                    failures.push(f);
                }
            }
        }
        let error = if failures.is_empty() { None } else { Some(DeleteError { failures }) };
        DeleteOutcome { change_set, error }
    }
}

fn identify(object: &Object) -> Result<ObjectRef, ApplyError> {
    object
        .object_ref()
        .map_err(|e| ApplyError::Validation { subject: object.to_string(), detail: e.to_string() })
}

/// Error for a rejected dry-run. Secret values are never echoed back.
fn validation_error(object: &Object, r: &ObjectRef, e: StoreError) -> ApplyError {
    let subject = r.to_string();
    let detail = redact(&e.to_string(), object);
    match e {
        StoreError::NotFound(_) => ApplyError::NamespaceNotSpecified { subject, detail },
        StoreError::Immutable(_) => ApplyError::Conflict { subject, detail },
        StoreError::Invalid(_) if object.is_secret() => {
            ApplyError::Validation { subject, detail: "data values must be of type string".into() }
        }
        StoreError::Invalid(_) => ApplyError::Validation { subject, detail },
        StoreError::Conflict(_) | StoreError::Backend(_) => ApplyError::Apply { subject, detail },
    }
}

//! The apply/prune/wait and delete flows behind `kapplyctl`.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use kapply_apply::manifest::kind_rank;
use kapply_apply::ResourceManager;
use kapply_core::{Action, ChangeSet, Object, ObjectRef};
use kapply_inventory::InventoryManager;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct InventoryKey {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub force: bool,
    pub prune: bool,
    pub wait: bool,
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub applied: ChangeSet,
    pub pruned: ChangeSet,
}

/// Stable sort into deletion order: dependents before the namespaces and
/// definitions they live in.
pub fn sort_for_delete(refs: &mut [ObjectRef]) {
    refs.sort_by_key(|r| std::cmp::Reverse(kind_rank(&r.kind)));
}

fn deleted(cs: &ChangeSet) -> Vec<ObjectRef> {
    cs.iter().filter(|e| e.action() == Action::Deleted).map(|e| e.object().clone()).collect()
}

/// Record the desired set, apply it, store the new inventory, prune what the
/// previous inventory held that is no longer desired, then optionally wait.
///
/// The report is returned alongside any error so callers can still print what
/// was changed before the failure.
pub async fn apply_run(
    mgr: &ResourceManager,
    inventory: &InventoryManager,
    key: &InventoryKey,
    objects: &[Object],
    opts: &RunOptions,
) -> (RunReport, Result<()>) {
    let mut report = RunReport::default();
    let mut record = match inventory.record(objects) {
        Ok(r) => r,
        Err(e) => return (report, Err(e.into())),
    };

    match mgr.apply_all(objects, opts.force).await {
        Ok(cs) => report.applied = cs,
        Err(e) => return (report, Err(anyhow!(e))),
    }

    let mut stale = match inventory.get_stale_objects(&record, &key.name, &key.namespace).await {
        Ok(s) => s,
        Err(e) => return (report, Err(anyhow!(e))),
    };
    if let Err(e) = inventory.store(&record, &key.name, &key.namespace).await {
        return (report, Err(anyhow!(e)));
    }

    if opts.prune && !stale.is_empty() {
        sort_for_delete(&mut stale);
        let outcome = mgr.delete_all(&stale).await;
        report.pruned = outcome.change_set;
        if let Some(err) = outcome.error {
            // Objects that could not be pruned stay owned so a later run retries them.
            for f in &err.failures {
                record.add_object(&f.object);
            }
            if let Err(e) = inventory.store(&record, &key.name, &key.namespace).await {
                warn!(error = %e, "failed to keep unpruned objects in the inventory");
            }
            return (report, Err(anyhow!(err).context("pruning stale objects")));
        }
    } else if !stale.is_empty() {
        info!(stale = stale.len(), "pruning disabled; stale objects left in place");
    }

    if opts.wait {
        let applied: Vec<ObjectRef> = report.applied.iter().map(|e| e.object().clone()).collect();
        if let Err(e) = mgr.wait(&applied, opts.interval, opts.timeout).await {
            return (report, Err(anyhow!(e)));
        }
        let gone = deleted(&report.pruned);
        if let Err(e) = mgr.wait_for_termination(&gone, opts.interval, opts.timeout).await {
            return (report, Err(anyhow!(e)));
        }
    }
    (report, Ok(()))
}

/// Delete everything the stored inventory lists, then the inventory itself.
/// The record is kept when any deletion fails so a retry sees the same set.
pub async fn delete_run(
    mgr: &ResourceManager,
    inventory: &InventoryManager,
    key: &InventoryKey,
    opts: &RunOptions,
) -> (ChangeSet, Result<()>) {
    let stored = match inventory.load(&key.name, &key.namespace).await {
        Ok(Some(inv)) => inv,
        Ok(None) => {
            return (ChangeSet::new(), Err(anyhow!("inventory {}/{} not found", key.namespace, key.name)));
        }
        Err(e) => return (ChangeSet::new(), Err(anyhow!(e))),
    };
    let mut refs = match stored.references() {
        Ok(r) => r,
        Err(e) => return (ChangeSet::new(), Err(anyhow!(e))),
    };
    sort_for_delete(&mut refs);

    let outcome = mgr.delete_all(&refs).await;
    if let Some(err) = outcome.error {
        warn!(failures = err.failures.len(), "inventory kept; some objects could not be deleted");
        return (outcome.change_set, Err(anyhow!(err)));
    }
    let cs = outcome.change_set;

    if opts.wait {
        if let Err(e) = mgr.wait_for_termination(&deleted(&cs), opts.interval, opts.timeout).await {
            return (cs, Err(anyhow!(e)));
        }
    }
    let res = inventory
        .delete(&key.name, &key.namespace)
        .await
        .with_context(|| format!("deleting inventory {}/{}", key.namespace, key.name));
    (cs, res)
}

/// Classify every object without writing anything.
pub async fn diff_run(mgr: &ResourceManager, objects: &[Object]) -> Result<ChangeSet> {
    Ok(mgr.diff_all(objects).await?)
}

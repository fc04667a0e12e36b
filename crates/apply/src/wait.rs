use std::time::{Duration, Instant};

use futures::future::join_all;
use kapply_core::ObjectRef;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::error::{PendingObject, WaitTimeoutError};
use crate::readiness::{evaluate, Readiness};
use crate::ResourceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Ready,
    Gone,
}

impl ResourceManager {
    /// Poll every `interval` until all objects are ready or `timeout` elapses.
    /// Failed objects keep being polled; they are reported if the wait times out.
    pub async fn wait(&self, objects: &[ObjectRef], interval: Duration, timeout: Duration) -> Result<(), WaitTimeoutError> {
        self.poll(objects, interval, timeout, Target::Ready).await
    }

    /// Poll until none of the objects can be found any more.
    pub async fn wait_for_termination(
        &self,
        objects: &[ObjectRef],
        interval: Duration,
        timeout: Duration,
    ) -> Result<(), WaitTimeoutError> {
        self.poll(objects, interval, timeout, Target::Gone).await
    }

    async fn poll(
        &self,
        objects: &[ObjectRef],
        interval: Duration,
        timeout: Duration,
        target: Target,
    ) -> Result<(), WaitTimeoutError> {
        // None: the timeout is too large to represent, poll until done
        let deadline = Instant::now().checked_add(timeout);
        let mut pending: Vec<PendingObject> = Vec::with_capacity(objects.len());
        for r in objects {
            if !pending.iter().any(|p| p.object.same_object(r)) {
                pending.push(PendingObject { object: r.clone(), status: "not checked".into() });
            }
        }

        while !pending.is_empty() {
            let checks = join_all(pending.iter().map(|p| self.check(&p.object, target)));
            let states = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let Ok(states) = tokio::time::timeout(remaining, checks).await else {
                        break;
                    };
                    states
                }
                None => checks.await,
            };
            pending = pending
                .into_iter()
                .zip(states)
                .filter_map(|(mut p, state)| match state {
                    Readiness::Ready => None,
                    other => {
                        if let Readiness::Failed(msg) = &other {
                            warn!(object = %p.object, reason = %msg, "object reports failure");
                        }
                        p.status = other.to_string();
                        Some(p)
                    }
                })
                .collect();
            if pending.is_empty() {
                break;
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    interval.min(deadline - now)
                }
                None => interval,
            };
            debug!(pending = pending.len(), ?target, "waiting");
            tokio::time::sleep(pause).await;
        }

        if pending.is_empty() {
            info!(objects = objects.len(), ?target, "wait complete");
            return Ok(());
        }
        counter!("wait_timeouts", 1u64);
        Err(WaitTimeoutError { pending })
    }

    async fn check(&self, r: &ObjectRef, target: Target) -> Readiness {
        match (self.store.get(r).await, target) {
            (Ok(None), Target::Gone) => Readiness::Ready,
            (Ok(None), Target::Ready) => Readiness::InProgress("not found".into()),
            (Ok(Some(live)), Target::Ready) => evaluate(&live),
            (Ok(Some(live)), Target::Gone) => {
                if live.get_path(&["metadata", "deletionTimestamp"]).is_some() {
                    Readiness::InProgress("terminating".into())
                } else {
                    Readiness::InProgress("still exists".into())
                }
            }
            (Err(e), Target::Gone) if e.is_not_found() => Readiness::Ready,
            (Err(e), _) => Readiness::InProgress(format!("get failed: {}", e)),
        }
    }
}

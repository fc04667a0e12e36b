//! Per-kind readiness evaluation used by [`crate::ResourceManager::wait`].

use std::fmt;

use kapply_core::Object;
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    InProgress(String),
    /// The object reported a failure; waits keep polling until they time out.
    Failed(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool { matches!(self, Readiness::Ready) }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => f.write_str("ready"),
            Readiness::InProgress(msg) => f.write_str(msg),
            Readiness::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

type Path = &'static [&'static str];

enum Check {
    /// Controller caught up with the latest generation and every counter
    /// reached the desired replica count.
    Replicas { desired: Path, default_desired: i64, counters: &'static [Path] },
    /// `status.conditions[type]` is True; `failed` names a condition that
    /// signals a terminal failure when True.
    Condition { kind: &'static str, failed: Option<&'static str> },
    Phase { ready: &'static [&'static str], failed: &'static [&'static str] },
}

struct Rule {
    group: &'static str,
    kind: &'static str,
    check: Check,
}

const SPEC_REPLICAS: Path = &["spec", "replicas"];

const RULES: &[Rule] = &[
    Rule {
        group: "apps",
        kind: "Deployment",
        check: Check::Replicas {
            desired: SPEC_REPLICAS,
            default_desired: 1,
            counters: &[&["status", "updatedReplicas"], &["status", "availableReplicas"]],
        },
    },
    Rule {
        group: "apps",
        kind: "StatefulSet",
        check: Check::Replicas {
            desired: SPEC_REPLICAS,
            default_desired: 1,
            counters: &[&["status", "readyReplicas"], &["status", "updatedReplicas"]],
        },
    },
    Rule {
        group: "apps",
        kind: "ReplicaSet",
        check: Check::Replicas {
            desired: SPEC_REPLICAS,
            default_desired: 1,
            counters: &[&["status", "readyReplicas"], &["status", "availableReplicas"]],
        },
    },
    Rule {
        group: "apps",
        kind: "DaemonSet",
        check: Check::Replicas {
            desired: &["status", "desiredNumberScheduled"],
            default_desired: 0,
            counters: &[&["status", "numberReady"], &["status", "updatedNumberScheduled"]],
        },
    },
    Rule { group: "batch", kind: "Job", check: Check::Condition { kind: "Complete", failed: Some("Failed") } },
    Rule { group: "", kind: "Pod", check: Check::Phase { ready: &["Running", "Succeeded"], failed: &["Failed"] } },
    Rule { group: "", kind: "PersistentVolumeClaim", check: Check::Phase { ready: &["Bound"], failed: &["Lost"] } },
    Rule { group: "", kind: "Namespace", check: Check::Phase { ready: &["Active"], failed: &[] } },
    Rule {
        group: "apiextensions.k8s.io",
        kind: "CustomResourceDefinition",
        check: Check::Condition { kind: "Established", failed: None },
    },
];

/// Readiness of a live object. Kinds without a rule are ready once they exist,
/// unless they publish a `Ready` condition.
pub fn evaluate(object: &Object) -> Readiness {
    if object.get_path(&["metadata", "deletionTimestamp"]).is_some() {
        return Readiness::InProgress("terminating".into());
    }
    let group = object.api_version().rsplit_once('/').map(|(g, _)| g).unwrap_or("");
    match RULES.iter().find(|r| r.group == group && r.kind == object.kind()) {
        Some(rule) => run(&rule.check, object),
        None => generic(object),
    }
}

fn run(check: &Check, object: &Object) -> Readiness {
    match check {
        Check::Replicas { desired, default_desired, counters } => {
            if object.field("status").is_none() {
                return Readiness::InProgress("waiting for status".into());
            }
            let generation = object.generation().unwrap_or(0);
            let observed = object.i64_at(&["status", "observedGeneration"]).unwrap_or(0);
            if observed < generation {
                return Readiness::InProgress(format!("observed generation {} < {}", observed, generation));
            }
            let want = object.i64_at(desired).unwrap_or(*default_desired);
            for counter in counters.iter() {
                let have = object.i64_at(counter).unwrap_or(0);
                if have < want {
                    let label = counter.last().copied().unwrap_or("replicas");
                    return Readiness::InProgress(format!("{} {}/{}", label, have, want));
                }
            }
            Readiness::Ready
        }
        Check::Condition { kind, failed } => {
            if let Some(f) = failed {
                if let Some(c) = condition(object, f).filter(|c| is_true(c)) {
                    return Readiness::Failed(message(c, f));
                }
            }
            match condition(object, kind) {
                Some(c) if is_true(c) => Readiness::Ready,
                Some(c) => Readiness::InProgress(message(c, kind)),
                None => Readiness::InProgress(format!("waiting for {} condition", kind)),
            }
        }
        Check::Phase { ready, failed } => match object.str_at(&["status", "phase"]) {
            Some(p) if ready.contains(&p) => Readiness::Ready,
            Some(p) if failed.contains(&p) => Readiness::Failed(format!("phase {}", p)),
            Some(p) => Readiness::InProgress(format!("phase {}", p)),
            None => Readiness::InProgress("waiting for phase".into()),
        },
    }
}

fn generic(object: &Object) -> Readiness {
    match condition(object, "Ready") {
        Some(c) if is_true(c) => Readiness::Ready,
        Some(c) => Readiness::InProgress(message(c, "Ready")),
        None => Readiness::Ready,
    }
}

fn condition<'a>(object: &'a Object, kind: &str) -> Option<&'a Json> {
    object
        .get_path(&["status", "conditions"])?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(kind))
}

fn is_true(c: &Json) -> bool {
    c.get("status").and_then(|s| s.as_str()) == Some("True")
}

fn message(c: &Json, kind: &str) -> String {
    let text = c.get("message").or_else(|| c.get("reason")).and_then(|m| m.as_str()).unwrap_or("");
    if text.is_empty() {
        format!("{} not true", kind)
    } else {
        format!("{}: {}", kind, text)
    }
}

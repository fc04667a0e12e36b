//! Change-set model: one outcome per reconciled object, kept in processing order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ObjectRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Configured,
    Unchanged,
    Skipped,
    Deleted,
    Failed,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Configured => "configured",
            Action::Unchanged => "unchanged",
            Action::Skipped => "skipped",
            Action::Deleted => "deleted",
            Action::Failed => "failed",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Outcome of reconciling a single object. Fixed once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetEntry {
    subject: String,
    object: ObjectRef,
    action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diff: Option<String>,
}

impl ChangeSetEntry {
    pub fn new(object: ObjectRef, action: Action) -> Self {
        Self { subject: object.to_string(), object, action, diff: None }
    }

    pub fn with_diff(object: ObjectRef, action: Action, diff: String) -> Self {
        Self { subject: object.to_string(), object, action, diff: Some(diff) }
    }

    /// Human identity, `Kind/namespace/name`.
    pub fn subject(&self) -> &str { &self.subject }
    pub fn object(&self) -> &ObjectRef { &self.object }
    pub fn action(&self) -> Action { self.action }
    pub fn diff(&self) -> Option<&str> { self.diff.as_deref() }
}

impl fmt::Display for ChangeSetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.subject, self.action)
    }
}

/// Ordered entries produced by one operation (apply or delete).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub entries: Vec<ChangeSetEntry>,
}

impl ChangeSet {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, entry: ChangeSetEntry) { self.entries.push(entry); }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangeSetEntry> { self.entries.iter() }

    pub fn count(&self, action: Action) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// True when any entry changed cluster state.
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|e| matches!(e.action, Action::Created | Action::Configured | Action::Deleted))
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.entries {
            writeln!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a ChangeSetEntry;
    type IntoIter = std::slice::Iter<'a, ChangeSetEntry>;
    fn into_iter(self) -> Self::IntoIter { self.entries.iter() }
}

impl IntoIterator for ChangeSet {
    type Item = ChangeSetEntry;
    type IntoIter = std::vec::IntoIter<ChangeSetEntry>;
    fn into_iter(self) -> Self::IntoIter { self.entries.into_iter() }
}

impl FromIterator<ChangeSetEntry> for ChangeSet {
    fn from_iter<T: IntoIterator<Item = ChangeSetEntry>>(iter: T) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(name: &str) -> ObjectRef { ObjectRef::new("v1", "ConfigMap", Some("default"), name) }

    #[test]
    fn entry_renders_subject_and_action() {
        let e = ChangeSetEntry::new(r("cfg1"), Action::Created);
        assert_eq!(e.to_string(), "ConfigMap/default/cfg1 created");
        assert!(e.diff().is_none());
    }

    #[test]
    fn change_set_keeps_insertion_order_and_counts() {
        let mut cs = ChangeSet::new();
        cs.add(ChangeSetEntry::new(r("b"), Action::Unchanged));
        cs.add(ChangeSetEntry::new(r("a"), Action::Configured));
        cs.add(ChangeSetEntry::new(r("c"), Action::Unchanged));
        let names: Vec<_> = cs.iter().map(|e| e.object().name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(cs.count(Action::Unchanged), 2);
        assert!(cs.has_changes());
        assert_eq!(cs.to_string().lines().count(), 3);
    }

    #[test]
    fn json_shape_is_lowercase_and_omits_empty_diff() {
        let e = ChangeSetEntry::new(r("cfg1"), Action::Skipped);
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["action"], "skipped");
        assert!(v.get("diff").is_none());
    }
}

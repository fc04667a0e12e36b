use kapply_core::{Action, ChangeSet};

/// One `<Kind/ns/name> <action>` line per entry, followed by the indented
/// diff when `with_diffs` is set.
pub fn change_set(cs: &ChangeSet, with_diffs: bool) -> String {
    let mut out = String::new();
    for entry in cs {
        out.push_str(&entry.to_string());
        out.push('\n');
        if let (true, Some(diff)) = (with_diffs, entry.diff()) {
            for line in diff.lines() {
                out.push_str("    ");
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

/// Short tally, e.g. `2 created, 1 configured, 4 unchanged`.
pub fn summary(cs: &ChangeSet) -> String {
    let parts: Vec<String> = [
        Action::Created,
        Action::Configured,
        Action::Unchanged,
        Action::Deleted,
        Action::Skipped,
        Action::Failed,
    ]
    .iter()
    .filter_map(|a| match cs.count(*a) {
        0 => None,
        n => Some(format!("{} {}", n, a)),
    })
    .collect();
    if parts.is_empty() {
        "nothing to do".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use kapply_core::{ChangeSetEntry, ObjectRef};

    use super::*;

    fn r(name: &str) -> ObjectRef {
        ObjectRef::new("v1", "ConfigMap", Some("default"), name)
    }

    #[test]
    fn renders_lines_and_indented_diffs() {
        let mut cs = ChangeSet::new();
        cs.add(ChangeSetEntry::new(r("a"), Action::Created));
        cs.add(ChangeSetEntry::with_diff(r("b"), Action::Configured, "- k: 1\n+ k: 2\n".into()));
        assert_eq!(change_set(&cs, false), "ConfigMap/default/a created\nConfigMap/default/b configured\n");
        assert_eq!(
            change_set(&cs, true),
            "ConfigMap/default/a created\nConfigMap/default/b configured\n    - k: 1\n    + k: 2\n"
        );
        assert_eq!(summary(&cs), "1 created, 1 configured");
        assert_eq!(summary(&ChangeSet::new()), "nothing to do");
    }
}

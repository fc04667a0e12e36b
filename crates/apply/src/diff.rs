//! Rendering the difference between a live object and its dry-run result.

use kapply_core::Object;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Produces the human-readable diff stored on a `Configured` change-set entry.
pub trait DiffRenderer: Send + Sync {
    fn render(&self, existing: &Object, desired: &Object) -> String;
}

/// Unified-style line diff of the YAML form of both objects.
#[derive(Debug, Clone)]
pub struct YamlDiff {
    /// Unchanged lines kept around each change.
    pub context: usize,
}

impl Default for YamlDiff {
    fn default() -> Self { Self { context: 3 } }
}

impl DiffRenderer for YamlDiff {
    fn render(&self, existing: &Object, desired: &Object) -> String {
        let a = to_yaml(existing);
        let b = to_yaml(desired);
        let a: Vec<&str> = a.lines().collect();
        let b: Vec<&str> = b.lines().collect();
        render_ops(&line_ops(&a, &b), self.context)
    }
}

fn to_yaml(object: &Object) -> String {
    serde_yaml::to_string(object.as_value()).unwrap_or_else(|e| format!("# unrenderable object: {}\n", e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op<'a> {
    Keep(&'a str),
    Del(&'a str),
    Add(&'a str),
}

impl Op<'_> {
    fn is_change(&self) -> bool { !matches!(self, Op::Keep(_)) }
}

/// Line edit script between `a` and `b`. Common head and tail lines are
/// matched directly; the rest goes through Hirschberg's divide and conquer so
/// memory stays linear in the input.
fn line_ops<'a>(a: &[&'a str], b: &[&'a str]) -> Vec<Op<'a>> {
    let head = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let tail = a[head..].iter().rev().zip(b[head..].iter().rev()).take_while(|(x, y)| x == y).count();
    let mut ops = Vec::with_capacity(a.len().max(b.len()));
    ops.extend(a[..head].iter().map(|l| Op::Keep(*l)));
    hirschberg(&a[head..a.len() - tail], &b[head..b.len() - tail], &mut ops);
    ops.extend(a[a.len() - tail..].iter().map(|l| Op::Keep(*l)));
    ops
}

fn hirschberg<'a>(a: &[&'a str], b: &[&'a str], ops: &mut Vec<Op<'a>>) {
    if a.is_empty() {
        ops.extend(b.iter().map(|l| Op::Add(*l)));
        return;
    }
    if b.is_empty() {
        ops.extend(a.iter().map(|l| Op::Del(*l)));
        return;
    }
    if a.len() == 1 {
        match b.iter().position(|l| *l == a[0]) {
            Some(k) => {
                ops.extend(b[..k].iter().map(|l| Op::Add(*l)));
                ops.push(Op::Keep(a[0]));
                ops.extend(b[k + 1..].iter().map(|l| Op::Add(*l)));
            }
            None => {
                ops.push(Op::Del(a[0]));
                ops.extend(b.iter().map(|l| Op::Add(*l)));
            }
        }
        return;
    }

    let mid = a.len() / 2;
    let front = lcs_lengths(a[..mid].iter().copied(), b.iter().copied(), b.len());
    let back = lcs_lengths(a[mid..].iter().rev().copied(), b.iter().rev().copied(), b.len());
    // front[j]: LCS of a[..mid] and b[..j]; back[k]: LCS of a[mid..] and the last k lines of b
    let mut split = 0;
    let mut best = 0;
    for j in 0..=b.len() {
        let score = front[j] + back[b.len() - j];
        if score > best || j == 0 {
            best = score;
            split = j;
        }
    }
    hirschberg(&a[..mid], &b[..split], ops);
    hirschberg(&a[mid..], &b[split..], ops);
}

/// Last row of the LCS length table of `a` against every prefix of `b`.
fn lcs_lengths<'a, A, B>(a: A, b: B, m: usize) -> Vec<usize>
where
    A: Iterator<Item = &'a str>,
    B: Iterator<Item = &'a str> + Clone,
{
    let mut prev = vec![0usize; m + 1];
    let mut cur = vec![0usize; m + 1];
    for x in a {
        for (j, y) in b.clone().enumerate() {
            cur[j + 1] = if x == y { prev[j] + 1 } else { prev[j + 1].max(cur[j]) };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev
}

fn render_ops(ops: &[Op<'_>], context: usize) -> String {
    let mut visible = vec![false; ops.len()];
    for (idx, op) in ops.iter().enumerate() {
        if op.is_change() {
            let lo = idx.saturating_sub(context);
            let hi = (idx + context + 1).min(ops.len());
            visible[lo..hi].iter_mut().for_each(|v| *v = true);
        }
    }
    let mut out = String::new();
    let mut gap = false;
    for (op, show) in ops.iter().zip(visible) {
        if !show {
            gap = true;
            continue;
        }
        if gap && !out.is_empty() {
            out.push_str("...\n");
        }
        gap = false;
        let (prefix, line) = match op {
            Op::Keep(l) => ("  ", l),
            Op::Del(l) => ("- ", l),
            Op::Add(l) => ("+ ", l),
        };
        out.push_str(prefix);
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Counts of added, updated and removed leaf fields between two documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// Copy of `object` without server bookkeeping that would make every diff noisy.
pub fn strip_managed_fields(object: &Object) -> Object {
    let mut out = object.clone();
    out.remove_path(&["metadata", "managedFields"]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(data: Json) -> Object {
        Object::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "default"},
            "data": data
        }))
        .unwrap()
    }

    #[test]
    fn renders_changed_lines_only_with_context() {
        let out = YamlDiff::default().render(&cm(json!({"key": "1"})), &cm(json!({"key": "2"})));
        assert!(out.contains("- ") && out.contains("+ "), "{}", out);
        assert!(out.lines().any(|l| l.starts_with("- ") && l.contains("key")), "{}", out);
        assert!(out.lines().any(|l| l.starts_with("+ ") && l.contains("key")), "{}", out);
    }

    #[test]
    fn identical_objects_render_empty() {
        let o = cm(json!({"key": "1"}));
        assert_eq!(YamlDiff::default().render(&o, &o), "");
    }

    #[test]
    fn distant_changes_are_separated() {
        let a: Vec<String> = (0..20).map(|i| format!("line{}", i)).collect();
        let mut b = a.clone();
        b[1] = "changed1".into();
        b[18] = "changed18".into();
        let a: Vec<&str> = a.iter().map(|s| s.as_str()).collect();
        let b: Vec<&str> = b.iter().map(|s| s.as_str()).collect();
        let out = render_ops(&line_ops(&a, &b), 1);
        assert!(out.contains("...\n"), "{}", out);
        assert!(!out.contains("line10"), "{}", out);
    }

    #[test]
    fn edit_script_is_minimal() {
        let a = ["a", "b", "c", "d", "e", "f"];
        let b = ["a", "x", "c", "d", "y", "f", "g"];
        let ops = line_ops(&a, &b);
        let kept: Vec<_> = ops.iter().filter_map(|op| if let Op::Keep(l) = op { Some(*l) } else { None }).collect();
        assert_eq!(kept, vec!["a", "c", "d", "f"]);
        assert_eq!(ops.iter().filter(|op| matches!(op, Op::Del(_))).count(), 2);
        assert_eq!(ops.iter().filter(|op| matches!(op, Op::Add(_))).count(), 3);

        let rebuilt_a: Vec<_> = ops.iter().filter_map(|op| match op { Op::Keep(l) | Op::Del(l) => Some(*l), Op::Add(_) => None }).collect();
        let rebuilt_b: Vec<_> = ops.iter().filter_map(|op| match op { Op::Keep(l) | Op::Add(l) => Some(*l), Op::Del(_) => None }).collect();
        assert_eq!(rebuilt_a, a);
        assert_eq!(rebuilt_b, b);
    }

    #[test]
    fn large_documents_diff_every_changed_line() {
        let old: Vec<String> = (0..3000).map(|i| format!("k{}: v{}", i, i)).collect();
        let new: Vec<String> = (0..3000).map(|i| format!("k{}: w{}", i, i)).collect();
        let a: Vec<&str> = old.iter().map(|s| s.as_str()).collect();
        let b: Vec<&str> = new.iter().map(|s| s.as_str()).collect();
        let ops = line_ops(&a, &b);
        assert_eq!(ops.len(), 6000);
        assert!(ops.iter().all(|op| op.is_change()));
    }

    #[test]
    fn summary_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }

    #[test]
    fn strips_managed_fields() {
        let mut o = cm(json!({}));
        o.set_path(&["metadata", "managedFields"], json!([{"manager": "kapply"}]));
        assert!(strip_managed_fields(&o).get_path(&["metadata", "managedFields"]).is_none());
        assert!(o.get_path(&["metadata", "managedFields"]).is_some());
    }
}

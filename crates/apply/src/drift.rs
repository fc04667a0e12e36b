//! Drift detection between a live object and the result of a dry-run apply.

use kapply_core::Object;
use serde_json::{Number, Value as Json};

/// Whether `live` carries everything `desired` sets.
///
/// Unset desired values (null, empty string, empty list, empty map) match
/// anything. Maps match when every desired key is present and matches; lists
/// match when the desired list is not longer than the live one and matches it
/// element by element as a prefix. Scalars compare by value, numbers
/// numerically across integer and float forms.
pub fn deep_derivative(desired: &Json, live: &Json) -> bool {
    match desired {
        Json::Null => true,
        Json::String(s) if s.is_empty() => true,
        Json::Array(a) if a.is_empty() => true,
        Json::Object(m) if m.is_empty() => true,
        Json::Object(m) => match live.as_object() {
            Some(l) => m.iter().all(|(k, dv)| match l.get(k) {
                Some(lv) => deep_derivative(dv, lv),
                None => dv.is_null(),
            }),
            None => false,
        },
        Json::Array(a) => match live.as_array() {
            Some(l) if a.len() <= l.len() => a.iter().zip(l.iter()).all(|(d, v)| deep_derivative(d, v)),
            _ => false,
        },
        Json::String(s) => live.as_str() == Some(s.as_str()),
        Json::Bool(b) => live.as_bool() == Some(*b),
        Json::Number(n) => match live {
            Json::Number(m) => numbers_equal(n, m),
            _ => false,
        },
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// True when applying would change `existing`.
///
/// A dry-run result without a resourceVersion means the object does not exist
/// yet. Otherwise labels and annotations are checked first, then `spec` when
/// the live object has one, else `webhooks`, else the whole object.
pub fn has_drifted(existing: &Object, dry_run: &Object) -> bool {
    if dry_run.resource_version().is_none() {
        return true;
    }

    for path in [&["metadata", "labels"][..], &["metadata", "annotations"][..]] {
        if !derives(dry_run.get_path(path), existing.get_path(path)) {
            return true;
        }
    }

    for section in ["spec", "webhooks"] {
        if let Some(live) = existing.field(section) {
            return !derives(dry_run.field(section), Some(live));
        }
    }

    !deep_derivative(dry_run.as_value(), existing.as_value())
}

fn derives(desired: Option<&Json>, live: Option<&Json>) -> bool {
    deep_derivative(desired.unwrap_or(&Json::Null), live.unwrap_or(&Json::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Json) -> Object {
        Object::from_value(v).unwrap()
    }

    #[test]
    fn unset_desired_values_always_derive() {
        for d in [json!(null), json!(""), json!([]), json!({})] {
            assert!(deep_derivative(&d, &json!({"x": 1})), "{}", d);
        }
    }

    #[test]
    fn maps_require_desired_keys() {
        assert!(deep_derivative(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(!deep_derivative(&json!({"a": 1, "c": 3}), &json!({"a": 1, "b": 2})));
        assert!(!deep_derivative(&json!({"a": 1}), &json!("a")));
    }

    #[test]
    fn lists_compare_as_prefix() {
        assert!(deep_derivative(&json!([1, 2]), &json!([1, 2, 3])));
        assert!(!deep_derivative(&json!([1, 2, 3]), &json!([1, 2])));
        assert!(!deep_derivative(&json!([2, 1]), &json!([1, 2])));
    }

    #[test]
    fn numbers_compare_across_forms() {
        assert!(deep_derivative(&json!(1), &json!(1.0)));
        assert!(deep_derivative(&json!(0.5), &json!(0.5)));
        assert!(!deep_derivative(&json!(1), &json!(2)));
        assert!(!deep_derivative(&json!(1), &json!("1")));
        assert!(!deep_derivative(&json!(true), &json!("true")));
    }

    #[test]
    fn missing_resource_version_is_drift() {
        let existing = obj(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}));
        assert!(has_drifted(&existing, &existing));
    }

    #[test]
    fn spec_of_existing_decides_scope() {
        let existing = obj(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "a", "resourceVersion": "1"},
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 2}
        }));
        let mut dry = existing.clone();
        dry.set_path(&["status", "readyReplicas"], json!(0));
        assert!(!has_drifted(&existing, &dry), "status outside spec is ignored");

        dry.set_path(&["spec", "replicas"], json!(3));
        assert!(has_drifted(&existing, &dry));
    }

    #[test]
    fn webhooks_checked_when_no_spec() {
        let existing = obj(json!({
            "apiVersion": "admissionregistration.k8s.io/v1", "kind": "ValidatingWebhookConfiguration",
            "metadata": {"name": "w", "resourceVersion": "4"},
            "webhooks": [{"name": "a.example.com", "timeoutSeconds": 5}]
        }));
        let mut dry = existing.clone();
        dry.set_path(&["webhooks"], json!([{"name": "a.example.com", "timeoutSeconds": 10}]));
        assert!(has_drifted(&existing, &dry));
    }

    #[test]
    fn label_change_is_drift_and_order_does_not_matter() {
        let existing = obj(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "resourceVersion": "1", "labels": {"x": "1", "y": "2"}}
        }));
        let reordered = obj(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "resourceVersion": "1", "labels": {"y": "2", "x": "1"}}
        }));
        assert!(!has_drifted(&existing, &reordered));

        let mut changed = reordered.clone();
        changed.set_path(&["metadata", "labels", "x"], json!("9"));
        assert!(has_drifted(&existing, &changed));
    }
}

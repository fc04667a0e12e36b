#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kapply_apply::mask::{DESIRED_MASK, EXISTING_MASK};
use kapply_apply::{ApplyError, ManagerOptions, ResourceManager};
use kapply_core::{Action, Object, ObjectRef, StoreError};
use kapply_store::MemObjectStore;
use serde_json::{json, Value as Json};

fn cm(name: &str, data: Json) -> Object {
    Object::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": "default" },
        "data": data
    }))
    .unwrap()
}

fn secret(data: Json) -> Object {
    Object::from_value(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": "creds", "namespace": "default" },
        "data": data
    }))
    .unwrap()
}

fn cm_ref(name: &str) -> ObjectRef {
    ObjectRef::new("v1", "ConfigMap", Some("default"), name)
}

fn setup() -> (Arc<MemObjectStore>, ResourceManager) {
    let store = Arc::new(MemObjectStore::default());
    let opts = ManagerOptions { recreate_timeout: Duration::from_secs(2), recreate_poll_interval: Duration::from_millis(10) };
    let mgr = ResourceManager::new(store.clone(), opts);
    (store, mgr)
}

#[tokio::test]
async fn created_then_unchanged_then_configured() {
    let (store, mgr) = setup();

    let first = mgr.apply(&cm("a", json!({"key": "1"})), false).await.unwrap();
    assert_eq!(first.action(), Action::Created);
    assert_eq!(first.to_string(), "ConfigMap/default/a created");
    assert!(store.contains(&cm_ref("a")));
    let rv = store.live(&cm_ref("a")).unwrap().resource_version().map(str::to_string);

    let second = mgr.apply(&cm("a", json!({"key": "1"})), false).await.unwrap();
    assert_eq!(second.action(), Action::Unchanged);
    assert!(second.diff().is_none());
    assert_eq!(store.live(&cm_ref("a")).unwrap().resource_version().map(str::to_string), rv);

    let third = mgr.apply(&cm("a", json!({"key": "2"})), false).await.unwrap();
    assert_eq!(third.action(), Action::Configured);
    let diff = third.diff().unwrap();
    assert!(diff.lines().any(|l| l.starts_with("- ") && l.contains("key")), "{}", diff);
    assert!(diff.lines().any(|l| l.starts_with("+ ") && l.contains("key")), "{}", diff);
    assert!(!diff.contains("managedFields"), "{}", diff);
    assert_eq!(store.live(&cm_ref("a")).unwrap().str_at(&["data", "key"]), Some("2"));
}

#[tokio::test]
async fn diff_classifies_without_writing() {
    let (store, mgr) = setup();
    let entry = mgr.diff(&cm("a", json!({"key": "1"}))).await.unwrap();
    assert_eq!(entry.action(), Action::Created);
    assert!(store.is_empty());

    mgr.apply(&cm("a", json!({"key": "1"})), false).await.unwrap();
    let entry = mgr.diff(&cm("a", json!({"key": "9"}))).await.unwrap();
    assert_eq!(entry.action(), Action::Configured);
    assert_eq!(store.live(&cm_ref("a")).unwrap().str_at(&["data", "key"]), Some("1"));
}

#[tokio::test]
async fn secret_diff_is_masked_with_distinct_tokens() {
    let (_, mgr) = setup();
    mgr.apply(&secret(json!({"password": "aGVsbG8="})), false).await.unwrap();

    let entry = mgr.apply(&secret(json!({"password": "d29ybGQ="})), false).await.unwrap();
    assert_eq!(entry.action(), Action::Configured);
    let diff = entry.diff().unwrap();
    assert!(!diff.contains("aGVsbG8="), "{}", diff);
    assert!(!diff.contains("d29ybGQ="), "{}", diff);
    assert!(diff.lines().any(|l| l.starts_with("+ ") && l.contains(DESIRED_MASK)), "{}", diff);
    assert!(
        diff.lines().any(|l| l.starts_with("- ") && l.contains(EXISTING_MASK) && !l.contains(DESIRED_MASK)),
        "{}",
        diff
    );
}

#[tokio::test]
async fn secret_masks_differ_when_values_are_unchanged() {
    let (_, mgr) = setup();
    mgr.apply(&secret(json!({"password": "aGVsbG8="})), false).await.unwrap();

    let mut labelled = secret(json!({"password": "aGVsbG8="}));
    labelled.set_path(&["metadata", "labels"], json!({"tier": "backend"}));
    let entry = mgr.apply(&labelled, false).await.unwrap();
    assert_eq!(entry.action(), Action::Configured);
    let diff = entry.diff().unwrap();
    assert!(!diff.contains("aGVsbG8="), "{}", diff);
    assert!(diff.lines().any(|l| l.starts_with("+ ") && l.contains("tier")), "{}", diff);
    assert!(
        diff.lines()
            .any(|l| l.starts_with("- ") && l.contains("password") && l.contains(EXISTING_MASK) && !l.contains(DESIRED_MASK)),
        "{}",
        diff
    );
    assert!(
        diff.lines().any(|l| l.starts_with("+ ") && l.contains("password") && l.contains(DESIRED_MASK)),
        "{}",
        diff
    );
}

#[tokio::test]
async fn secret_validation_error_does_not_leak_values() {
    let (_, mgr) = setup();
    let err = mgr.apply(&secret(json!({"password": 424242})), false).await.unwrap_err();
    assert!(matches!(err, ApplyError::Validation { .. }));
    assert_eq!(err.to_string(), "Secret/default/creds is invalid, error: data values must be of type string");
}

#[tokio::test]
async fn store_messages_are_redacted_for_secrets() {
    let (store, mgr) = setup();
    let r = ObjectRef::new("v1", "Secret", Some("default"), "creds");
    store.fail_apply(&r, StoreError::Backend("connection reset while sending c2VjcmV0".into()));
    let err = mgr.apply(&secret(json!({"password": "c2VjcmV0"})), false).await.unwrap_err();
    assert!(matches!(err, ApplyError::Apply { .. }));
    assert!(!err.to_string().contains("c2VjcmV0"), "{}", err);
    assert!(err.to_string().starts_with("Secret/default/creds"), "{}", err);
}

#[tokio::test]
async fn missing_namespace_is_reported() {
    let (_, mgr) = setup();
    let mut o = cm("a", json!({}));
    o.remove_path(&["metadata", "namespace"]);
    let err = mgr.apply(&o, false).await.unwrap_err();
    assert!(matches!(err, ApplyError::NamespaceNotSpecified { .. }));
    assert!(err.to_string().starts_with("ConfigMap/a namespace not specified"), "{}", err);
}

#[tokio::test]
async fn immutable_change_needs_force_and_recreates() {
    let (store, mgr) = setup();
    let mut v1 = cm("locked", json!({"key": "1"}));
    v1.set_path(&["immutable"], json!(true));
    mgr.apply(&v1, false).await.unwrap();
    let uid = store.live(&cm_ref("locked")).unwrap().str_at(&["metadata", "uid"]).map(str::to_string);

    let mut v2 = cm("locked", json!({"key": "2"}));
    v2.set_path(&["immutable"], json!(true));
    let err = mgr.apply(&v2, false).await.unwrap_err();
    assert!(matches!(err, ApplyError::Conflict { .. }), "{}", err);
    assert_eq!(store.live(&cm_ref("locked")).unwrap().str_at(&["data", "key"]), Some("1"));

    let entry = mgr.apply(&v2, true).await.unwrap();
    assert_eq!(entry.action(), Action::Created);
    let live = store.live(&cm_ref("locked")).unwrap();
    assert_eq!(live.str_at(&["data", "key"]), Some("2"));
    assert_ne!(live.str_at(&["metadata", "uid"]).map(str::to_string), uid);
}

#[tokio::test]
async fn apply_all_stops_at_first_failure() {
    let (store, mgr) = setup();
    let mut bad = cm("b", json!({}));
    bad.remove_path(&["metadata", "namespace"]);
    let err = mgr.apply_all(&[cm("a", json!({})), bad, cm("c", json!({}))], false).await.unwrap_err();
    assert!(err.subject().contains("ConfigMap/b"));
    assert!(store.contains(&cm_ref("a")));
    assert!(!store.contains(&cm_ref("c")));
}

#[tokio::test]
async fn apply_all_reports_every_object_in_order() {
    let (_, mgr) = setup();
    mgr.apply(&cm("a", json!({"k": "1"})), false).await.unwrap();
    let cs = mgr
        .apply_all(&[cm("a", json!({"k": "1"})), cm("b", json!({"k": "1"}))], false)
        .await
        .unwrap();
    assert_eq!(cs.to_string(), "ConfigMap/default/a unchanged\nConfigMap/default/b created\n");
    assert!(cs.has_changes());
}

#[tokio::test]
async fn delete_all_handles_missing_skipped_and_failed() {
    let (store, mgr) = setup();
    mgr.apply(&cm("gone-soon", json!({})), false).await.unwrap();
    let mut keep = cm("keep", json!({}));
    keep.set_path(&["metadata", "annotations"], json!({"kapply.io/prune": "disabled"}));
    mgr.apply(&keep, false).await.unwrap();
    mgr.apply(&cm("stuck", json!({})), false).await.unwrap();
    store.fail_delete(&cm_ref("stuck"), StoreError::Backend("etcd unavailable".into()));

    let refs = [cm_ref("gone-soon"), cm_ref("never-existed"), cm_ref("keep"), cm_ref("stuck")];
    let outcome = mgr.delete_all(&refs).await;

    let actions: Vec<_> = outcome.change_set.iter().map(|e| e.action()).collect();
    assert_eq!(actions, vec![Action::Deleted, Action::Deleted, Action::Skipped, Action::Failed]);
    assert!(!store.contains(&cm_ref("gone-soon")));
    assert!(store.contains(&cm_ref("keep")));

    let err = outcome.error.clone().unwrap();
    assert_eq!(err.failures.len(), 1);
    assert!(err.to_string().contains("ConfigMap/default/stuck"), "{}", err);
    assert!(err.to_string().contains("etcd unavailable"), "{}", err);
    assert!(outcome.into_result().is_err());
}

#[tokio::test]
async fn delete_all_without_failures_has_no_error() {
    let (_, mgr) = setup();
    mgr.apply(&cm("a", json!({})), false).await.unwrap();
    let cs = mgr.delete_all(&[cm_ref("a")]).await.into_result().unwrap();
    assert_eq!(cs.count(Action::Deleted), 1);
}

//! kapply in-memory stores.
//!
//! `MemObjectStore` behaves like a small API server: server-side apply is a
//! recursive merge of the request onto the live object, dry-run returns the
//! merge result without persisting it, every persisted change bumps the
//! resource version, and fields registered as immutable reject changes.
//! `MemRecordStore` keeps inventory blobs keyed by (namespace, name).

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use kapply_core::{ApplyOptions, Object, ObjectRef, ObjectStore, RecordStore, StoreError};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Value as Json};
use tracing::debug;

/// Kinds the in-memory server treats as cluster-scoped.
const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
    "PriorityClass",
    "APIService",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
];

/// Server-owned metadata a client request never overwrites.
const SERVER_METADATA: &[&str] = &["resourceVersion", "uid", "generation", "creationTimestamp", "managedFields", "deletionTimestamp"];

struct Entry {
    object: Object,
    /// Set while the object is held in a terminating state.
    terminating: bool,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<String, Entry>,
    next_rv: u64,
    next_uid: u64,
    immutable: Vec<(String, Vec<String>)>,
    apply_failures: FxHashMap<String, StoreError>,
    delete_failures: FxHashMap<String, StoreError>,
    held: FxHashSet<String>,
    gets: FxHashMap<String, usize>,
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

pub struct MemObjectStore {
    inner: Mutex<Inner>,
    field_manager: String,
}

impl Default for MemObjectStore {
    fn default() -> Self { Self::new("kapply") }
}

impl MemObjectStore {
    pub fn new(field_manager: impl Into<String>) -> Self {
        Self { inner: Mutex::new(Inner::default()), field_manager: field_manager.into() }
    }

    /// Reject changes to `path` on objects of `kind` once they exist.
    pub fn with_immutable_field(self, kind: &str, path: &[&str]) -> Self {
        self.lock().immutable.push((kind.to_string(), path.iter().map(|s| s.to_string()).collect()));
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create or replace an object directly, as another writer would.
    pub fn insert(&self, object: Object) -> Result<Object, StoreError> {
        let r = object.object_ref().map_err(|e| StoreError::Invalid(e.to_string()))?;
        let mut inner = self.lock();
        let mut object = object;
        let rv = inner.bump_rv();
        object.set_path(&["metadata", "resourceVersion"], Json::String(rv));
        if object.generation().is_none() {
            object.set_path(&["metadata", "generation"], json!(1));
        }
        inner.objects.insert(r.id(), Entry { object: object.clone(), terminating: false });
        Ok(object)
    }

    /// Replace the `status` of a live object, bumping its resource version.
    pub fn set_status(&self, reference: &ObjectRef, status: Json) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let rv = inner.bump_rv();
        let entry = inner.objects.get_mut(&reference.id()).ok_or_else(|| StoreError::NotFound(reference.to_string()))?;
        entry.object.set_path(&["status"], status);
        entry.object.set_path(&["metadata", "resourceVersion"], Json::String(rv));
        Ok(())
    }

    /// Make the next apply of `reference` fail with `err`.
    pub fn fail_apply(&self, reference: &ObjectRef, err: StoreError) {
        self.lock().apply_failures.insert(reference.id(), err);
    }

    /// Make every delete of `reference` fail with `err`.
    pub fn fail_delete(&self, reference: &ObjectRef, err: StoreError) {
        self.lock().delete_failures.insert(reference.id(), err);
    }

    /// Let deletes of `reference` succeed again.
    pub fn clear_delete_failure(&self, reference: &ObjectRef) {
        self.lock().delete_failures.remove(&reference.id());
    }

    /// Keep `reference` visible (terminating) after delete until [`release`](Self::release).
    pub fn hold_deletion(&self, reference: &ObjectRef) {
        self.lock().held.insert(reference.id());
    }

    /// Finish a held deletion.
    pub fn release(&self, reference: &ObjectRef) {
        let mut inner = self.lock();
        inner.held.remove(&reference.id());
        let id = reference.id();
        if inner.objects.get(&id).map(|e| e.terminating).unwrap_or(false) {
            inner.objects.remove(&id);
        }
    }

    pub fn contains(&self, reference: &ObjectRef) -> bool {
        self.lock().objects.contains_key(&reference.id())
    }

    pub fn live(&self, reference: &ObjectRef) -> Option<Object> {
        self.lock().objects.get(&reference.id()).map(|e| e.object.clone())
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }

    /// Number of `get` calls served for `reference`.
    pub fn gets(&self, reference: &ObjectRef) -> usize {
        self.lock().gets.get(&reference.id()).copied().unwrap_or(0)
    }

    fn check_immutable(inner: &Inner, kind: &str, existing: &Object, desired: &Object) -> Result<(), StoreError> {
        for (k, path) in inner.immutable.iter().filter(|(k, _)| k == kind) {
            let p: Vec<&str> = path.iter().map(|s| s.as_str()).collect();
            if let (Some(old), Some(new)) = (existing.get_path(&p), desired.get_path(&p)) {
                if old != new {
                    return Err(StoreError::Immutable(format!("{} {}: field is immutable", k, path.join("."))));
                }
            }
        }
        // ConfigMaps and Secrets marked immutable reject data changes
        if matches!(kind, "ConfigMap" | "Secret") && existing.field("immutable") == Some(&Json::Bool(true)) {
            for key in ["data", "stringData", "binaryData"] {
                if let Some(new) = desired.field(key) {
                    if existing.field(key) != Some(new) {
                        return Err(StoreError::Immutable(format!("{} {}: field is immutable when `immutable` is set", kind, key)));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate(r: &ObjectRef, object: &Object) -> Result<(), StoreError> {
        if r.namespace.is_none() && !CLUSTER_SCOPED.contains(&r.kind.as_str()) {
            return Err(StoreError::NotFound(format!("namespaces \"\" not found ({} requires a namespace)", r)));
        }
        if object.is_secret() {
            if let Some(data) = object.field("data").and_then(|d| d.as_object()) {
                if data.values().any(|v| !v.is_string()) {
                    return Err(StoreError::Invalid(format!("{}: data values must be of type string", r)));
                }
            }
        }
        Ok(())
    }
}

/// Recursively merge `patch` onto `base`; mappings merge, everything else replaces,
/// `null` removes the key.
fn merge_into(base: &mut Json, patch: &Json) {
    match (base, patch) {
        (Json::Object(b), Json::Object(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    b.remove(k);
                    continue;
                }
                match b.get_mut(k) {
                    Some(existing) if existing.is_object() && v.is_object() => merge_into(existing, v),
                    _ => {
                        b.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (b, p) => *b = p.clone(),
    }
}

/// Request body with server-owned metadata removed.
fn client_view(object: &Object) -> Object {
    let mut req = object.clone();
    for f in SERVER_METADATA {
        req.remove_path(&["metadata", f]);
    }
    req.remove_path(&["status"]);
    req
}

fn spec_changed(before: &Object, after: &Object) -> bool {
    let strip = |o: &Object| {
        let mut v = o.as_value().clone();
        if let Some(m) = v.as_object_mut() {
            m.remove("metadata");
            m.remove("status");
        }
        v
    };
    strip(before) != strip(after)
}

#[async_trait::async_trait]
impl ObjectStore for MemObjectStore {
    async fn get(&self, reference: &ObjectRef) -> Result<Option<Object>, StoreError> {
        let mut inner = self.lock();
        *inner.gets.entry(reference.id()).or_default() += 1;
        Ok(inner.objects.get(&reference.id()).map(|e| e.object.clone()))
    }

    async fn apply(&self, object: &Object, opts: ApplyOptions) -> Result<Object, StoreError> {
        let r = object.object_ref().map_err(|e| StoreError::Invalid(e.to_string()))?;
        Self::validate(&r, object)?;
        let mut inner = self.lock();
        if let Some(err) = inner.apply_failures.remove(&r.id()) {
            return Err(err);
        }
        let request = client_view(object);
        let existing = inner.objects.get(&r.id()).map(|e| e.object.clone());

        if let Some(token) = object.resource_version() {
            let live = existing.as_ref().and_then(|e| e.resource_version());
            if live != Some(token) {
                return Err(StoreError::Conflict(format!(
                    "{}: the object has been modified; resourceVersion {} is stale",
                    r, token
                )));
            }
        }

        let managed = json!([{ "manager": self.field_manager, "operation": "Apply" }]);
        let mut result = match &existing {
            Some(live) => {
                Self::check_immutable(&inner, &r.kind, live, &request)?;
                let mut merged = live.clone();
                merge_into(merged.as_value_mut(), request.as_value());
                merged
            }
            None => request.clone(),
        };
        result.set_path(&["metadata", "managedFields"], managed);

        if opts.dry_run {
            debug!(object = %r, "dry-run apply");
            return Ok(result);
        }

        match existing {
            None => {
                inner.next_uid += 1;
                let uid = format!("00000000-0000-0000-0000-{:012}", inner.next_uid);
                let rv = inner.bump_rv();
                result.set_path(&["metadata", "uid"], Json::String(uid));
                result.set_path(&["metadata", "generation"], json!(1));
                result.set_path(&["metadata", "resourceVersion"], Json::String(rv));
            }
            Some(live) => {
                if result == live {
                    return Ok(result);
                }
                if spec_changed(&live, &result) {
                    let generation = live.generation().unwrap_or(1) + 1;
                    result.set_path(&["metadata", "generation"], json!(generation));
                }
                let rv = inner.bump_rv();
                result.set_path(&["metadata", "resourceVersion"], Json::String(rv));
            }
        }
        inner.objects.insert(r.id(), Entry { object: result.clone(), terminating: false });
        Ok(result)
    }

    async fn delete(&self, reference: &ObjectRef) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let id = reference.id();
        if let Some(err) = inner.delete_failures.get(&id) {
            return Err(err.clone());
        }
        if !inner.objects.contains_key(&id) {
            return Err(StoreError::NotFound(reference.to_string()));
        }
        if inner.held.contains(&id) {
            let rv = inner.bump_rv();
            if let Some(entry) = inner.objects.get_mut(&id) {
                entry.terminating = true;
                entry.object.set_path(&["metadata", "deletionTimestamp"], Json::String("1970-01-01T00:00:00Z".into()));
                entry.object.set_path(&["metadata", "resourceVersion"], Json::String(rv));
            }
            return Ok(());
        }
        inner.objects.remove(&id);
        Ok(())
    }
}

/// Inventory records held in memory.
#[derive(Default)]
pub struct MemRecordStore {
    records: Mutex<FxHashMap<(String, String), String>>,
}

impl MemRecordStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<(String, String), String>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize { self.lock().len() }
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    pub fn raw(&self, name: &str, namespace: &str) -> Option<String> {
        self.lock().get(&(namespace.to_string(), name.to_string())).cloned()
    }
}

#[async_trait::async_trait]
impl RecordStore for MemRecordStore {
    async fn get_record(&self, name: &str, namespace: &str) -> Result<Option<String>, StoreError> {
        Ok(self.raw(name, namespace))
    }

    async fn put_record(&self, name: &str, namespace: &str, blob: &str) -> Result<(), StoreError> {
        self.lock().insert((namespace.to_string(), name.to_string()), blob.to_string());
        Ok(())
    }

    async fn delete_record(&self, name: &str, namespace: &str) -> Result<(), StoreError> {
        match self.lock().remove(&(namespace.to_string(), name.to_string())) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("{}/{}", namespace, name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_replaces_scalars_and_merges_maps() {
        let mut base = json!({"a": 1, "m": {"x": 1, "y": 2}, "l": [1, 2]});
        merge_into(&mut base, &json!({"a": 2, "m": {"y": 3, "z": 4}, "l": [9], "gone": null}));
        assert_eq!(base, json!({"a": 2, "m": {"x": 1, "y": 3, "z": 4}, "l": [9]}));

        let mut base = json!({"m": {"x": 1}});
        merge_into(&mut base, &json!({"m": null}));
        assert_eq!(base, json!({}));
    }

    fn obj(v: Json) -> Object { Object::from_value(v).unwrap() }

    #[test]
    fn client_view_drops_server_fields() {
        let o = obj(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "d", "resourceVersion": "5", "uid": "u", "managedFields": []},
            "status": {"x": 1}
        }));
        let v = client_view(&o);
        assert!(v.resource_version().is_none());
        assert!(v.get_path(&["metadata", "uid"]).is_none());
        assert!(v.field("status").is_none());
        assert_eq!(v.name(), "a");
    }
}

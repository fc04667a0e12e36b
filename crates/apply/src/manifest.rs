//! Loading multi-document YAML/JSON manifests into objects.

use kapply_core::Object;
use serde::Deserialize;
use serde_json::Value as Json;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest too large (>{limit} bytes)")]
    TooLarge { limit: usize },
    #[error("document {index} too complex (>{limit} nodes)")]
    TooComplex { index: usize, limit: usize },
    #[error("document {index}: {source}")]
    Parse {
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("document {index}: {detail}")]
    Invalid { index: usize, detail: String },
}

#[derive(Debug, Clone, Copy)]
pub struct ManifestLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for ManifestLimits {
    fn default() -> Self { Self { max_bytes: 10_000_000, max_nodes: 1_000_000 } }
}

impl ManifestLimits {
    /// `KAPPLY_MAX_YAML_BYTES` and `KAPPLY_MAX_YAML_NODES`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let get = |k: &str, dflt: usize| std::env::var(k).ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(dflt);
        Self { max_bytes: get("KAPPLY_MAX_YAML_BYTES", d.max_bytes), max_nodes: get("KAPPLY_MAX_YAML_NODES", d.max_nodes) }
    }
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse every document in `text`. Empty documents are skipped and `List`
/// documents are flattened into their items. JSON is accepted as YAML.
pub fn parse_manifests(text: &str, limits: ManifestLimits) -> Result<Vec<Object>, ManifestError> {
    if text.len() > limits.max_bytes {
        return Err(ManifestError::TooLarge { limit: limits.max_bytes });
    }
    let mut out = Vec::new();
    for (index, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).map_err(|source| ManifestError::Parse { index, source })?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val)
            .map_err(|e| ManifestError::Invalid { index, detail: format!("converting YAML to JSON: {}", e) })?;
        if node_budget_exceeded(&json, limits.max_nodes) {
            return Err(ManifestError::TooComplex { index, limit: limits.max_nodes });
        }
        push_document(index, json, &mut out)?;
    }
    Ok(out)
}

fn push_document(index: usize, json: Json, out: &mut Vec<Object>) -> Result<(), ManifestError> {
    let is_list = json.get("kind").and_then(|k| k.as_str()).is_some_and(|k| k == "List" || k.ends_with("List"))
        && json.get("items").is_some_and(|i| i.is_array());
    if is_list {
        if let Some(Json::Array(items)) = json.get("items") {
            for item in items {
                push_document(index, item.clone(), out)?;
            }
        }
        return Ok(());
    }
    let obj = Object::from_value(json).map_err(|e| ManifestError::Invalid { index, detail: e.to_string() })?;
    obj.object_ref().map_err(|e| ManifestError::Invalid { index, detail: e.to_string() })?;
    out.push(obj);
    Ok(())
}

/// Apply order rank: cluster prerequisites first, admission webhooks last.
pub fn kind_rank(kind: &str) -> u8 {
    match kind {
        "CustomResourceDefinition" => 0,
        "Namespace" => 1,
        "ClusterRole" | "ClusterRoleBinding" | "PriorityClass" | "StorageClass" => 2,
        "ServiceAccount" | "Role" | "RoleBinding" | "ResourceQuota" | "LimitRange" => 3,
        "ConfigMap" | "Secret" => 4,
        "PersistentVolume" | "PersistentVolumeClaim" => 5,
        "Service" => 6,
        "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => 9,
        _ => 7,
    }
}

/// Stable sort into apply order; objects of the same rank keep their input order.
pub fn sort_for_apply(objects: &mut [Object]) {
    objects.sort_by_key(|o| kind_rank(o.kind()));
}

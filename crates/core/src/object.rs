//! Object model: a dynamic field tree plus the reference that identifies it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    #[error("object is not a JSON/YAML mapping")]
    NotAMapping,
    #[error("{subject} missing {field}")]
    MissingField { subject: String, field: &'static str },
    #[error("invalid inventory id '{0}' (expect <namespace>_<name>_<group>_<kind>)")]
    InvalidId(String),
}

/// Identity of a cluster object, independent of its content.
///
/// `version` travels with the reference so the object can be addressed on
/// the API surface, but it is not part of the identity: two references name
/// the same object when their [`ObjectRef::id`] match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string()),
            name: name.to_string(),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Stable identity key: `<namespace>_<name>_<group>_<kind>`.
    pub fn id(&self) -> String {
        format!("{}_{}_{}_{}", self.namespace.as_deref().unwrap_or(""), self.name, self.group, self.kind)
    }

    /// Rebuild a reference from an inventory id and the API version recorded next to it.
    pub fn parse_id(id: &str, version: &str) -> Result<Self, ObjectError> {
        let parts: Vec<&str> = id.split('_').collect();
        match parts.as_slice() {
            [ns, name, group, kind] if !name.is_empty() && !kind.is_empty() => Ok(Self {
                group: (*group).to_string(),
                version: version.to_string(),
                kind: (*kind).to_string(),
                namespace: if ns.is_empty() { None } else { Some((*ns).to_string()) },
                name: (*name).to_string(),
            }),
            _ => Err(ObjectError::InvalidId(id.to_string())),
        }
    }

    pub fn same_object(&self, other: &ObjectRef) -> bool {
        self.group == other.group && self.kind == other.kind && self.namespace == other.namespace && self.name == other.name
    }

    /// Secret-bearing kinds get their values masked in diffs and errors.
    pub fn is_secret(&self) -> bool {
        self.group.is_empty() && self.kind == "Secret"
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// A full cluster object held as a dynamic field tree.
///
/// Cloning is a deep copy; every operation that strips or masks fields works
/// on its own copy so the caller's object is never aliased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Object(Json);

impl Object {
    pub fn from_value(value: Json) -> Result<Self, ObjectError> {
        if value.is_object() { Ok(Self(value)) } else { Err(ObjectError::NotAMapping) }
    }

    /// Minimal object addressing `r`: apiVersion, kind and metadata name/namespace.
    pub fn skeleton(r: &ObjectRef) -> Self {
        let mut meta = Map::new();
        meta.insert("name".into(), Json::String(r.name.clone()));
        if let Some(ns) = &r.namespace {
            meta.insert("namespace".into(), Json::String(ns.clone()));
        }
        let mut root = Map::new();
        root.insert("apiVersion".into(), Json::String(r.api_version()));
        root.insert("kind".into(), Json::String(r.kind.clone()));
        root.insert("metadata".into(), Json::Object(meta));
        Self(Json::Object(root))
    }

    pub fn as_value(&self) -> &Json { &self.0 }
    pub fn as_value_mut(&mut self) -> &mut Json { &mut self.0 }
    pub fn into_value(self) -> Json { self.0 }

    pub fn api_version(&self) -> &str { self.str_at(&["apiVersion"]).unwrap_or("") }
    pub fn kind(&self) -> &str { self.str_at(&["kind"]).unwrap_or("") }
    pub fn name(&self) -> &str { self.str_at(&["metadata", "name"]).unwrap_or("") }

    pub fn namespace(&self) -> Option<&str> {
        self.str_at(&["metadata", "namespace"]).filter(|s| !s.is_empty())
    }

    pub fn labels(&self) -> Option<&Map<String, Json>> {
        self.get_path(&["metadata", "labels"]).and_then(|v| v.as_object())
    }

    pub fn annotations(&self) -> Option<&Map<String, Json>> {
        self.get_path(&["metadata", "annotations"]).and_then(|v| v.as_object())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().and_then(|a| a.get(key)).and_then(|v| v.as_str())
    }

    /// Concurrency token; `None` when the object has never been persisted.
    pub fn resource_version(&self) -> Option<&str> {
        self.str_at(&["metadata", "resourceVersion"]).filter(|s| !s.is_empty())
    }

    pub fn generation(&self) -> Option<i64> {
        self.get_path(&["metadata", "generation"]).and_then(|v| v.as_i64())
    }

    pub fn field(&self, key: &str) -> Option<&Json> {
        self.0.get(key)
    }

    pub fn get_path(&self, path: &[&str]) -> Option<&Json> {
        path.iter().try_fold(&self.0, |cur, seg| cur.get(*seg))
    }

    pub fn str_at(&self, path: &[&str]) -> Option<&str> {
        self.get_path(path).and_then(|v| v.as_str())
    }

    pub fn i64_at(&self, path: &[&str]) -> Option<i64> {
        self.get_path(path).and_then(|v| v.as_i64())
    }

    /// Remove the field at `path`, returning it when present.
    pub fn remove_path(&mut self, path: &[&str]) -> Option<Json> {
        let (last, parents) = path.split_last()?;
        let mut cur = &mut self.0;
        for seg in parents {
            cur = cur.get_mut(*seg)?;
        }
        cur.as_object_mut()?.remove(*last)
    }

    /// Set the field at `path`, creating intermediate mappings as needed.
    pub fn set_path(&mut self, path: &[&str], value: Json) {
        let Some((last, parents)) = path.split_last() else { return };
        let mut cur = &mut self.0;
        for seg in parents {
            if !cur.is_object() {
                *cur = Json::Object(Map::new());
            }
            let Some(map) = cur.as_object_mut() else { return };
            cur = map.entry((*seg).to_string()).or_insert_with(|| Json::Object(Map::new()));
        }
        if !cur.is_object() {
            *cur = Json::Object(Map::new());
        }
        if let Some(map) = cur.as_object_mut() {
            map.insert((*last).to_string(), value);
        }
    }

    pub fn is_secret(&self) -> bool {
        self.kind() == "Secret" && !self.api_version().contains('/')
    }

    /// Reference for this object; fails when kind, apiVersion or name is missing.
    pub fn object_ref(&self) -> Result<ObjectRef, ObjectError> {
        let subject = self.to_string();
        if self.kind().is_empty() {
            return Err(ObjectError::MissingField { subject, field: "kind" });
        }
        if self.api_version().is_empty() {
            return Err(ObjectError::MissingField { subject, field: "apiVersion" });
        }
        if self.name().is_empty() {
            return Err(ObjectError::MissingField { subject, field: "metadata.name" });
        }
        Ok(ObjectRef::new(self.api_version(), self.kind(), self.namespace(), self.name()))
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.kind().is_empty() { "<unknown>" } else { self.kind() };
        let name = if self.name().is_empty() { "<unnamed>" } else { self.name() };
        match self.namespace() {
            Some(ns) => write!(f, "{}/{}/{}", kind, ns, name),
            None => write!(f, "{}/{}", kind, name),
        }
    }
}

impl TryFrom<Json> for Object {
    type Error = ObjectError;
    fn try_from(value: Json) -> Result<Self, Self::Error> { Self::from_value(value) }
}

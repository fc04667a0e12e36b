//! kapply inventory: a durable record of the objects an apply run owns.
//!
//! The inventory is the only input to garbage collection. An object becomes a
//! prune candidate when it sits in the previously stored inventory and is
//! missing from the current one; nothing else about a live object (labels,
//! owner, name similarity) is ever consulted.

#![forbid(unsafe_code)]

mod manager;

pub use manager::{InventoryManager, RecordError};

use kapply_core::{ObjectError, ObjectRef, StoreError};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("reading inventory {namespace}/{name} failed: {source}")]
    Read { name: String, namespace: String, #[source] source: StoreError },
    #[error("writing inventory {namespace}/{name} failed: {source}")]
    Write { name: String, namespace: String, #[source] source: StoreError },
    #[error("deleting inventory {namespace}/{name} failed: {source}")]
    Delete { name: String, namespace: String, #[source] source: StoreError },
    #[error("decoding inventory {namespace}/{name} failed: {detail}")]
    Decode { name: String, namespace: String, detail: String },
    #[error("encoding inventory failed: {0}")]
    Encode(String),
    #[error("inventory entry: {0}")]
    Entry(#[from] ObjectError),
}

/// Identity record of one applied object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryEntry {
    /// `<namespace>_<name>_<group>_<kind>`
    pub id: String,
    /// API version the object was applied with.
    #[serde(rename = "v")]
    pub version: String,
}

impl InventoryEntry {
    pub fn from_ref(r: &ObjectRef) -> Self {
        Self { id: r.id(), version: r.version.clone() }
    }

    pub fn object_ref(&self) -> Result<ObjectRef, ObjectError> {
        ObjectRef::parse_id(&self.id, &self.version)
    }
}

/// Set of entries owned by one source, in the order they were recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub source: String,
    #[serde(default)]
    entries: Vec<InventoryEntry>,
    /// Ids of `entries`, for constant-time membership.
    #[serde(skip)]
    ids: FxHashSet<String>,
}

impl Inventory {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into(), entries: Vec::new(), ids: FxHashSet::default() }
    }

    /// Add `r` unless an entry with the same identity already exists.
    /// Returns whether the entry was inserted.
    pub fn add_object(&mut self, r: &ObjectRef) -> bool {
        self.insert(InventoryEntry::from_ref(r))
    }

    fn insert(&mut self, entry: InventoryEntry) -> bool {
        if !self.ids.insert(entry.id.clone()) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn contains(&self, r: &ObjectRef) -> bool {
        self.ids.contains(&r.id())
    }

    pub fn entries(&self) -> &[InventoryEntry] { &self.entries }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// References for every entry, in recorded order.
    pub fn references(&self) -> Result<Vec<ObjectRef>, InventoryError> {
        self.entries.iter().map(|e| e.object_ref().map_err(InventoryError::from)).collect()
    }

    /// Entries of `self` whose identity is absent from `newer`, in recorded order.
    pub fn diff(&self, newer: &Inventory) -> Result<Vec<ObjectRef>, InventoryError> {
        self.entries
            .iter()
            .filter(|e| !newer.ids.contains(&e.id))
            .map(|e| e.object_ref().map_err(InventoryError::from))
            .collect()
    }

    pub fn encode(&self) -> Result<String, InventoryError> {
        serde_json::to_string(self).map_err(|e| InventoryError::Encode(e.to_string()))
    }

    /// Decode a stored blob. Duplicate ids (hand-edited records) collapse to the first.
    pub fn decode(blob: &str) -> Result<Self, serde_json::Error> {
        let raw: Inventory = serde_json::from_str(blob)?;
        let mut inv = Inventory::new(raw.source);
        for e in raw.entries {
            inv.insert(e);
        }
        Ok(inv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(kind: &str, name: &str) -> ObjectRef { ObjectRef::new("v1", kind, Some("default"), name) }

    #[test]
    fn add_object_deduplicates_by_identity() {
        let mut inv = Inventory::new("test");
        assert!(inv.add_object(&r("ConfigMap", "a")));
        assert!(!inv.add_object(&r("ConfigMap", "a")));
        // version is not part of identity
        let mut other_version = r("ConfigMap", "a");
        other_version.version = "v2".into();
        assert!(!inv.add_object(&other_version));
        assert!(inv.add_object(&r("Secret", "a")));
        assert_eq!(inv.len(), 2);
    }

    #[test]
    fn diff_returns_entries_missing_from_newer_in_order() {
        let mut old = Inventory::new("test");
        for n in ["a", "b", "c", "d"] { old.add_object(&r("ConfigMap", n)); }
        let mut new = Inventory::new("test");
        for n in ["c", "a"] { new.add_object(&r("ConfigMap", n)); }
        let stale: Vec<String> = old.diff(&new).unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(stale, vec!["b", "d"]);
        assert!(new.diff(&old).unwrap().is_empty());
    }

    #[test]
    fn encode_decode_keeps_order_and_drops_duplicates() {
        let blob = r#"{"source":"kapply","entries":[
            {"id":"default_b__ConfigMap","v":"v1"},
            {"id":"default_a__ConfigMap","v":"v1"},
            {"id":"default_b__ConfigMap","v":"v1"}]}"#;
        let inv = Inventory::decode(blob).unwrap();
        assert_eq!(inv.source, "kapply");
        let ids: Vec<_> = inv.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["default_b__ConfigMap", "default_a__ConfigMap"]);

        let again = Inventory::decode(&inv.encode().unwrap()).unwrap();
        assert_eq!(again, inv);
        assert!(again.contains(&r("ConfigMap", "a")));
        assert!(!again.contains(&r("ConfigMap", "c")));
    }

    #[test]
    fn large_inventories_stay_deduplicated() {
        let mut inv = Inventory::new("test");
        for round in 0..2 {
            for i in 0..20_000 {
                assert_eq!(inv.add_object(&r("ConfigMap", &format!("cm-{}", i))), round == 0);
            }
        }
        assert_eq!(inv.len(), 20_000);
        assert!(inv.contains(&r("ConfigMap", "cm-19999")));
        assert_eq!(inv.entries()[0].id, "default_cm-0__ConfigMap");
    }

    #[test]
    fn references_surface_bad_ids() {
        let blob = r#"{"source":"kapply","entries":[{"id":"broken","v":"v1"}]}"#;
        let inv = Inventory::decode(blob).unwrap();
        assert!(matches!(inv.references(), Err(InventoryError::Entry(_))));
    }
}

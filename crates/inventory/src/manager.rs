use std::sync::Arc;

use kapply_core::{Object, ObjectError, ObjectRef, RecordStore};
use metrics::counter;
use tracing::{debug, info};

use crate::{Inventory, InventoryError};

/// An object in the desired set could not be identified; nothing was recorded.
#[derive(Debug, thiserror::Error)]
#[error("{subject} cannot be recorded in inventory, error: {source}")]
pub struct RecordError {
    pub subject: String,
    #[source]
    pub source: ObjectError,
}

/// Builds inventories and persists them through a [`RecordStore`].
pub struct InventoryManager {
    records: Arc<dyn RecordStore>,
    source: String,
}

impl InventoryManager {
    /// `source` names the owning operation and is written into every inventory.
    pub fn new(records: Arc<dyn RecordStore>, source: impl Into<String>) -> Self {
        Self { records, source: source.into() }
    }

    pub fn source(&self) -> &str { &self.source }

    /// One entry per object, in the given order. Any unidentifiable object
    /// fails the whole call.
    pub fn record(&self, objects: &[Object]) -> Result<Inventory, RecordError> {
        let mut inv = Inventory::new(self.source.clone());
        for obj in objects {
            let r = obj.object_ref().map_err(|source| RecordError { subject: obj.to_string(), source })?;
            if !inv.add_object(&r) {
                debug!(object = %r, "duplicate object in desired set; recorded once");
            }
        }
        Ok(inv)
    }

    /// Previously stored inventory, `None` when no record exists.
    pub async fn load(&self, name: &str, namespace: &str) -> Result<Option<Inventory>, InventoryError> {
        let blob = match self.records.get_record(name, namespace).await {
            Ok(Some(b)) => b,
            Ok(None) => return Ok(None),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(source) => {
                return Err(InventoryError::Read { name: name.to_string(), namespace: namespace.to_string(), source })
            }
        };
        let inv = Inventory::decode(&blob).map_err(|e| InventoryError::Decode {
            name: name.to_string(),
            namespace: namespace.to_string(),
            detail: e.to_string(),
        })?;
        Ok(Some(inv))
    }

    /// Objects recorded in the stored inventory that `new_inventory` no longer lists.
    /// A missing record means there is nothing to collect.
    pub async fn get_stale_objects(
        &self,
        new_inventory: &Inventory,
        name: &str,
        namespace: &str,
    ) -> Result<Vec<ObjectRef>, InventoryError> {
        let Some(previous) = self.load(name, namespace).await? else {
            debug!(inventory = %format!("{}/{}", namespace, name), "no previous inventory");
            return Ok(Vec::new());
        };
        let stale = previous.diff(new_inventory)?;
        info!(inventory = %format!("{}/{}", namespace, name), previous = previous.len(), stale = stale.len(), "computed stale objects");
        Ok(stale)
    }

    /// Overwrite the record for (`name`, `namespace`). Call this only once every
    /// apply of the run succeeded: the stored record is the checkpoint the next
    /// run diffs against.
    pub async fn store(&self, inventory: &Inventory, name: &str, namespace: &str) -> Result<(), InventoryError> {
        let blob = inventory.encode()?;
        self.records
            .put_record(name, namespace, &blob)
            .await
            .map_err(|source| InventoryError::Write { name: name.to_string(), namespace: namespace.to_string(), source })?;
        counter!("inventory_store_total", 1u64);
        info!(inventory = %format!("{}/{}", namespace, name), entries = inventory.len(), "inventory stored");
        Ok(())
    }

    /// Remove the record; a missing record is not an error.
    pub async fn delete(&self, name: &str, namespace: &str) -> Result<(), InventoryError> {
        match self.records.delete_record(name, namespace).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(source) => Err(InventoryError::Delete { name: name.to_string(), namespace: namespace.to_string(), source }),
        }
    }
}

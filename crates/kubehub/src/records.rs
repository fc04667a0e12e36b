use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kapply_core::{RecordStore, StoreError};
use kube::{
    api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams},
    Client,
};
use tracing::debug;

use crate::map_kube_error;

/// ConfigMap data key holding the serialized inventory.
pub const INVENTORY_KEY: &str = "inventory";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Inventory record as it is written to the cluster.
pub fn record_configmap(name: &str, namespace: &str, field_manager: &str, blob: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(MANAGED_BY_LABEL.to_string(), field_manager.to_string())])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(INVENTORY_KEY.to_string(), blob.to_string())])),
        ..Default::default()
    }
}

/// [`RecordStore`] keeping each inventory in a ConfigMap named after it.
pub struct ConfigMapRecordStore {
    client: Client,
    field_manager: String,
}

impl ConfigMapRecordStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into() }
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn subject(name: &str, namespace: &str) -> String {
    format!("ConfigMap/{}/{}", namespace, name)
}

#[async_trait::async_trait]
impl RecordStore for ConfigMapRecordStore {
    async fn get_record(&self, name: &str, namespace: &str) -> Result<Option<String>, StoreError> {
        match self.api(namespace).get_opt(name).await {
            Ok(Some(cm)) => Ok(cm.data.and_then(|mut d| d.remove(INVENTORY_KEY))),
            Ok(None) => Ok(None),
            Err(e) => Err(map_kube_error(&subject(name, namespace), e)),
        }
    }

    async fn put_record(&self, name: &str, namespace: &str, blob: &str) -> Result<(), StoreError> {
        let cm = record_configmap(name, namespace, &self.field_manager, blob);
        let pp = PatchParams::apply(&self.field_manager).force();
        self.api(namespace)
            .patch(name, &pp, &Patch::Apply(&cm))
            .await
            .map_err(|e| map_kube_error(&subject(name, namespace), e))?;
        debug!(record = %subject(name, namespace), bytes = blob.len(), "inventory record written");
        Ok(())
    }

    async fn delete_record(&self, name: &str, namespace: &str) -> Result<(), StoreError> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(&subject(name, namespace), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_configmap_carries_blob_and_label() {
        let cm = record_configmap("inv", "apps", "kapply", r#"{"source":"kapply","entries":[]}"#);
        assert_eq!(cm.metadata.name.as_deref(), Some("inv"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("apps"));
        let labels = cm.metadata.labels.unwrap();
        assert_eq!(labels.get(MANAGED_BY_LABEL).map(String::as_str), Some("kapply"));
        let data = cm.data.unwrap();
        assert!(data[INVENTORY_KEY].contains("\"entries\""));

        let v = serde_json::to_value(record_configmap("inv", "apps", "kapply", "{}")).unwrap();
        assert_eq!(v["data"]["inventory"], "{}");
    }
}

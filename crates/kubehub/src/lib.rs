//! kapply kubehub: the Kubernetes API behind kapply's store traits.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kapply_core::StoreError;
use kube::Client;

mod objects;
mod records;

pub use objects::KubeObjectStore;
pub use records::{record_configmap, ConfigMapRecordStore, INVENTORY_KEY, MANAGED_BY_LABEL};

/// Field manager used for server-side apply unless `KAPPLY_FIELD_MANAGER` is set.
pub const DEFAULT_FIELD_MANAGER: &str = "kapply";

pub fn field_manager_from_env() -> String {
    std::env::var("KAPPLY_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or_else(|| DEFAULT_FIELD_MANAGER.to_string())
}

/// Client from the local kubeconfig or in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// Translate an API error into the store's classification. 422 responses
/// about immutable fields become [`StoreError::Immutable`] so callers can
/// offer a forced recreate.
pub fn map_kube_error(subject: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) => {
            let detail = format!("{}: {}", subject, ae.message);
            match ae.code {
                404 => StoreError::NotFound(detail),
                409 => StoreError::Conflict(detail),
                422 if ae.message.contains("immutable") => StoreError::Immutable(detail),
                400 | 422 => StoreError::Invalid(detail),
                _ => StoreError::Backend(format!("{} ({} {})", detail, ae.code, ae.reason)),
            }
        }
        other => StoreError::Backend(format!("{}: {}", subject, other)),
    }
}

use std::time::Instant;

use kapply_core::{ApplyOptions, Object, ObjectRef, ObjectStore, StoreError};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::map_kube_error;

/// Discovery result for one group/version/kind.
#[derive(Clone)]
struct Resolved {
    resource: ApiResource,
    namespaced: bool,
}

/// [`ObjectStore`] over dynamic objects of any served kind.
///
/// Kinds are resolved through API discovery; the result is cached and
/// refreshed when a kind is missing, so CRDs applied earlier in the same run
/// become usable.
pub struct KubeObjectStore {
    client: Client,
    field_manager: String,
    resources: RwLock<FxHashMap<String, Resolved>>,
}

fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{}/{}", version, kind)
    } else {
        format!("{}/{}/{}", group, version, kind)
    }
}

impl KubeObjectStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into(), resources: RwLock::new(FxHashMap::default()) }
    }

    pub fn field_manager(&self) -> &str { &self.field_manager }

    async fn resolve(&self, r: &ObjectRef) -> Result<Option<Resolved>, StoreError> {
        let key = gvk_key(&r.group, &r.version, &r.kind);
        if let Some(hit) = self.resources.read().await.get(&key) {
            return Ok(Some(hit.clone()));
        }
        let mut cache = self.resources.write().await;
        if let Some(hit) = cache.get(&key) {
            return Ok(Some(hit.clone()));
        }
        let t0 = Instant::now();
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| StoreError::Backend(format!("discovery failed: {}", e)))?;
        cache.clear();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    cache.insert(gvk_key(&ar.group, &ar.version, &ar.kind), Resolved { resource: ar, namespaced });
                }
            }
        }
        counter!("discovery_refresh_total", 1u64);
        histogram!("discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(resources = cache.len(), "api discovery refreshed");
        Ok(cache.get(&key).cloned())
    }

    /// Api handle for `r`; `None` when the cluster does not serve its kind.
    async fn api_for(&self, r: &ObjectRef) -> Result<Option<Api<DynamicObject>>, StoreError> {
        let Some(res) = self.resolve(r).await? else {
            return Ok(None);
        };
        let api = if res.namespaced {
            match r.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &res.resource),
                None => return Err(StoreError::NotFound(format!("{}: namespace required for namespaced kind", r))),
            }
        } else {
            Api::all_with(self.client.clone(), &res.resource)
        };
        Ok(Some(api))
    }
}

fn to_object(r: &ObjectRef, obj: DynamicObject) -> Result<Object, StoreError> {
    let v = serde_json::to_value(obj).map_err(|e| StoreError::Backend(format!("{}: serializing response: {}", r, e)))?;
    Object::from_value(v).map_err(|e| StoreError::Backend(format!("{}: {}", r, e)))
}

#[async_trait::async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, reference: &ObjectRef) -> Result<Option<Object>, StoreError> {
        let Some(api) = self.api_for(reference).await? else {
            debug!(object = %reference, "kind not served; treating as absent");
            return Ok(None);
        };
        match api.get_opt(&reference.name).await {
            Ok(Some(o)) => Ok(Some(to_object(reference, o)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(map_kube_error(&reference.to_string(), e)),
        }
    }

    async fn apply(&self, object: &Object, opts: ApplyOptions) -> Result<Object, StoreError> {
        let r = object.object_ref().map_err(|e| StoreError::Invalid(e.to_string()))?;
        let api = self
            .api_for(&r)
            .await?
            .ok_or_else(|| StoreError::Invalid(format!("{}: resource type {} is not served by the cluster", r, r.api_version())))?;
        let mut pp = PatchParams::apply(&self.field_manager).force();
        if opts.dry_run {
            pp = pp.dry_run();
        }
        let res = api.patch(&r.name, &pp, &Patch::Apply(object.as_value())).await;
        match res {
            Ok(o) => to_object(&r, o),
            Err(e) => Err(map_kube_error(&r.to_string(), e)),
        }
    }

    async fn delete(&self, reference: &ObjectRef) -> Result<(), StoreError> {
        let Some(api) = self.api_for(reference).await? else {
            return Err(StoreError::NotFound(format!("{}: kind not served", reference)));
        };
        api.delete(&reference.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(&reference.to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys_omit_core_group() {
        assert_eq!(gvk_key("", "v1", "ConfigMap"), "v1/ConfigMap");
        assert_eq!(gvk_key("apps", "v1", "Deployment"), "apps/v1/Deployment");
    }
}

// In-memory resource client
//
// Resources live in a map keyed by (namespace, name). Clones share the same
// map, so one client can be handed to the starter, the monitor and a test.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{next_resource_version, ResourceClient, StoreError, WriteOpts};
use crate::api::Resource;

#[derive(Debug, Clone)]
pub struct MemoryClient<T> {
    resources: Arc<RwLock<BTreeMap<(String, String), T>>>,
}

impl<T: Resource> MemoryClient<T> {
    pub fn new() -> Self {
        Self {
            resources: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Number of stored resources across all namespaces
    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }
}

impl<T: Resource> Default for MemoryClient<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Resource> ResourceClient<T> for MemoryClient<T> {
    async fn read(&self, namespace: &str, name: &str) -> Result<T, StoreError> {
        let resources = self.resources.read().await;
        resources
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::not_found(T::KIND, namespace, name))
    }

    async fn write(&self, mut resource: T, opts: WriteOpts) -> Result<T, StoreError> {
        let meta = resource.metadata();
        let key = (meta.namespace.clone(), meta.name.clone());
        if key.1.is_empty() {
            return Err(StoreError::InvalidName(key.1));
        }

        let mut resources = self.resources.write().await;
        let current_version = match resources.get(&key) {
            Some(_) if !opts.overwrite_existing => {
                return Err(StoreError::already_exists(T::KIND, &key.0, &key.1));
            }
            Some(existing) => existing.metadata().resource_version.clone(),
            None => String::new(),
        };

        resource.metadata_mut().resource_version = next_resource_version(&current_version);
        resources.insert(key, resource.clone());
        Ok(resource)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<T>, StoreError> {
        let resources = self.resources.read().await;
        Ok(resources
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |want| want == ns))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut resources = self.resources.write().await;
        resources
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(T::KIND, namespace, name))
    }
}

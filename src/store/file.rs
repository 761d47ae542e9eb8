// File-backed resource client
//
// Layout: <root>/<kind>/<namespace>/<name>.json, one pretty-printed JSON
// document per resource. Writes go to a temporary file that is renamed into
// place, so a crash never leaves a half-written experiment behind.

use async_trait::async_trait;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{next_resource_version, ResourceClient, StoreError, WriteOpts};
use crate::api::Resource;

#[derive(Debug, Clone)]
pub struct FileClient<T> {
    root: PathBuf,

    /// Serializes read-modify-write cycles on this client
    write_lock: Arc<Mutex<()>>,

    _kind: PhantomData<fn() -> T>,
}

impl<T: Resource> FileClient<T> {
    /// Create a client storing resources under `state_dir/<kind>`
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            root: state_dir.as_ref().join(T::KIND),
            write_lock: Arc::new(Mutex::new(())),
            _kind: PhantomData,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resource_path(&self, namespace: &str, name: &str) -> Result<PathBuf, StoreError> {
        validate_path_segment(namespace)?;
        validate_path_segment(name)?;
        Ok(self.root.join(namespace).join(format!("{}.json", name)))
    }

    async fn read_path(path: &Path) -> Result<Option<T>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_namespace(dir: &Path, out: &mut Vec<T>) -> Result<(), StoreError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            if let Some(resource) = Self::read_path(&path).await? {
                out.push(resource);
            }
        }
        Ok(())
    }
}

/// Names become path segments, so reject anything that could escape the root
fn validate_path_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
    {
        return Err(StoreError::InvalidName(segment.to_string()));
    }
    Ok(())
}

#[async_trait]
impl<T: Resource> ResourceClient<T> for FileClient<T> {
    async fn read(&self, namespace: &str, name: &str) -> Result<T, StoreError> {
        let path = self.resource_path(namespace, name)?;
        Self::read_path(&path)
            .await?
            .ok_or_else(|| StoreError::not_found(T::KIND, namespace, name))
    }

    async fn write(&self, mut resource: T, opts: WriteOpts) -> Result<T, StoreError> {
        let namespace = resource.metadata().namespace.clone();
        let name = resource.metadata().name.clone();
        let path = self.resource_path(&namespace, &name)?;

        let _guard = self.write_lock.lock().await;

        let current_version = match Self::read_path(&path).await? {
            Some(_) if !opts.overwrite_existing => {
                return Err(StoreError::already_exists(T::KIND, &namespace, &name));
            }
            Some(existing) => existing.metadata().resource_version.clone(),
            None => String::new(),
        };
        resource.metadata_mut().resource_version = next_resource_version(&current_version);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&resource)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(
            kind = T::KIND,
            namespace = %namespace,
            name = %name,
            version = %resource.metadata().resource_version,
            "Wrote resource"
        );
        Ok(resource)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();

        if let Some(ns) = namespace {
            validate_path_segment(ns)?;
            Self::list_namespace(&self.root.join(ns), &mut out).await?;
            return Ok(out);
        }

        let mut namespaces = Vec::new();
        match tokio::fs::read_dir(&self.root).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        namespaces.push(entry.path());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        }
        namespaces.sort();

        for dir in namespaces {
            Self::list_namespace(&dir, &mut out).await?;
        }
        Ok(out)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let path = self.resource_path(namespace, name)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::not_found(T::KIND, namespace, name))
            }
            Err(e) => Err(e.into()),
        }
    }
}

//! Resource Storage
//!
//! The controller reads experiments and writes experiment results and reports
//! through the [`ResourceClient`] trait. Two bindings ship with the crate:
//!
//! - [`MemoryClient`]: in-process map, used by tests and short-lived runs
//! - [`FileClient`]: one JSON document per resource under a state directory,
//!   so experiment progress survives a controller restart
//!
//! Writes are optimistic: with `overwrite_existing` set the last writer wins.
//! Only the controller mutates experiment results, and a single experiment is
//! monitored by at most one task at a time, so this is enough.

pub mod error;
pub mod file;
pub mod memory;

pub use error::StoreError;
pub use file::FileClient;
pub use memory::MemoryClient;

use async_trait::async_trait;
use std::sync::Arc;

use crate::api::{Experiment, Report, Resource};

/// Options for [`ResourceClient::write`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOpts {
    /// Replace a resource that already exists instead of failing
    pub overwrite_existing: bool,
}

impl WriteOpts {
    pub fn overwrite() -> Self {
        Self {
            overwrite_existing: true,
        }
    }
}

/// CRUD access to one kind of resource
#[async_trait]
pub trait ResourceClient<T: Resource>: Send + Sync {
    async fn read(&self, namespace: &str, name: &str) -> Result<T, StoreError>;

    /// Store `resource`, returning it with its new resource version
    async fn write(&self, resource: T, opts: WriteOpts) -> Result<T, StoreError>;

    /// List resources, optionally restricted to one namespace, sorted by namespace then name
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<T>, StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

pub type ExperimentClient = Arc<dyn ResourceClient<Experiment>>;
pub type ReportClient = Arc<dyn ResourceClient<Report>>;

/// Next resource version after `current` (empty means never written)
pub(crate) fn next_resource_version(current: &str) -> String {
    let n = current.parse::<u64>().unwrap_or(0);
    (n + 1).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_resource_version() {
        assert_eq!(next_resource_version(""), "1");
        assert_eq!(next_resource_version("1"), "2");
        assert_eq!(next_resource_version("garbage"), "1");
    }
}

//! Read access to the barman-cloud object store
//!
//! The operator never writes backups itself; the instance pods do. It only
//! lists and reads what they uploaded, to track backup completion and to
//! resolve point-in-time recovery targets.

pub mod catalog;
pub mod memory;
pub mod s3;

use std::sync::Arc;

use async_trait::async_trait;

use crate::controller::error::{Error, Result};
use crate::crd::ObjectStoreConfiguration;

pub use catalog::{BackupCatalog, BackupInfo, BarmanLocation};
pub use memory::{MemoryObjectStore, MemoryObjectStoreProvider};
pub use s3::S3ObjectStoreProvider;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Keys under `prefix`, in lexical order
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Object content, `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Opens a store for a cluster's object store configuration
#[async_trait]
pub trait ObjectStoreProvider: Send + Sync {
    async fn open(
        &self,
        namespace: &str,
        config: &ObjectStoreConfiguration,
    ) -> Result<Arc<dyn ObjectStore>>;
}

/// Split `s3://bucket/some/prefix` into bucket and prefix
pub fn parse_destination(destination: &str) -> Result<(String, String)> {
    let rest = destination
        .strip_prefix("s3://")
        .ok_or_else(|| Error::InvalidConfig(format!("destinationPath '{}' must start with s3://", destination)))?;
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "destinationPath '{}' has no bucket",
            destination
        )));
    }
    Ok((bucket.to_string(), prefix.trim_matches('/').to_string()))
}

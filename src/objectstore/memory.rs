use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{ObjectStore, ObjectStoreProvider, parse_destination};
use crate::controller::error::{Error, Result};
use crate::crd::ObjectStoreConfiguration;

/// In-process object store keyed by `bucket/key`
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(key.into(), data.into());
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut objects) = self.objects.write() {
            objects.remove(key);
        }
    }
}

fn poisoned() -> Error {
    Error::ObjectStoreError("memory store lock poisoned".to_string())
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(key).cloned())
    }
}

/// Hands out one [`MemoryObjectStore`] per bucket
#[derive(Clone, Default)]
pub struct MemoryObjectStoreProvider {
    buckets: Arc<RwLock<BTreeMap<String, MemoryObjectStore>>>,
}

impl MemoryObjectStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket(&self, name: &str) -> MemoryObjectStore {
        match self.buckets.write() {
            Ok(mut buckets) => buckets.entry(name.to_string()).or_default().clone(),
            Err(_) => MemoryObjectStore::new(),
        }
    }
}

#[async_trait]
impl ObjectStoreProvider for MemoryObjectStoreProvider {
    async fn open(
        &self,
        _namespace: &str,
        config: &ObjectStoreConfiguration,
    ) -> Result<Arc<dyn ObjectStore>> {
        let (bucket, _) = parse_destination(&config.destination_path)?;
        Ok(Arc::new(self.bucket(&bucket)))
    }
}

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{ObjectStore, StorageError};

/// In-memory object store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<(String, String), Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored in a bucket, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .read()
            .map(|objects| {
                objects
                    .keys()
                    .filter(|(b, _)| b == bucket)
                    .map(|(_, k)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn poisoned() -> StorageError {
    StorageError::Backend("object store lock poisoned".to_string())
}

impl ObjectStore for InMemoryObjectStore {
    fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        objects.insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::not_found(bucket, key))
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

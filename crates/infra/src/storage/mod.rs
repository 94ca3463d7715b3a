//! Live object storage and cold (archival) storage.
//!
//! - [`ObjectStore`]: bucket/key blob storage holding inputs and live results
//! - [`ColdStore`]: archival storage with asynchronous, two-phase retrieval

mod cold;
mod fs;
mod in_memory;

pub use cold::{ColdStore, ColdStoreError, InMemoryColdStore, RetrievalTier};
pub use fs::FsObjectStore;
pub use in_memory::InMemoryObjectStore;

use std::path::Path;
use std::sync::Arc;

/// Object storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("invalid object key: '{0}'")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub(crate) fn not_found(bucket: &str, key: &str) -> Self {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Bucket/key blob storage.
///
/// Deleting a missing object succeeds, so cleanup steps can be repeated on redelivery.
pub trait ObjectStore: Send + Sync {
    fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        match self.get(bucket, key) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Download an object into a local file, creating parent directories.
    fn download_to(&self, bucket: &str, key: &str, path: &Path) -> Result<(), StorageError> {
        let bytes = self.get(bucket, key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Upload a local file.
    fn upload_from(&self, bucket: &str, key: &str, path: &Path) -> Result<(), StorageError> {
        let bytes = std::fs::read(path)?;
        self.put(bucket, key, bytes)
    }
}

impl<S> ObjectStore for Arc<S>
where
    S: ObjectStore + ?Sized,
{
    fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        (**self).put(bucket, key, bytes)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        (**self).get(bucket, key)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        (**self).delete(bucket, key)
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        (**self).exists(bucket, key)
    }
}

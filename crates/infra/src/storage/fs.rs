//! Filesystem-backed object store: `{root}/{bucket}/{key}`.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use super::{ObjectStore, StorageError};

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(bucket).join(key);
        let plain = !bucket.is_empty()
            && !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(StorageError::InvalidKey(format!("{bucket}/{key}")));
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(bucket, key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        debug!(bucket, key, "object stored");
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(bucket, key)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::not_found(bucket, key),
            _ => StorageError::from(e),
        })
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(bucket, key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

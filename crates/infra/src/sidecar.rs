//! Auxiliary keyed store with expiry.
//!
//! Holds the two short-lived mappings the pipeline needs between steps:
//! - job id -> notification e-mail (dispatcher writes, reporter takes)
//! - retrieval job id -> result key (thaw Phase A writes, Phase B takes)

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use annotflow_core::Clock;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SidecarError {
    #[error("sidecar store lock poisoned")]
    Poisoned,

    #[error("sidecar backend error: {0}")]
    Backend(String),
}

/// Keyed string store whose entries expire after a fixed lifetime.
pub trait SidecarStore: Send + Sync {
    /// Insert or replace; the entry's lifetime restarts.
    fn put(&self, key: &str, value: String) -> Result<(), SidecarError>;

    /// Live value for `key`; expired entries read as absent.
    fn get(&self, key: &str) -> Result<Option<String>, SidecarError>;

    fn remove(&self, key: &str) -> Result<(), SidecarError>;

    /// Read and remove.
    fn take(&self, key: &str) -> Result<Option<String>, SidecarError> {
        let value = self.get(key)?;
        if value.is_some() {
            self.remove(key)?;
        }
        Ok(value)
    }
}

impl<S> SidecarStore for Arc<S>
where
    S: SidecarStore + ?Sized,
{
    fn put(&self, key: &str, value: String) -> Result<(), SidecarError> {
        (**self).put(key, value)
    }

    fn get(&self, key: &str) -> Result<Option<String>, SidecarError> {
        (**self).get(key)
    }

    fn remove(&self, key: &str) -> Result<(), SidecarError> {
        (**self).remove(key)
    }

    fn take(&self, key: &str) -> Result<Option<String>, SidecarError> {
        (**self).take(key)
    }
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-memory sidecar store; expired entries are swept on every write.
#[derive(Debug)]
pub struct InMemorySidecarStore {
    name: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemorySidecarStore {
    pub fn new(name: impl Into<String>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entries held, expired ones included until the next sweep.
    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, SidecarError> {
        self.entries.lock().map_err(|_| SidecarError::Poisoned)
    }
}

impl SidecarStore for InMemorySidecarStore {
    fn put(&self, key: &str, value: String) -> Result<(), SidecarError> {
        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut entries = self.lock()?;
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, SidecarError> {
        let now = self.clock.now();
        let entries = self.lock()?;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    fn remove(&self, key: &str) -> Result<(), SidecarError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn take(&self, key: &str) -> Result<Option<String>, SidecarError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        Ok(entries
            .remove(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value))
    }
}

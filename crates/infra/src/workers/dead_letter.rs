//! Dead-letter store for messages that cannot be processed.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A quarantined message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub queue: String,
    pub message_id: String,
    /// Raw message body, envelope included.
    pub body: String,
    pub reason: String,
    pub receive_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead-letter store error: {0}")]
    Storage(String),
}

pub trait DeadLetterStore: Send + Sync {
    fn record(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError>;

    /// Most recent entries first, optionally for one queue only.
    fn list(&self, queue: Option<&str>, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterError>;
}

impl<S> DeadLetterStore for Arc<S>
where
    S: DeadLetterStore + ?Sized,
{
    fn record(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        (**self).record(entry)
    }

    fn list(&self, queue: Option<&str>, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        (**self).list(queue, limit)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn record(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        self.entries
            .write()
            .map_err(|_| DeadLetterError::Storage("lock poisoned".to_string()))?
            .push(entry);
        Ok(())
    }

    fn list(&self, queue: Option<&str>, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| DeadLetterError::Storage("lock poisoned".to_string()))?;
        Ok(entries
            .iter()
            .rev()
            .filter(|e| queue.is_none_or(|q| e.queue == q))
            .take(limit)
            .cloned()
            .collect())
    }
}

//! Worker error taxonomy.
//!
//! - [`WorkerError::Malformed`]: the message can never be processed; it is
//!   dead-lettered and acknowledged
//! - every other variant is fatal for the current delivery: the message stays
//!   unacknowledged and is redelivered after its visibility timeout

use annotflow_core::DomainError;
use annotflow_events::{EnvelopeError, QueueError};

use crate::records::RecordStoreError;
use crate::sidecar::SidecarError;
use crate::storage::{ColdStoreError, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Records(#[from] RecordStoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    ColdStore(#[from] ColdStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Sidecar(#[from] SidecarError),

    #[error("notification failed: {0}")]
    Notify(String),

    #[error("failed to launch processing: {0}")]
    Launch(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, WorkerError::Malformed(_))
    }
}

impl From<EnvelopeError> for WorkerError {
    fn from(err: EnvelopeError) -> Self {
        WorkerError::Malformed(err.to_string())
    }
}

/// Domain validation failures surface while decoding message contents (ids, keys).
impl From<DomainError> for WorkerError {
    fn from(err: DomainError) -> Self {
        WorkerError::Malformed(err.to_string())
    }
}

//! Job Record Store: durable job state keyed by job id, with a secondary index by user
//! id and conditional, field-scoped updates.
//!
//! Every backend applies updates through [`JobRecord::apply`] after checking the
//! caller's [`Precondition`] against the stored row, so lifecycle invariants
//! (monotonic status, archive handle rules) hold no matter which store is wired in.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryJobRecordStore;
pub use postgres::PostgresJobRecordStore;

use std::sync::Arc;

use annotflow_core::{DomainError, JobId, JobRecord, Precondition, RecordUpdate, UserId};

/// Job record store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecordStoreError {
    #[error("job record not found: {0}")]
    NotFound(JobId),

    #[error("job record already exists: {0}")]
    AlreadyExists(JobId),

    /// The caller's precondition did not hold against the stored record.
    #[error("conditional update failed for job {0}")]
    ConditionFailed(JobId),

    /// The update would break a lifecycle invariant.
    #[error(transparent)]
    Invariant(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Job record persistence.
pub trait JobRecordStore: Send + Sync {
    /// Insert a new record; fails if the job id is taken.
    fn create(&self, record: JobRecord) -> Result<(), RecordStoreError>;

    fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, RecordStoreError>;

    /// All records owned by a user, oldest submission first.
    fn query_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, RecordStoreError>;

    /// Apply `update` if `precondition` holds against the stored record, atomically.
    ///
    /// Returns the record as stored after the update.
    fn update(
        &self,
        job_id: &JobId,
        update: RecordUpdate,
        precondition: Precondition,
    ) -> Result<JobRecord, RecordStoreError>;

    /// Like [`JobRecordStore::get`], but a missing record is an error.
    fn require(&self, job_id: &JobId) -> Result<JobRecord, RecordStoreError> {
        self.get(job_id)?
            .ok_or_else(|| RecordStoreError::NotFound(job_id.clone()))
    }
}

impl<S> JobRecordStore for Arc<S>
where
    S: JobRecordStore + ?Sized,
{
    fn create(&self, record: JobRecord) -> Result<(), RecordStoreError> {
        (**self).create(record)
    }

    fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, RecordStoreError> {
        (**self).get(job_id)
    }

    fn query_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, RecordStoreError> {
        (**self).query_by_user(user_id)
    }

    fn update(
        &self,
        job_id: &JobId,
        update: RecordUpdate,
        precondition: Precondition,
    ) -> Result<JobRecord, RecordStoreError> {
        (**self).update(job_id, update, precondition)
    }
}

/// Check the precondition, then apply the update to a locked copy of the record.
fn apply_conditionally(
    record: &mut JobRecord,
    update: &RecordUpdate,
    precondition: &Precondition,
) -> Result<(), RecordStoreError> {
    if !precondition.holds(record) {
        return Err(RecordStoreError::ConditionFailed(record.job_id.clone()));
    }
    record.apply(update)?;
    Ok(())
}

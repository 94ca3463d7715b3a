//! Read-side job queries for the front end: job lists and result availability.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use annotflow_core::{ArchiveHandle, Clock, JobId, JobRecord, JobStatus, Tier, UserId};

use crate::config::PipelineConfig;
use crate::records::{JobRecordStore, RecordStoreError};
use crate::storage::{ObjectStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// Unknown job, or a job owned by someone else.
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Records(#[from] RecordStoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Where a job's result can be read from right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultAvailability {
    /// Job has not completed.
    NotReady,
    /// Result is in live storage.
    Available,
    /// Result is in cold storage; an upgrade brings it back.
    Archived,
    /// Result is on its way back from cold storage.
    Restoring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobView {
    pub record: JobRecord,
    pub availability: ResultAvailability,
    /// Free-tier download window (the grace period after completion) has closed.
    pub free_access_expired: bool,
}

pub struct JobQueries {
    records: Arc<dyn JobRecordStore>,
    objects: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    grace_period: Duration,
}

impl JobQueries {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        objects: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            records,
            objects,
            clock,
            grace_period: config.grace_period,
        }
    }

    /// A user's jobs, most recent submission first.
    pub fn list_jobs(&self, user_id: &UserId) -> Result<Vec<JobRecord>, QueryError> {
        let mut jobs = self.records.query_by_user(user_id)?;
        jobs.reverse();
        Ok(jobs)
    }

    pub fn job_detail(&self, user_id: &UserId, job_id: &JobId) -> Result<JobView, QueryError> {
        let record = self
            .records
            .get(job_id)?
            .filter(|r| &r.user_id == user_id)
            .ok_or_else(|| QueryError::NotFound(job_id.clone()))?;

        let availability = self.availability(&record)?;
        let free_access_expired = record.tier == Tier::Free
            && record
                .grace_remaining(self.clock.epoch_seconds(), self.grace_period)
                .is_some_and(|left| left.is_zero());

        Ok(JobView {
            record,
            availability,
            free_access_expired,
        })
    }

    fn availability(&self, record: &JobRecord) -> Result<ResultAvailability, QueryError> {
        if record.job_status != JobStatus::Completed {
            return Ok(ResultAvailability::NotReady);
        }
        let (Some(bucket), Some(key)) = (&record.results_bucket, &record.result_key) else {
            return Ok(ResultAvailability::NotReady);
        };
        if self.objects.exists(bucket, key)? {
            return Ok(ResultAvailability::Available);
        }
        Ok(match (&record.archive_handle, record.tier) {
            (Some(ArchiveHandle::Archived(_)), Tier::Free) => ResultAvailability::Archived,
            _ => ResultAvailability::Restoring,
        })
    }
}

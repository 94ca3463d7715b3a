//! Archival Scheduler: moves results of archival-eligible jobs to cold storage once the
//! grace period after completion has passed.
//!
//! Waiting is done by deferring the completion message (queue visibility delay) rather
//! than by sleeping, so a job inside its grace period never occupies the worker.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use annotflow_core::{ArchiveHandle, ArchiveId, Clock, JobRecord, Precondition, RecordUpdate, ResultLocation};
use annotflow_events::JobCompletion;

use crate::config::PipelineConfig;
use crate::error::WorkerError;
use crate::records::{JobRecordStore, RecordStoreError};
use crate::scratch::ScratchDir;
use crate::storage::{ColdStore, ObjectStore};
use crate::workers::{MessageHandler, Outcome};

pub struct Archiver {
    records: Arc<dyn JobRecordStore>,
    objects: Arc<dyn ObjectStore>,
    cold: Arc<dyn ColdStore>,
    clock: Arc<dyn Clock>,
    scratch: ScratchDir,
    vault: String,
    grace_period: Duration,
    status_poll_interval: Duration,
}

impl Archiver {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        objects: Arc<dyn ObjectStore>,
        cold: Arc<dyn ColdStore>,
        clock: Arc<dyn Clock>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            records,
            objects,
            cold,
            clock,
            scratch: ScratchDir::new(&config.scratch_dir),
            vault: config.vault.clone(),
            grace_period: config.grace_period,
            status_poll_interval: config.status_poll_interval,
        }
    }

    fn archive(&self, record: &JobRecord) -> Result<(), WorkerError> {
        let job_id = &record.job_id;
        let (Some(bucket), Some(key)) = (&record.results_bucket, &record.result_key) else {
            return Err(WorkerError::malformed(format!(
                "completed job {job_id} has no result locator"
            )));
        };

        let location = ResultLocation::parse(key)?;
        let local = self.scratch.path_for(&location.file);
        self.objects.download_to(bucket, key, &local)?;
        let bytes = std::fs::read(&local)?;

        let archive_id = self.cold.upload_archive(&self.vault, bytes)?;
        let claimed = self.records.update(
            job_id,
            RecordUpdate::SetArchiveHandle(ArchiveHandle::Archived(archive_id.clone())),
            Precondition::All(vec![
                Precondition::TierIs(record.tier),
                Precondition::ArchiveHandleIs(None),
            ]),
        );

        let outcome = match claimed {
            Ok(_) => {
                info!(job_id = %job_id, archive_id = %archive_id, "result archived");
                // On failure the redelivery finds the handle set and retries the delete.
                self.objects.delete(bucket, key).map_err(WorkerError::from)
            }
            Err(RecordStoreError::ConditionFailed(_)) => {
                // Upgraded (or archived by another delivery) meanwhile: keep the live copy.
                self.cold.delete_archive(&self.vault, &archive_id)?;
                info!(job_id = %job_id, "record changed during archival; live result kept");
                Ok(())
            }
            Err(err) => {
                if let Err(cleanup) = self.cold.delete_archive(&self.vault, &archive_id) {
                    warn!(job_id = %job_id, archive_id = %archive_id, error = %cleanup, "orphaned archive");
                }
                Err(err.into())
            }
        };

        self.scratch.remove(&location.file);
        outcome
    }

    /// The archive is committed; make sure the live copy is gone too.
    fn drop_live_copy(&self, record: &JobRecord, archive_id: &ArchiveId) -> Result<(), WorkerError> {
        let (Some(bucket), Some(key)) = (&record.results_bucket, &record.result_key) else {
            return Ok(());
        };
        if self.objects.exists(bucket, key)? {
            self.objects.delete(bucket, key)?;
            info!(job_id = %record.job_id, archive_id = %archive_id, "stale live copy of archived result removed");
        } else {
            debug!(job_id = %record.job_id, "result already archived");
        }
        Ok(())
    }
}

impl MessageHandler for Archiver {
    type Payload = JobCompletion;

    fn name(&self) -> &'static str {
        "archiver"
    }

    fn handle(&self, completion: JobCompletion) -> Result<Outcome, WorkerError> {
        let job_id = &completion.job_id;
        let Some(record) = self.records.get(job_id)? else {
            warn!(job_id = %job_id, "completion for unknown job; ignoring");
            return Ok(Outcome::Done);
        };

        if !record.tier.is_archival_eligible() {
            debug!(job_id = %job_id, tier = record.tier.as_str(), "tier keeps results live");
            return Ok(Outcome::Done);
        }
        match &record.archive_handle {
            Some(ArchiveHandle::Archived(archive_id)) => {
                self.drop_live_copy(&record, archive_id)?;
                return Ok(Outcome::Done);
            }
            Some(ArchiveHandle::Restored) => {
                debug!(job_id = %job_id, "result restored; stays live");
                return Ok(Outcome::Done);
            }
            None => {}
        }

        match record.grace_remaining(self.clock.epoch_seconds(), self.grace_period) {
            None => {
                debug!(job_id = %job_id, status = %record.job_status, "job not completed yet");
                Ok(Outcome::RetryAfter(self.status_poll_interval))
            }
            Some(left) if !left.is_zero() => {
                debug!(job_id = %job_id, remaining_secs = left.as_secs(), "inside grace period");
                Ok(Outcome::RetryAfter(left))
            }
            Some(_) => {
                self.archive(&record)?;
                Ok(Outcome::Done)
            }
        }
    }
}

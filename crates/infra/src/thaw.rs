//! Retrieval Completion Handler: the two-phase cold-storage retrieval protocol.
//!
//! ```text
//! AwaitingInitiation --retrieval_accepted--> PendingRetrieval
//! PendingRetrieval --retrieval_completed(Succeeded)--> Restored
//! PendingRetrieval --retrieval_completed(other)--> PendingRetrieval
//! ```
//!
//! Phase A stores `retrieval_job_id -> (results_bucket, result_key)` in the retrieval
//! sidecar. Phase B uses it to put the retrieved bytes back at the original live key,
//! removes the cold copy, marks the record `"restored"` and leaves a `restored/` marker
//! behind so duplicate deliveries of either phase are dropped.
//!
//! A Phase B that finds neither entry is re-checked every status poll interval, at most
//! `max_deliveries` times, then dead-lettered.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use annotflow_core::{ArchiveHandle, Precondition, RecordUpdate, ResultLocation, RetrievalJobId};
use annotflow_events::{RetrievalAccepted, RetrievalCompleted, RetrievalStatus, ThawEvent};

use crate::config::PipelineConfig;
use crate::error::WorkerError;
use crate::records::{JobRecordStore, RecordStoreError};
use crate::scratch::ScratchDir;
use crate::sidecar::SidecarStore;
use crate::storage::{ColdStore, ObjectStore};
use crate::workers::{MessageHandler, Outcome};

/// Sidecar value written by Phase A.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PendingRestore {
    results_bucket: String,
    result_key: String,
}

fn restored_key(retrieval: &RetrievalJobId) -> String {
    format!("restored/{retrieval}")
}

fn waiting_key(retrieval: &RetrievalJobId) -> String {
    format!("waiting/{retrieval}")
}

pub struct ThawHandler {
    records: Arc<dyn JobRecordStore>,
    objects: Arc<dyn ObjectStore>,
    cold: Arc<dyn ColdStore>,
    retrievals: Arc<dyn SidecarStore>,
    scratch: ScratchDir,
    vault: String,
    results_bucket: String,
    status_poll_interval: Duration,
    max_waits: u32,
}

impl ThawHandler {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        objects: Arc<dyn ObjectStore>,
        cold: Arc<dyn ColdStore>,
        retrievals: Arc<dyn SidecarStore>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            records,
            objects,
            cold,
            retrievals,
            scratch: ScratchDir::new(&config.scratch_dir),
            vault: config.vault.clone(),
            results_bucket: config.results_bucket.clone(),
            status_poll_interval: config.status_poll_interval,
            max_waits: config.max_deliveries.max(1),
        }
    }

    fn accepted(&self, event: RetrievalAccepted) -> Result<Outcome, WorkerError> {
        let retrieval = &event.retrieval_job_id;
        if self.retrievals.get(&restored_key(retrieval))?.is_some() {
            info!(retrieval_job_id = %retrieval, "retrieval already restored; dropping duplicate acceptance");
            return Ok(Outcome::Done);
        }

        let pending = PendingRestore {
            results_bucket: if event.results_bucket.is_empty() {
                self.results_bucket.clone()
            } else {
                event.results_bucket
            },
            result_key: event.result_key,
        };
        let value = serde_json::to_string(&pending).map_err(|e| WorkerError::malformed(e.to_string()))?;
        self.retrievals.put(retrieval.as_str(), value)?;
        info!(
            retrieval_job_id = %retrieval,
            results_bucket = %pending.results_bucket,
            result_key = %pending.result_key,
            "retrieval pending"
        );
        Ok(Outcome::Done)
    }

    fn pending(&self, retrieval: &RetrievalJobId) -> Result<Option<PendingRestore>, WorkerError> {
        let Some(value) = self.retrievals.get(retrieval.as_str())? else {
            return Ok(None);
        };
        serde_json::from_str(&value)
            .map(Some)
            .map_err(|e| WorkerError::malformed(format!("pending retrieval {retrieval}: {e}")))
    }

    /// Phase B overtook Phase A, or Phase A's entry is gone.
    fn wait_for_acceptance(&self, retrieval: &RetrievalJobId) -> Result<Outcome, WorkerError> {
        let key = waiting_key(retrieval);
        let waited = self
            .retrievals
            .get(&key)?
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0)
            + 1;

        if waited >= self.max_waits {
            self.retrievals.remove(&key)?;
            return Err(WorkerError::malformed(format!(
                "no pending retrieval {retrieval} after {waited} checks"
            )));
        }

        self.retrievals.put(&key, waited.to_string())?;
        info!(retrieval_job_id = %retrieval, waited, "no pending retrieval yet; re-checking later");
        Ok(Outcome::RetryAfter(self.status_poll_interval))
    }

    fn completed(&self, event: RetrievalCompleted) -> Result<Outcome, WorkerError> {
        let retrieval = &event.retrieval_job_id;
        let Some(pending) = self.pending(retrieval)? else {
            if self.retrievals.get(&restored_key(retrieval))?.is_some() {
                info!(retrieval_job_id = %retrieval, "retrieval already restored; dropping duplicate completion");
                return Ok(Outcome::Done);
            }
            return self.wait_for_acceptance(retrieval);
        };

        if event.status != RetrievalStatus::Succeeded {
            warn!(
                retrieval_job_id = %retrieval,
                archive_id = %event.archive_handle,
                status = ?event.status,
                "retrieval did not succeed; result stays archived"
            );
            return Ok(Outcome::Done);
        }

        let location = ResultLocation::parse(&pending.result_key)?;
        let bytes = self.cold.retrieval_output(&self.vault, retrieval)?;
        let local = self.scratch.write(&location.file, &bytes)?;
        self.objects
            .upload_from(&pending.results_bucket, &pending.result_key, &local)?;
        self.cold.delete_archive(&self.vault, &event.archive_handle)?;
        self.scratch.remove(&location.file);

        let job_id = location.file.job_id();
        match self.records.update(
            job_id,
            RecordUpdate::SetArchiveHandle(ArchiveHandle::Restored),
            Precondition::ArchiveHandleIs(Some(event.expected_handle())),
        ) {
            Ok(_) => info!(
                job_id = %job_id,
                user_id = %location.user_id,
                archive_id = %event.archive_handle,
                results_bucket = %pending.results_bucket,
                "result restored"
            ),
            Err(RecordStoreError::ConditionFailed(_)) => {
                info!(job_id = %job_id, "record no longer holds this archive; already restored")
            }
            Err(err) => return Err(err.into()),
        }

        // The marker goes in before the mapping is dropped, so a failed write here is
        // retried with the mapping intact.
        self.retrievals
            .put(&restored_key(retrieval), event.archive_handle.to_string())?;
        self.retrievals.remove(&waiting_key(retrieval))?;
        self.retrievals.remove(retrieval.as_str())?;
        Ok(Outcome::Done)
    }
}

impl MessageHandler for ThawHandler {
    type Payload = ThawEvent;

    fn name(&self) -> &'static str {
        "thaw"
    }

    fn handle(&self, event: ThawEvent) -> Result<Outcome, WorkerError> {
        match event {
            ThawEvent::RetrievalAccepted(accepted) => self.accepted(accepted),
            ThawEvent::RetrievalCompleted(completed) => self.completed(completed),
        }
    }
}

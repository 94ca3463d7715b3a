//! Restoration after a tier upgrade.
//!
//! - [`RestoreInitiator`]: on a tier upgrade, marks the user's jobs premium and asks
//!   for every still-archived result to be retrieved
//! - [`RetrievalRequester`]: starts the cold-storage retrieval job for one result and
//!   announces it on the thaw topic (Phase A)

use std::sync::Arc;

use tracing::{info, warn};

use annotflow_core::{Precondition, RecordUpdate, Tier};
use annotflow_events::{RetrievalAccepted, RetrievalRequest, ThawEvent, TierUpgrade, Topic, publish_event};

use crate::config::PipelineConfig;
use crate::error::WorkerError;
use crate::records::JobRecordStore;
use crate::storage::{ColdStore, ColdStoreError, RetrievalTier};
use crate::workers::{MessageHandler, Outcome};

pub struct RestoreInitiator {
    records: Arc<dyn JobRecordStore>,
    retrieval_requests: Arc<dyn Topic>,
}

impl RestoreInitiator {
    pub fn new(records: Arc<dyn JobRecordStore>, retrieval_requests: Arc<dyn Topic>) -> Self {
        Self {
            records,
            retrieval_requests,
        }
    }
}

impl MessageHandler for RestoreInitiator {
    type Payload = TierUpgrade;

    fn name(&self) -> &'static str {
        "restore-initiator"
    }

    fn handle(&self, upgrade: TierUpgrade) -> Result<Outcome, WorkerError> {
        let user_id = &upgrade.user_id;
        let mut requested = 0usize;

        for record in self.records.query_by_user(user_id)? {
            let record = if record.tier == Tier::Premium {
                record
            } else {
                self.records.update(
                    &record.job_id,
                    RecordUpdate::SetTier(Tier::Premium),
                    Precondition::Always,
                )?
            };

            let Some(archive_id) = record.pending_archive() else {
                continue;
            };
            let (Some(result_key), Some(results_bucket)) = (&record.result_key, &record.results_bucket)
            else {
                warn!(job_id = %record.job_id, "archived job without result locator");
                continue;
            };

            publish_event(
                &self.retrieval_requests,
                &RetrievalRequest {
                    archive_handle: archive_id.clone(),
                    result_key: result_key.clone(),
                    results_bucket: results_bucket.clone(),
                },
            )?;
            requested += 1;
        }

        info!(user_id = %user_id, requested, "tier upgrade processed");
        Ok(Outcome::Done)
    }
}

pub struct RetrievalRequester {
    cold: Arc<dyn ColdStore>,
    thaw: Arc<dyn Topic>,
    vault: String,
}

impl RetrievalRequester {
    pub fn new(cold: Arc<dyn ColdStore>, thaw: Arc<dyn Topic>, config: &PipelineConfig) -> Self {
        Self {
            cold,
            thaw,
            vault: config.vault.clone(),
        }
    }
}

impl MessageHandler for RetrievalRequester {
    type Payload = RetrievalRequest;

    fn name(&self) -> &'static str {
        "retrieval-requester"
    }

    fn handle(&self, request: RetrievalRequest) -> Result<Outcome, WorkerError> {
        let archive = &request.archive_handle;

        let started = match self
            .cold
            .initiate_retrieval(&self.vault, archive, RetrievalTier::Expedited)
        {
            Err(ColdStoreError::InsufficientCapacity(_)) => {
                warn!(archive_id = %archive, "expedited retrieval unavailable; using standard");
                self.cold
                    .initiate_retrieval(&self.vault, archive, RetrievalTier::Standard)
            }
            other => other,
        };

        let retrieval_job_id = match started {
            Ok(id) => id,
            Err(ColdStoreError::ArchiveNotFound(_)) => {
                warn!(archive_id = %archive, "archive no longer exists; nothing to retrieve");
                return Ok(Outcome::Done);
            }
            Err(err) => return Err(err.into()),
        };

        publish_event(
            &self.thaw,
            &ThawEvent::from(RetrievalAccepted {
                retrieval_job_id: retrieval_job_id.clone(),
                result_key: request.result_key.clone(),
                results_bucket: request.results_bucket.clone(),
            }),
        )?;

        info!(
            archive_id = %archive,
            retrieval_job_id = %retrieval_job_id,
            result_key = %request.result_key,
            "retrieval requested"
        );
        Ok(Outcome::Done)
    }
}

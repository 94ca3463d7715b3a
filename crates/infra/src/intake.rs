//! Submission Intake: registers new jobs and announces them to the dispatcher.

use std::sync::Arc;

use tracing::{info, instrument};

use annotflow_core::{Clock, InputObject, JobFileName, JobId, JobRecord, KeyLayout, Tier, UserId};
use annotflow_events::{JobRequest, Topic, publish_event};

use crate::config::PipelineConfig;
use crate::error::WorkerError;
use crate::records::JobRecordStore;
use crate::storage::ObjectStore;

/// An input already staged in object storage by the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedInput {
    pub job_id: JobId,
    pub user_id: UserId,
    pub email: String,
    pub tier: Tier,
    pub input: InputObject,
}

/// An upload to stage and register in one go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub user_id: UserId,
    pub email: String,
    pub tier: Tier,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

pub struct SubmissionIntake {
    records: Arc<dyn JobRecordStore>,
    objects: Arc<dyn ObjectStore>,
    requests: Arc<dyn Topic>,
    clock: Arc<dyn Clock>,
    layout: KeyLayout,
    inputs_bucket: String,
}

impl SubmissionIntake {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        objects: Arc<dyn ObjectStore>,
        requests: Arc<dyn Topic>,
        clock: Arc<dyn Clock>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            records,
            objects,
            requests,
            clock,
            layout: config.key_layout(),
            inputs_bucket: config.inputs_bucket.clone(),
        }
    }

    /// Upload the input under `{prefix}/{user_id}/{job_id}~{file_name}`, then accept it.
    #[instrument(skip(self, submission), fields(user_id = %submission.user_id, file_name = %submission.file_name), err)]
    pub fn submit(&self, submission: Submission) -> Result<JobRecord, WorkerError> {
        let job_id = JobId::new();
        let file = JobFileName::new(job_id.clone(), submission.file_name.as_str())?;
        let key = self.layout.object_key(&submission.user_id, &file);
        self.objects.put(&self.inputs_bucket, &key, submission.bytes)?;

        self.accept(StagedInput {
            job_id,
            user_id: submission.user_id,
            email: submission.email,
            tier: submission.tier,
            input: InputObject {
                file_name: submission.file_name,
                bucket: self.inputs_bucket.clone(),
                key,
            },
        })
    }

    /// Create the PENDING record, then publish the job request.
    pub fn accept(&self, staged: StagedInput) -> Result<JobRecord, WorkerError> {
        let record = JobRecord::pending(
            staged.job_id,
            staged.user_id,
            staged.input,
            self.clock.epoch_seconds(),
            staged.email,
            staged.tier,
        );
        self.records.create(record.clone())?;
        publish_event(&self.requests, &JobRequest::from_record(&record))?;

        info!(
            job_id = %record.job_id,
            user_id = %record.user_id,
            tier = record.tier.as_str(),
            "job submitted"
        );
        Ok(record)
    }
}

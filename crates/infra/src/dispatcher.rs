//! Worker Dispatcher: turns job requests into running processing tasks.

use std::sync::Arc;

use tracing::{info, warn};

use annotflow_core::{JobFileName, JobStatus, Precondition, RecordUpdate};
use annotflow_events::JobRequest;

use crate::config::PipelineConfig;
use crate::error::WorkerError;
use crate::launcher::{LaunchRequest, ProcessLauncher};
use crate::records::{JobRecordStore, RecordStoreError};
use crate::scratch::ScratchDir;
use crate::sidecar::SidecarStore;
use crate::storage::{ObjectStore, StorageError};
use crate::workers::{MessageHandler, Outcome};

/// For each job request:
/// 1. remember the notification address (e-mail sidecar)
/// 2. fetch the input into scratch (a missing object is logged and tolerated)
/// 3. move the record `PENDING -> RUNNING` conditionally
/// 4. launch processing, only if this delivery won step 3
pub struct Dispatcher {
    records: Arc<dyn JobRecordStore>,
    objects: Arc<dyn ObjectStore>,
    emails: Arc<dyn SidecarStore>,
    launcher: Arc<dyn ProcessLauncher>,
    scratch: ScratchDir,
}

impl Dispatcher {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        objects: Arc<dyn ObjectStore>,
        emails: Arc<dyn SidecarStore>,
        launcher: Arc<dyn ProcessLauncher>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            records,
            objects,
            emails,
            launcher,
            scratch: ScratchDir::new(&config.scratch_dir),
        }
    }
}

impl MessageHandler for Dispatcher {
    type Payload = JobRequest;

    fn name(&self) -> &'static str {
        "dispatcher"
    }

    fn handle(&self, request: JobRequest) -> Result<Outcome, WorkerError> {
        let job_id = &request.job_id;
        self.emails.put(job_id.as_str(), request.email.clone())?;

        let input = JobFileName::new(job_id.clone(), request.input_file_name.as_str())?;
        let input_path = self.scratch.path_for(&input);
        match self
            .objects
            .download_to(&request.inputs_bucket, &request.input_key, &input_path)
        {
            Ok(()) => {}
            Err(err @ StorageError::NotFound { .. }) => {
                warn!(job_id = %job_id, error = %err, "input object missing; dispatching anyway");
            }
            Err(err) => return Err(err.into()),
        }

        match self.records.update(
            job_id,
            RecordUpdate::MarkRunning,
            Precondition::StatusIs(JobStatus::Pending),
        ) {
            Ok(_) => {}
            Err(RecordStoreError::ConditionFailed(_)) => {
                info!(job_id = %job_id, "job already dispatched; skipping launch");
                return Ok(Outcome::Done);
            }
            Err(err) => return Err(err.into()),
        }

        self.launcher.launch(LaunchRequest { input, input_path })?;
        info!(job_id = %job_id, user_id = %request.user_id, "job dispatched");
        Ok(Outcome::Done)
    }
}

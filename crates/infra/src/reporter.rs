//! Completion Reporter: publishes a finished job's artifacts and marks it COMPLETED.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use annotflow_core::{Clock, CompletionDetails, JobFileName, JobId, KeyLayout, Precondition, RecordUpdate};
use annotflow_events::{JobCompletion, Topic, publish_event};

use crate::config::PipelineConfig;
use crate::error::WorkerError;
use crate::records::JobRecordStore;
use crate::scratch::ScratchDir;
use crate::sidecar::SidecarStore;
use crate::storage::ObjectStore;

pub struct CompletionReporter {
    records: Arc<dyn JobRecordStore>,
    objects: Arc<dyn ObjectStore>,
    emails: Arc<dyn SidecarStore>,
    completions: Arc<dyn Topic>,
    clock: Arc<dyn Clock>,
    scratch: ScratchDir,
    layout: KeyLayout,
    results_bucket: String,
}

impl CompletionReporter {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        objects: Arc<dyn ObjectStore>,
        emails: Arc<dyn SidecarStore>,
        completions: Arc<dyn Topic>,
        clock: Arc<dyn Clock>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            records,
            objects,
            emails,
            completions,
            clock,
            scratch: ScratchDir::new(&config.scratch_dir),
            layout: config.key_layout(),
            results_bucket: config.results_bucket.clone(),
        }
    }

    /// Report a finished processing run for `input`.
    ///
    /// Expects `{job_id}~{stem}.annot.vcf` and `{job_id}~{stem}.vcf.count.log` next to
    /// the input in the scratch directory. The completion event goes out only after the
    /// record write committed.
    #[instrument(skip(self), fields(job_id = %input.job_id()), err)]
    pub fn report(&self, input: &JobFileName) -> Result<JobCompletion, WorkerError> {
        let job_id: &JobId = input.job_id();
        let record = self.records.require(job_id)?;

        let result = input.result_file();
        let log = input.log_file();
        let result_key = self.layout.object_key(&record.user_id, &result);
        let log_key = self.layout.object_key(&record.user_id, &log);

        self.objects
            .upload_from(&self.results_bucket, &result_key, &self.scratch.path_for(&result))?;
        self.objects
            .upload_from(&self.results_bucket, &log_key, &self.scratch.path_for(&log))?;

        for file in [input, &result, &log] {
            self.scratch.remove(file);
        }

        let details = CompletionDetails {
            results_bucket: self.results_bucket.clone(),
            result_key: result_key.clone(),
            log_key: log_key.clone(),
            complete_time: self.clock.epoch_seconds(),
        };
        let updated = self.records.update(
            job_id,
            RecordUpdate::MarkCompleted(details.clone()),
            Precondition::Always,
        )?;

        let email = match self.emails.take(job_id.as_str())? {
            Some(email) => email,
            None => {
                warn!(job_id = %job_id, "no e-mail sidecar entry; using the record's address");
                updated.email.clone()
            }
        };

        let completion = JobCompletion {
            job_id: job_id.clone(),
            user_id: updated.user_id.clone(),
            results_bucket: details.results_bucket,
            result_key,
            log_key,
            complete_time: details.complete_time,
            email,
            status: updated.job_status,
        };
        publish_event(&self.completions, &completion)?;

        info!(
            job_id = %job_id,
            user_id = %updated.user_id,
            complete_time = completion.complete_time,
            "job completed"
        );
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use annotflow_core::{InputObject, JobRecord, JobStatus, ManualClock, Tier, UserId};
    use annotflow_events::{Envelope, InMemoryQueue, InMemoryTopic, MessageQueue};

    use crate::records::InMemoryJobRecordStore;
    use crate::sidecar::InMemorySidecarStore;
    use crate::storage::InMemoryObjectStore;

    struct Fixture {
        reporter: CompletionReporter,
        records: Arc<InMemoryJobRecordStore>,
        objects: Arc<InMemoryObjectStore>,
        emails: Arc<InMemorySidecarStore>,
        completions: Arc<InMemoryQueue>,
        scratch: ScratchDir,
        config: PipelineConfig,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::default().with_scratch_dir(dir.path());
        let records = InMemoryJobRecordStore::arc();
        let objects = Arc::new(InMemoryObjectStore::new());
        let clock = Arc::new(ManualClock::at_epoch(1_700));
        let emails = Arc::new(InMemorySidecarStore::new("emails", Duration::from_secs(60), clock.clone()));
        let topic = Arc::new(InMemoryTopic::new("job-results"));
        let completions = Arc::new(InMemoryQueue::new("job-results"));
        topic.subscribe(completions.clone());
        let reporter = CompletionReporter::new(
            records.clone(),
            objects.clone(),
            emails.clone(),
            topic,
            clock,
            &config,
        );
        Fixture {
            reporter,
            records,
            objects,
            emails,
            completions,
            scratch: ScratchDir::new(dir.path()),
            config,
            _dir: dir,
        }
    }

    /// A running job `j1` of user `u1` whose input sits in scratch.
    fn running_job(f: &Fixture) -> JobFileName {
        let job_id = JobId::parse("j1").unwrap();
        f.records
            .create(JobRecord::pending(
                job_id.clone(),
                UserId::parse("u1").unwrap(),
                InputObject {
                    file_name: "in.vcf".to_string(),
                    bucket: "inputs".to_string(),
                    key: "p/u1/j1~in.vcf".to_string(),
                },
                0,
                "record@example.com",
                Tier::Free,
            ))
            .unwrap();
        f.records
            .update(&job_id, RecordUpdate::MarkRunning, Precondition::Always)
            .unwrap();

        let input = JobFileName::new(job_id, "in.vcf").unwrap();
        f.scratch.write(&input, b"##fileformat=VCFv4.2\n").unwrap();
        input
    }

    fn tool_output(f: &Fixture, input: &JobFileName) {
        f.scratch.write(&input.result_file(), b"annotated").unwrap();
        f.scratch.write(&input.log_file(), b"42 lines").unwrap();
    }

    fn published(f: &Fixture) -> Option<JobCompletion> {
        f.completions
            .receive(Duration::ZERO)
            .unwrap()
            .map(|msg| Envelope::open::<JobCompletion>(&msg.body).unwrap())
    }

    fn object_key(f: &Fixture, file: &JobFileName) -> String {
        f.config
            .key_layout()
            .object_key(&UserId::parse("u1").unwrap(), file)
    }

    #[test]
    fn report_uploads_marks_completed_and_publishes() {
        let f = fixture();
        let input = running_job(&f);
        tool_output(&f, &input);
        f.emails.put("j1", "sidecar@example.com".to_string()).unwrap();

        let completion = f.reporter.report(&input).unwrap();

        let result_key = object_key(&f, &input.result_file());
        let log_key = object_key(&f, &input.log_file());
        assert_eq!(f.objects.get(&f.config.results_bucket, &result_key).unwrap(), b"annotated");
        assert_eq!(f.objects.get(&f.config.results_bucket, &log_key).unwrap(), b"42 lines");
        for file in [&input, &input.result_file(), &input.log_file()] {
            assert!(!f.scratch.path_for(file).exists());
        }

        let record = f.records.require(input.job_id()).unwrap();
        assert_eq!(record.job_status, JobStatus::Completed);
        assert_eq!(record.result_key.as_deref(), Some(result_key.as_str()));
        assert_eq!(record.complete_time, Some(1_700));

        let event = published(&f).expect("completion published");
        assert_eq!(event, completion);
        assert_eq!(event.job_id.as_str(), "j1");
        assert_eq!(event.user_id.as_str(), "u1");
        assert_eq!(event.results_bucket, f.config.results_bucket);
        assert_eq!(event.result_key, result_key);
        assert_eq!(event.log_key, log_key);
        assert_eq!(event.complete_time, 1_700);
        assert_eq!(event.email, "sidecar@example.com");
        assert_eq!(event.status, JobStatus::Completed);

        // The sidecar entry is consumed.
        assert!(f.emails.get("j1").unwrap().is_none());
    }

    #[test]
    fn missing_sidecar_falls_back_to_the_record_email() {
        let f = fixture();
        let input = running_job(&f);
        tool_output(&f, &input);

        let completion = f.reporter.report(&input).unwrap();

        assert_eq!(completion.email, "record@example.com");
        assert_eq!(published(&f).unwrap().email, "record@example.com");
    }

    #[test]
    fn missing_tool_output_leaves_the_job_running() {
        let f = fixture();
        let input = running_job(&f);
        f.emails.put("j1", "sidecar@example.com".to_string()).unwrap();

        assert!(f.reporter.report(&input).is_err());

        let record = f.records.require(input.job_id()).unwrap();
        assert_eq!(record.job_status, JobStatus::Running);
        assert!(published(&f).is_none());
        assert!(f.emails.get("j1").unwrap().is_some());
        assert!(f.scratch.path_for(&input).exists());
    }
}

//! Integration tests for the whole pipeline, in-memory and clock-driven.
//!
//! Tests: Intake → Dispatcher → processing → Reporter → Archiver / Notifier, and the
//! restore path Tier upgrade → Restore initiator → Retrieval requester → Thaw handler.
//!
//! Verifies:
//! - Free-tier results are archived only once the grace period has elapsed
//! - An upgrade brings archived results back to live storage
//! - Duplicate job requests launch processing once
//! - Malformed messages are dead-lettered without blocking the queue

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use annotflow_core::{ArchiveHandle, Clock, JobRecord, JobStatus, ManualClock, Tier, UserId};
    use annotflow_events::{JobRequest, MessageQueue, publish_event};

    use crate::config::PipelineConfig;
    use crate::error::WorkerError;
    use crate::intake::Submission;
    use crate::launcher::{LaunchRequest, ProcessLauncher};
    use crate::notifier::RecordingNotifier;
    use crate::pipeline::{Channels, Pipeline, Services};
    use crate::queries::ResultAvailability;
    use crate::records::{InMemoryJobRecordStore, JobRecordStore};
    use crate::reporter::CompletionReporter;
    use crate::scratch::ScratchDir;
    use crate::storage::{InMemoryColdStore, InMemoryObjectStore, ObjectStore, RetrievalTier};
    use crate::workers::{DeadLetterStore, InMemoryDeadLetterStore};

    /// Stands in for the annotation tool: writes its outputs and reports right away.
    struct InlineAnnotator {
        scratch: ScratchDir,
        reporter: Arc<CompletionReporter>,
        launches: Arc<AtomicUsize>,
    }

    impl ProcessLauncher for InlineAnnotator {
        fn launch(&self, request: LaunchRequest) -> Result<(), WorkerError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let result = request.input.result_file();
            let log = request.input.log_file();
            self.scratch.write(&result, b"##fileformat=VCFv4.2\nannotated\n")?;
            self.scratch.write(&log, b"variants: 1\n")?;
            self.reporter.report(&request.input)?;
            Ok(())
        }
    }

    struct Harness {
        pipeline: Pipeline,
        clock: Arc<ManualClock>,
        objects: Arc<InMemoryObjectStore>,
        cold: Arc<InMemoryColdStore>,
        notifier: Arc<RecordingNotifier>,
        dead_letters: Arc<InMemoryDeadLetterStore>,
        launches: Arc<AtomicUsize>,
        _scratch: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let scratch = tempfile::tempdir().unwrap();
        let config = PipelineConfig::default()
            .with_key_prefix("annotflow")
            .with_scratch_dir(scratch.path())
            .with_queue_wait(Duration::ZERO);

        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        let channels = Channels::in_memory(clock.clone(), &config);
        let objects = Arc::new(InMemoryObjectStore::new());
        let cold = Arc::new(
            InMemoryColdStore::new(clock.clone())
                .with_notifications(channels.thaw.clone())
                .with_latency(RetrievalTier::Expedited, Duration::from_secs(300)),
        );
        let notifier = Arc::new(RecordingNotifier::new());
        let dead_letters = InMemoryDeadLetterStore::arc();
        let launches = Arc::new(AtomicUsize::new(0));

        let services = Services {
            records: InMemoryJobRecordStore::arc(),
            objects: objects.clone(),
            cold: cold.clone(),
            notifier: notifier.clone(),
            dead_letters: dead_letters.clone(),
            clock: clock.clone(),
        };

        let scratch_dir = ScratchDir::new(scratch.path());
        let counter = launches.clone();
        let pipeline = Pipeline::build(config, channels, services, move |reporter| {
            let launcher: Arc<dyn ProcessLauncher> = Arc::new(InlineAnnotator {
                scratch: scratch_dir,
                reporter,
                launches: counter,
            });
            launcher
        });

        Harness {
            pipeline,
            clock,
            objects,
            cold,
            notifier,
            dead_letters,
            launches,
            _scratch: scratch,
        }
    }

    fn submit(h: &Harness, user: &str, tier: Tier) -> JobRecord {
        h.pipeline
            .intake()
            .submit(Submission {
                user_id: UserId::parse(user).unwrap(),
                email: format!("{user}@example.org"),
                tier,
                file_name: "sample.vcf".to_string(),
                bytes: b"##fileformat=VCFv4.2\n".to_vec(),
            })
            .unwrap()
    }

    fn reload(h: &Harness, record: &JobRecord) -> JobRecord {
        h.pipeline
            .services()
            .records
            .require(&record.job_id)
            .unwrap()
    }

    fn live_result_exists(h: &Harness, record: &JobRecord) -> bool {
        let record = reload(h, record);
        h.objects
            .exists(
                record.results_bucket.as_deref().unwrap(),
                record.result_key.as_deref().unwrap(),
            )
            .unwrap()
    }

    #[test]
    fn free_job_completes_archives_after_grace_and_restores_on_upgrade() {
        let h = harness();
        let submitted = submit(&h, "u1", Tier::Free);
        assert_eq!(submitted.job_status, JobStatus::Pending);

        h.pipeline.run_until_idle().unwrap();

        let completed = reload(&h, &submitted);
        assert_eq!(completed.job_status, JobStatus::Completed);
        assert_eq!(completed.complete_time, Some(h.clock.epoch_seconds()));
        assert_eq!(
            completed.result_key.as_deref(),
            Some(format!("annotflow/u1/{}~sample.annot.vcf", submitted.job_id).as_str())
        );
        assert!(live_result_exists(&h, &submitted));

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "u1@example.org");

        // Still inside the grace period: nothing moves.
        h.clock.advance(Duration::from_secs(299));
        h.pipeline.run_until_idle().unwrap();
        assert!(live_result_exists(&h, &submitted));
        assert_eq!(reload(&h, &submitted).archive_handle, None);

        h.clock.advance(Duration::from_secs(2));
        h.pipeline.run_until_idle().unwrap();

        let archived = reload(&h, &submitted);
        let Some(ArchiveHandle::Archived(archive_id)) = archived.archive_handle.clone() else {
            panic!("expected an archive handle, got {:?}", archived.archive_handle);
        };
        assert!(h.cold.contains(&h.pipeline.config().vault, &archive_id));
        assert!(!live_result_exists(&h, &submitted));

        let user = UserId::parse("u1").unwrap();
        let view = h.pipeline.queries().job_detail(&user, &submitted.job_id).unwrap();
        assert_eq!(view.availability, ResultAvailability::Archived);
        assert!(view.free_access_expired);

        // Upgrade: Phase A is recorded, the retrieval is still running.
        h.pipeline.upgrade_tier(&user).unwrap();
        h.pipeline.run_until_idle().unwrap();

        let upgraded = reload(&h, &submitted);
        assert_eq!(upgraded.tier, Tier::Premium);
        let view = h.pipeline.queries().job_detail(&user, &submitted.job_id).unwrap();
        assert_eq!(view.availability, ResultAvailability::Restoring);

        // Phase B once the expedited retrieval is done.
        h.clock.advance(Duration::from_secs(300));
        assert_eq!(h.cold.tick().unwrap(), 1);
        h.pipeline.run_until_idle().unwrap();

        let restored = reload(&h, &submitted);
        assert_eq!(restored.archive_handle, Some(ArchiveHandle::Restored));
        assert!(live_result_exists(&h, &submitted));
        assert!(!h.cold.contains(&h.pipeline.config().vault, &archive_id));

        let view = h.pipeline.queries().job_detail(&user, &submitted.job_id).unwrap();
        assert_eq!(view.availability, ResultAvailability::Available);
        assert!(!view.free_access_expired);

        assert_eq!(h.launches.load(Ordering::SeqCst), 1);
        assert!(h.dead_letters.list(None, 10).unwrap().is_empty());
    }

    #[test]
    fn premium_results_stay_live() {
        let h = harness();
        let submitted = submit(&h, "u2", Tier::Premium);
        h.pipeline.run_until_idle().unwrap();

        h.clock.advance(Duration::from_secs(3_600));
        h.pipeline.run_until_idle().unwrap();

        let record = reload(&h, &submitted);
        assert_eq!(record.job_status, JobStatus::Completed);
        assert_eq!(record.archive_handle, None);
        assert!(live_result_exists(&h, &submitted));
        assert_eq!(h.cold.archive_count(), 0);
    }

    #[test]
    fn duplicate_job_request_launches_once() {
        let h = harness();
        let submitted = submit(&h, "u3", Tier::Premium);
        publish_event(
            &h.pipeline.channels().job_requests,
            &JobRequest::from_record(&submitted),
        )
        .unwrap();

        let stats = h.pipeline.run_until_idle().unwrap();

        assert_eq!(h.launches.load(Ordering::SeqCst), 1);
        assert_eq!(reload(&h, &submitted).job_status, JobStatus::Completed);
        assert_eq!(h.notifier.sent().len(), 1);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn concurrent_duplicate_requests_launch_once() {
        let h = harness();
        let submitted = submit(&h, "u6", Tier::Free);
        for _ in 0..3 {
            publish_event(
                &h.pipeline.channels().job_requests,
                &JobRequest::from_record(&submitted),
            )
            .unwrap();
        }

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| h.pipeline.run_until_idle().unwrap());
            }
        });

        assert_eq!(h.launches.load(Ordering::SeqCst), 1);
        assert_eq!(reload(&h, &submitted).job_status, JobStatus::Completed);
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[test]
    fn malformed_message_is_dead_lettered_and_the_queue_keeps_moving() {
        let h = harness();
        h.pipeline
            .channels()
            .dispatch
            .send("definitely not an envelope".to_string())
            .unwrap();
        let submitted = submit(&h, "u4", Tier::Premium);

        h.pipeline.run_until_idle().unwrap();

        let dead = h.dead_letters.list(Some("dispatch"), 10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, "definitely not an envelope");
        assert_eq!(reload(&h, &submitted).job_status, JobStatus::Completed);
    }

    #[test]
    fn jobs_are_listed_newest_first() {
        let h = harness();
        let first = submit(&h, "u5", Tier::Free);
        h.clock.advance(Duration::from_secs(10));
        let second = submit(&h, "u5", Tier::Free);
        submit(&h, "someone-else", Tier::Free);

        let jobs = h
            .pipeline
            .queries()
            .list_jobs(&UserId::parse("u5").unwrap())
            .unwrap();

        let ids: Vec<_> = jobs.iter().map(|j| j.job_id.clone()).collect();
        assert_eq!(ids, vec![second.job_id, first.job_id]);
    }
}

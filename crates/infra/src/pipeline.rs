//! Wiring of the whole pipeline: topics, queues, stores and one worker per component.
//!
//! ```text
//! intake ──▶ job-requests ──▶ dispatch ──▶ Dispatcher ──▶ launcher ──▶ CompletionReporter
//! CompletionReporter ──▶ completions ──┬▶ archive ──▶ Archiver
//!                                      └▶ notify  ──▶ NotificationDispatcher
//! tier-upgrades ──▶ restore ──▶ RestoreInitiator ──▶ retrieval-requests
//! retrieval-requests ──▶ retrieval ──▶ RetrievalRequester ──▶ thaw (Phase A)
//! cold store ──▶ thaw (Phase B)
//! thaw ──▶ thaw-events ──▶ ThawHandler
//! ```

use std::convert::Infallible;
use std::sync::Arc;

use tracing::info;

use annotflow_core::{Clock, UserId};
use annotflow_events::{
    InMemoryQueue, InMemoryTopic, MessageQueue, QueueError, TierUpgrade, Topic, publish_event,
};

use crate::archiver::Archiver;
use crate::config::PipelineConfig;
use crate::dispatcher::Dispatcher;
use crate::intake::SubmissionIntake;
use crate::launcher::ProcessLauncher;
use crate::notifier::{NotificationDispatcher, Notifier};
use crate::queries::JobQueries;
use crate::records::JobRecordStore;
use crate::reporter::CompletionReporter;
use crate::restore::{RestoreInitiator, RetrievalRequester};
use crate::sidecar::{InMemorySidecarStore, SidecarStore};
use crate::storage::{ColdStore, ObjectStore};
use crate::thaw::ThawHandler;
use crate::workers::{DeadLetterStore, Drain, DrainStats, QueueWorker, WorkerHandle, spawn_supervised};

const MAX_IDLE_ROUNDS: usize = 64;

/// Topics components publish to and the queues they consume from.
#[derive(Clone)]
pub struct Channels {
    pub job_requests: Arc<dyn Topic>,
    pub completions: Arc<dyn Topic>,
    pub tier_upgrades: Arc<dyn Topic>,
    pub retrieval_requests: Arc<dyn Topic>,
    pub thaw: Arc<dyn Topic>,

    pub dispatch: Arc<dyn MessageQueue>,
    pub archive: Arc<dyn MessageQueue>,
    pub notify: Arc<dyn MessageQueue>,
    pub restore: Arc<dyn MessageQueue>,
    pub retrieval: Arc<dyn MessageQueue>,
    pub thaw_events: Arc<dyn MessageQueue>,
}

impl Channels {
    /// In-process topics and queues, all on the given clock.
    pub fn in_memory(clock: Arc<dyn Clock>, config: &PipelineConfig) -> Self {
        let wired = Self::wire(|name| {
            let queue = InMemoryQueue::new(name)
                .with_clock(clock.clone())
                .with_visibility_timeout(config.visibility_timeout);
            Ok::<Arc<dyn MessageQueue>, Infallible>(Arc::new(queue))
        });
        match wired {
            Ok(channels) => channels,
            Err(never) => match never {},
        }
    }

    /// In-process fan-out onto queues built by `make_queue`.
    pub fn wire<F, E>(mut make_queue: F) -> Result<Self, E>
    where
        F: FnMut(&str) -> Result<Arc<dyn MessageQueue>, E>,
    {
        let dispatch = make_queue("dispatch")?;
        let archive = make_queue("archive")?;
        let notify = make_queue("notify")?;
        let restore = make_queue("restore")?;
        let retrieval = make_queue("retrieval")?;
        let thaw_events = make_queue("thaw-events")?;

        let topic = |name: &str, subscribers: &[&Arc<dyn MessageQueue>]| -> Arc<dyn Topic> {
            let topic = InMemoryTopic::new(name);
            for queue in subscribers {
                topic.subscribe((*queue).clone());
            }
            Arc::new(topic)
        };

        Ok(Self {
            job_requests: topic("job-requests", &[&dispatch]),
            completions: topic("completions", &[&archive, &notify]),
            tier_upgrades: topic("tier-upgrades", &[&restore]),
            retrieval_requests: topic("retrieval-requests", &[&retrieval]),
            thaw: topic("thaw", &[&thaw_events]),
            dispatch,
            archive,
            notify,
            restore,
            retrieval,
            thaw_events,
        })
    }
}

/// Stores and external collaborators shared by the components.
#[derive(Clone)]
pub struct Services {
    pub records: Arc<dyn JobRecordStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub cold: Arc<dyn ColdStore>,
    pub notifier: Arc<dyn Notifier>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub clock: Arc<dyn Clock>,
}

pub struct Pipeline {
    config: PipelineConfig,
    channels: Channels,
    services: Services,
    reporter: Arc<CompletionReporter>,
    workers: Vec<Arc<dyn Drain>>,
}

impl Pipeline {
    /// Build every component; `launcher` receives the reporter that processing runs
    /// must call when they finish.
    pub fn build<F>(config: PipelineConfig, channels: Channels, services: Services, launcher: F) -> Self
    where
        F: FnOnce(Arc<CompletionReporter>) -> Arc<dyn ProcessLauncher>,
    {
        let sidecar = |name: &str| -> Arc<dyn SidecarStore> {
            Arc::new(InMemorySidecarStore::new(
                name,
                config.sidecar_ttl,
                services.clock.clone(),
            ))
        };
        let emails = sidecar("emails");
        let retrievals = sidecar("retrievals");

        let reporter = Arc::new(CompletionReporter::new(
            services.records.clone(),
            services.objects.clone(),
            emails.clone(),
            channels.completions.clone(),
            services.clock.clone(),
            &config,
        ));
        let launcher = launcher(reporter.clone());

        let dead_letters = &services.dead_letters;
        let workers: Vec<Arc<dyn Drain>> = vec![
            Arc::new(QueueWorker::new(
                channels.dispatch.clone(),
                Dispatcher::new(
                    services.records.clone(),
                    services.objects.clone(),
                    emails,
                    launcher,
                    &config,
                ),
                dead_letters.clone(),
                &config,
            )),
            Arc::new(QueueWorker::new(
                channels.archive.clone(),
                Archiver::new(
                    services.records.clone(),
                    services.objects.clone(),
                    services.cold.clone(),
                    services.clock.clone(),
                    &config,
                ),
                dead_letters.clone(),
                &config,
            )),
            Arc::new(QueueWorker::new(
                channels.notify.clone(),
                NotificationDispatcher::new(services.notifier.clone()),
                dead_letters.clone(),
                &config,
            )),
            Arc::new(QueueWorker::new(
                channels.restore.clone(),
                RestoreInitiator::new(services.records.clone(), channels.retrieval_requests.clone()),
                dead_letters.clone(),
                &config,
            )),
            Arc::new(QueueWorker::new(
                channels.retrieval.clone(),
                RetrievalRequester::new(services.cold.clone(), channels.thaw.clone(), &config),
                dead_letters.clone(),
                &config,
            )),
            Arc::new(QueueWorker::new(
                channels.thaw_events.clone(),
                ThawHandler::new(
                    services.records.clone(),
                    services.objects.clone(),
                    services.cold.clone(),
                    retrievals,
                    &config,
                ),
                dead_letters.clone(),
                &config,
            )),
        ];

        Self {
            config,
            channels,
            services,
            reporter,
            workers,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn reporter(&self) -> &Arc<CompletionReporter> {
        &self.reporter
    }

    pub fn intake(&self) -> SubmissionIntake {
        SubmissionIntake::new(
            self.services.records.clone(),
            self.services.objects.clone(),
            self.channels.job_requests.clone(),
            self.services.clock.clone(),
            &self.config,
        )
    }

    pub fn queries(&self) -> JobQueries {
        JobQueries::new(
            self.services.records.clone(),
            self.services.objects.clone(),
            self.services.clock.clone(),
            &self.config,
        )
    }

    /// Announce that a user moved to a tier that keeps results live.
    pub fn upgrade_tier(&self, user_id: &UserId) -> Result<(), QueueError> {
        publish_event(
            &self.channels.tier_upgrades,
            &TierUpgrade {
                user_id: user_id.clone(),
            },
        )
    }

    /// Drain every worker in turn until a full round receives nothing.
    pub fn run_until_idle(&self) -> Result<DrainStats, QueueError> {
        let mut total = DrainStats::default();
        for _ in 0..MAX_IDLE_ROUNDS {
            let mut round = DrainStats::default();
            for worker in &self.workers {
                round += worker.drain()?;
            }
            total += round;
            if round.received == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// One supervised thread per component.
    pub fn spawn(&self) -> std::io::Result<Vec<WorkerHandle>> {
        let mut handles = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            match spawn_supervised(worker.clone(), self.config.retry.clone()) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    handles.into_iter().for_each(WorkerHandle::shutdown);
                    return Err(err);
                }
            }
        }
        info!(workers = handles.len(), "pipeline started");
        Ok(handles)
    }
}

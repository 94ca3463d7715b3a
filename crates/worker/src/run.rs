//! `run`: every component in one process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use annotflow_core::{Clock, SystemClock, UserId};
use annotflow_infra::intake::Submission;
use annotflow_infra::launcher::{CommandLauncher, ProcessLauncher};
use annotflow_infra::notifier::LogNotifier;
use annotflow_infra::records::{InMemoryJobRecordStore, JobRecordStore, PostgresJobRecordStore};
use annotflow_infra::storage::{FsObjectStore, InMemoryColdStore};
use annotflow_infra::workers::{InMemoryDeadLetterStore, WorkerHandle};
use annotflow_infra::{Channels, Pipeline, PipelineConfig, Services};

use crate::RunArgs;

pub(crate) async fn run(mut config: PipelineConfig, args: RunArgs) -> Result<()> {
    if let Some(dir) = &args.scratch_dir {
        config.scratch_dir = dir.clone();
    }
    tokio::fs::create_dir_all(&config.scratch_dir)
        .await
        .with_context(|| format!("creating scratch dir {}", config.scratch_dir.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let channels = channels(&args, clock.clone(), &config)?;

    let records: Arc<dyn JobRecordStore> = match &args.database_url {
        Some(url) => Arc::new(
            PostgresJobRecordStore::connect(url)
                .await
                .context("connecting to the job record database")?,
        ),
        None => {
            warn!("no database url; job records are kept in memory");
            InMemoryJobRecordStore::arc()
        }
    };

    let cold = Arc::new(InMemoryColdStore::new(clock.clone()).with_notifications(channels.thaw.clone()));
    let services = Services {
        records,
        objects: Arc::new(FsObjectStore::new(args.data_dir.join("objects"))),
        cold: cold.clone(),
        notifier: Arc::new(LogNotifier),
        dead_letters: InMemoryDeadLetterStore::arc(),
        clock,
    };

    let tool = args.tool.clone();
    let tool_args = args.tool_args.clone();
    let pipeline = Arc::new(Pipeline::build(config, channels, services, move |reporter| {
        let launcher: Arc<dyn ProcessLauncher> =
            Arc::new(CommandLauncher::new(tool, reporter).with_args(tool_args));
        launcher
    }));

    let handles = pipeline.spawn().context("starting workers")?;

    let tick_every = Duration::from_secs(args.cold_tick_secs.max(1));
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_every);
        loop {
            interval.tick().await;
            let cold = cold.clone();
            match tokio::task::spawn_blocking(move || cold.tick()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => info!(retrievals = n, "cold storage retrievals finished"),
                Ok(Err(err)) => warn!(error = %err, "publishing retrieval completion failed"),
                Err(err) => error!(error = %err, "cold storage tick panicked"),
            }
        }
    });

    submit_files(&pipeline, &args).await;

    info!("running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");

    ticker.abort();
    tokio::task::spawn_blocking(move || handles.into_iter().for_each(WorkerHandle::shutdown))
        .await
        .context("joining workers")?;
    Ok(())
}

#[cfg(not(feature = "redis"))]
fn channels(_args: &RunArgs, clock: Arc<dyn Clock>, config: &PipelineConfig) -> Result<Channels> {
    Ok(Channels::in_memory(clock, config))
}

#[cfg(feature = "redis")]
fn channels(args: &RunArgs, clock: Arc<dyn Clock>, config: &PipelineConfig) -> Result<Channels> {
    use annotflow_events::MessageQueue;
    use annotflow_infra::event_bus::RedisStreamsQueue;

    let Some(url) = &args.redis_url else {
        return Ok(Channels::in_memory(clock, config));
    };
    let channels = Channels::wire(|name| {
        let queue = RedisStreamsQueue::open(url, &config.key_prefix, name, config.visibility_timeout)?;
        Ok::<Arc<dyn MessageQueue>, annotflow_events::QueueError>(Arc::new(queue))
    })
    .context("opening redis queues")?;
    Ok(channels)
}

/// Submit each file given on the command line; failures are logged and skipped.
async fn submit_files(pipeline: &Arc<Pipeline>, args: &RunArgs) {
    if args.submit.is_empty() {
        return;
    }
    let user_id = match UserId::parse(args.user.as_str()) {
        Ok(id) => id,
        Err(err) => {
            error!(user = %args.user, error = %err, "invalid user; nothing submitted");
            return;
        }
    };

    for path in &args.submit {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            warn!(path = %path.display(), "not a file path; skipped");
            continue;
        };
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(path = %path.display(), error = %err, "cannot read input");
                continue;
            }
        };

        let submission = Submission {
            user_id: user_id.clone(),
            email: args.email.clone(),
            tier: args.tier.into(),
            file_name,
            bytes,
        };
        // Record stores may block on the runtime; keep them off async threads.
        let intake = pipeline.intake();
        match tokio::task::spawn_blocking(move || intake.submit(submission)).await {
            Ok(Ok(record)) => info!(job_id = %record.job_id, path = %path.display(), "submitted"),
            Ok(Err(err)) => error!(path = %path.display(), error = %err, "submission failed"),
            Err(err) => error!(path = %path.display(), error = %err, "submission task panicked"),
        }
    }
}

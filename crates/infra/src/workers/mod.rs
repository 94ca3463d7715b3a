//! Supervised queue workers.
//!
//! Every pipeline component runs as one long-lived worker thread:
//! - the thread drains its queue until a receive comes back empty
//! - then immediately starts the next drain cycle (the long-poll wait paces it)
//! - consecutive failing cycles back off according to the [`RetryPolicy`]
//! - [`WorkerHandle::shutdown`] stops the loop between messages and joins the thread

mod consumer;
mod dead_letter;
mod retry;

pub use consumer::{Disposition, Drain, DrainStats, MessageHandler, Outcome, QueueWorker};
pub use dead_letter::{DeadLetterEntry, DeadLetterError, DeadLetterStore, InMemoryDeadLetterStore};
pub use retry::{BackoffStrategy, RetryPolicy};

use std::cell::Cell;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread;

use tracing::{info, warn};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Spawn a supervised drain loop for `worker` on its own named thread.
pub fn spawn_supervised(worker: Arc<dyn Drain>, retry: RetryPolicy) -> std::io::Result<WorkerHandle> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let name = worker.name().to_string();

    let join = thread::Builder::new()
        .name(name.clone())
        .spawn(move || supervise(worker.as_ref(), &retry, &shutdown_rx))?;

    Ok(WorkerHandle {
        name,
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

fn supervise(worker: &dyn Drain, retry: &RetryPolicy, shutdown_rx: &mpsc::Receiver<()>) {
    let name = worker.name().to_string();
    let stopped = Cell::new(false);
    let stop_requested = || {
        if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
            stopped.set(true);
        }
        stopped.get()
    };
    let mut consecutive_failures: u32 = 0;

    info!(worker = %name, "worker started");
    while !stop_requested() {
        let failed = match worker.drain_with(&stop_requested) {
            Ok(stats) => stats.failed > 0,
            Err(err) => {
                warn!(worker = %name, error = %err, "queue unavailable");
                true
            }
        };

        if failed {
            consecutive_failures = consecutive_failures.saturating_add(1);
        } else {
            consecutive_failures = 0;
        }

        if stopped.get() {
            break;
        }
        let pause = retry.delay_for_attempt(consecutive_failures);
        if pause.is_zero() {
            continue;
        }
        match shutdown_rx.recv_timeout(pause) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    info!(worker = %name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use annotflow_events::{Envelope, InMemoryQueue, MessageQueue};
    use serde::Deserialize;

    use crate::config::PipelineConfig;
    use crate::error::WorkerError;

    #[derive(Deserialize)]
    struct Unit {}

    struct Counter(std::sync::atomic::AtomicUsize);

    impl MessageHandler for Counter {
        type Payload = Unit;

        fn name(&self) -> &'static str {
            "counter"
        }

        fn handle(&self, _: Unit) -> Result<Outcome, WorkerError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Outcome::Done)
        }
    }

    #[test]
    fn supervised_worker_processes_messages_and_shuts_down() {
        let queue = Arc::new(InMemoryQueue::new("units"));
        let config = PipelineConfig::default().with_queue_wait(Duration::from_millis(20));
        let worker = Arc::new(QueueWorker::new(
            queue.clone(),
            Counter(Default::default()),
            InMemoryDeadLetterStore::arc(),
            &config,
        ));

        let handle = spawn_supervised(worker.clone(), RetryPolicy::default()).unwrap();
        assert_eq!(handle.name(), "counter");
        for _ in 0..3 {
            queue.send(Envelope::wrap(&serde_json::json!({})).unwrap()).unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !queue.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();

        assert!(queue.is_empty());
        assert_eq!(worker.handler().0.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}

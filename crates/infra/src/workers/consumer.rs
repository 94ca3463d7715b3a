//! Queue consumer: receive, decode the double-wrapped envelope, dispatch, acknowledge.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use annotflow_events::{Envelope, MessageQueue, QueueError, ReceivedMessage};

use crate::config::PipelineConfig;
use crate::error::WorkerError;

use super::dead_letter::{DeadLetterEntry, DeadLetterStore};

/// What a handler wants done with the message it just processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; acknowledge.
    Done,
    /// Not yet; hide the message for this long, then deliver it again.
    RetryAfter(Duration),
}

/// Typed message handler. Must be idempotent: delivery is at-least-once.
pub trait MessageHandler: Send + Sync {
    type Payload: DeserializeOwned;

    fn name(&self) -> &'static str;

    fn handle(&self, payload: Self::Payload) -> Result<Outcome, WorkerError>;
}

/// How one delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Deferred(Duration),
    DeadLettered,
    /// Handler failed; the message is left for redelivery.
    Failed,
}

/// Counters for one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub received: usize,
    pub acked: usize,
    pub deferred: usize,
    pub dead_lettered: usize,
    pub failed: usize,
}

impl DrainStats {
    fn count(&mut self, disposition: Disposition) {
        self.received += 1;
        match disposition {
            Disposition::Acked => self.acked += 1,
            Disposition::Deferred(_) => self.deferred += 1,
            Disposition::DeadLettered => self.dead_lettered += 1,
            Disposition::Failed => self.failed += 1,
        }
    }
}

impl std::ops::AddAssign for DrainStats {
    fn add_assign(&mut self, other: Self) {
        self.received += other.received;
        self.acked += other.acked;
        self.deferred += other.deferred;
        self.dead_lettered += other.dead_lettered;
        self.failed += other.failed;
    }
}

/// Something a supervisor can drain repeatedly.
pub trait Drain: Send + Sync {
    fn name(&self) -> &str;

    /// Process messages until a receive comes back empty or `should_stop` says so.
    fn drain_with(&self, should_stop: &dyn Fn() -> bool) -> Result<DrainStats, QueueError>;

    fn drain(&self) -> Result<DrainStats, QueueError> {
        self.drain_with(&|| false)
    }
}

/// Binds a [`MessageHandler`] to its queue.
pub struct QueueWorker<H> {
    queue: Arc<dyn MessageQueue>,
    handler: H,
    dead_letters: Arc<dyn DeadLetterStore>,
    wait: Duration,
    max_deliveries: u32,
}

impl<H> QueueWorker<H>
where
    H: MessageHandler,
{
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        handler: H,
        dead_letters: Arc<dyn DeadLetterStore>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            dead_letters,
            wait: config.queue_wait,
            max_deliveries: config.max_deliveries,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Handle one delivered message and settle it with the queue.
    pub fn process(&self, message: &ReceivedMessage) -> Result<Disposition, QueueError> {
        let worker = self.handler.name();

        if message.receive_count > self.max_deliveries {
            let reason = format!(
                "gave up after {} deliveries",
                message.receive_count.saturating_sub(1)
            );
            return self.dead_letter(message, reason);
        }

        let payload: H::Payload = match Envelope::open(&message.body) {
            Ok(payload) => payload,
            Err(err) => return self.dead_letter(message, err.to_string()),
        };

        match self.handler.handle(payload) {
            Ok(Outcome::Done) => {
                self.queue.ack(&message.receipt)?;
                debug!(worker, message_id = %message.message_id, "message processed");
                Ok(Disposition::Acked)
            }
            Ok(Outcome::RetryAfter(delay)) => {
                self.queue.defer(&message.receipt, delay)?;
                debug!(worker, message_id = %message.message_id, delay_secs = delay.as_secs(), "message deferred");
                Ok(Disposition::Deferred(delay))
            }
            Err(err) if err.is_malformed() => self.dead_letter(message, err.to_string()),
            Err(err) => {
                error!(
                    worker,
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    error = %err,
                    "message processing failed; leaving it for redelivery"
                );
                Ok(Disposition::Failed)
            }
        }
    }

    fn dead_letter(&self, message: &ReceivedMessage, reason: String) -> Result<Disposition, QueueError> {
        let worker = self.handler.name();
        warn!(worker, message_id = %message.message_id, reason = %reason, "dead-lettering message");

        let entry = DeadLetterEntry {
            queue: self.queue.name().to_string(),
            message_id: message.message_id.clone(),
            body: message.body.clone(),
            reason,
            receive_count: message.receive_count,
            dead_lettered_at: Utc::now(),
        };
        if let Err(err) = self.dead_letters.record(entry) {
            // Keep the message; it is quarantined again on its next delivery.
            error!(worker, message_id = %message.message_id, error = %err, "dead-letter store unavailable");
            return Ok(Disposition::Failed);
        }

        self.queue.ack(&message.receipt)?;
        Ok(Disposition::DeadLettered)
    }
}

impl<H> Drain for QueueWorker<H>
where
    H: MessageHandler,
{
    fn name(&self) -> &str {
        self.handler.name()
    }

    fn drain_with(&self, should_stop: &dyn Fn() -> bool) -> Result<DrainStats, QueueError> {
        let mut stats = DrainStats::default();

        while !should_stop() {
            let Some(message) = self.queue.receive(self.wait)? else {
                break;
            };
            stats.count(self.process(&message)?);
        }

        if stats.received > 0 {
            info!(
                worker = self.handler.name(),
                received = stats.received,
                acked = stats.acked,
                deferred = stats.deferred,
                dead_lettered = stats.dead_lettered,
                failed = stats.failed,
                "drain cycle finished"
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use annotflow_core::ManualClock;
    use annotflow_events::InMemoryQueue;
    use serde::Deserialize;

    use crate::workers::InMemoryDeadLetterStore;

    #[derive(Debug, Deserialize)]
    struct Ping {
        n: u32,
    }

    /// Acks even numbers, fails odd ones, defers zero.
    #[derive(Default)]
    struct Picky {
        seen: Mutex<Vec<u32>>,
    }

    impl MessageHandler for Picky {
        type Payload = Ping;

        fn name(&self) -> &'static str {
            "picky"
        }

        fn handle(&self, payload: Ping) -> Result<Outcome, WorkerError> {
            self.seen.lock().unwrap().push(payload.n);
            match payload.n {
                0 => Ok(Outcome::RetryAfter(Duration::from_secs(30))),
                n if n % 2 == 0 => Ok(Outcome::Done),
                _ => Err(WorkerError::Notify("odd".to_string())),
            }
        }
    }

    fn setup() -> (QueueWorker<Picky>, Arc<InMemoryQueue>, Arc<InMemoryDeadLetterStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch(0));
        let queue = Arc::new(
            InMemoryQueue::new("pings")
                .with_clock(clock.clone())
                .with_visibility_timeout(Duration::from_secs(60)),
        );
        let dead_letters = InMemoryDeadLetterStore::arc();
        let config = PipelineConfig::default()
            .with_queue_wait(Duration::ZERO)
            .with_max_deliveries(2);
        let worker = QueueWorker::new(queue.clone(), Picky::default(), dead_letters.clone(), &config);
        (worker, queue, dead_letters, clock)
    }

    fn send(queue: &InMemoryQueue, payload: serde_json::Value) {
        queue.send(Envelope::wrap(&payload).unwrap()).unwrap();
    }

    #[test]
    fn successful_message_is_acknowledged() {
        let (worker, queue, _, _) = setup();
        send(&queue, serde_json::json!({"n": 2}));

        let stats = worker.drain().unwrap();
        assert_eq!(stats.acked, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn malformed_message_is_dead_lettered_without_touching_others() {
        let (worker, queue, dead_letters, _) = setup();
        queue.send("not an envelope".to_string()).unwrap();
        send(&queue, serde_json::json!({"wrong": "shape"}));
        send(&queue, serde_json::json!({"n": 4}));

        let stats = worker.drain().unwrap();
        assert_eq!(stats.dead_lettered, 2);
        assert_eq!(stats.acked, 1);
        assert_eq!(*worker.handler().seen.lock().unwrap(), vec![4]);
        assert!(queue.is_empty());
        assert_eq!(dead_letters.list(Some("pings"), 10).unwrap().len(), 2);
    }

    #[test]
    fn failed_message_is_redelivered_then_quarantined() {
        let (worker, queue, dead_letters, clock) = setup();
        send(&queue, serde_json::json!({"n": 3}));

        assert_eq!(worker.drain().unwrap().failed, 1);
        assert_eq!(queue.len(), 1);

        clock.advance(Duration::from_secs(61));
        assert_eq!(worker.drain().unwrap().failed, 1);

        clock.advance(Duration::from_secs(61));
        assert_eq!(worker.drain().unwrap().dead_lettered, 1);
        assert!(queue.is_empty());
        assert_eq!(dead_letters.list(None, 10).unwrap()[0].receive_count, 3);
    }

    #[test]
    fn deferred_message_waits_for_its_delay() {
        let (worker, queue, _, clock) = setup();
        send(&queue, serde_json::json!({"n": 0}));

        assert_eq!(worker.drain().unwrap().deferred, 1);
        clock.advance(Duration::from_secs(29));
        assert_eq!(worker.drain().unwrap().received, 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(worker.drain().unwrap().deferred, 1);
    }
}

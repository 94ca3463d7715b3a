//! In-memory message queue for tests/dev and single-process deployments.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use annotflow_core::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::queue::{MessageQueue, QueueError, ReceiptHandle, ReceivedMessage};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Slot {
    message_id: String,
    body: String,
    visible_at: DateTime<Utc>,
    receipt: Option<ReceiptHandle>,
    receive_count: u32,
}

/// In-memory queue.
///
/// - Visibility is measured on an injected [`Clock`], so tests can move time forward
///   to trigger redelivery or the end of a deferral
/// - `receive` long-polls (real time) for up to the requested wait
/// - Each delivery issues a fresh receipt; receipts of earlier deliveries become stale
pub struct InMemoryQueue {
    name: String,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
    slots: Mutex<VecDeque<Slot>>,
    arrived: Condvar,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clock: Arc::new(SystemClock),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            slots: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Messages held by the queue, in flight or not.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages that a `receive` issued now would return.
    pub fn visible_len(&self) -> usize {
        let now = self.clock.now();
        self.lock()
            .map(|s| s.iter().filter(|slot| slot.visible_at <= now).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, VecDeque<Slot>>, QueueError> {
        self.slots.lock().map_err(|_| QueueError::Poisoned)
    }

    fn offset(&self, delay: Duration) -> DateTime<Utc> {
        let delta = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.clock
            .now()
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn take_visible(&self, slots: &mut VecDeque<Slot>) -> Option<ReceivedMessage> {
        let now = self.clock.now();
        let visibility_end = self.offset(self.visibility_timeout);
        let slot = slots.iter_mut().find(|slot| slot.visible_at <= now)?;

        let receipt = ReceiptHandle::new(Uuid::now_v7().to_string());
        slot.receipt = Some(receipt.clone());
        slot.visible_at = visibility_end;
        slot.receive_count += 1;

        Some(ReceivedMessage {
            message_id: slot.message_id.clone(),
            body: slot.body.clone(),
            receipt,
            receive_count: slot.receive_count,
        })
    }
}

impl core::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("name", &self.name)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("len", &self.len())
            .finish()
    }
}

impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, body: String) -> Result<(), QueueError> {
        let mut slots = self.lock()?;
        slots.push_back(Slot {
            message_id: Uuid::now_v7().to_string(),
            body,
            visible_at: self.clock.now(),
            receipt: None,
            receive_count: 0,
        });
        drop(slots);
        self.arrived.notify_all();
        Ok(())
    }

    fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        let mut slots = self.lock()?;

        loop {
            if let Some(message) = self.take_visible(&mut slots) {
                return Ok(Some(message));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            // Deferred messages become visible by clock, not by notification.
            let (guard, _) = self
                .arrived
                .wait_timeout(slots, remaining.min(POLL_SLICE))
                .map_err(|_| QueueError::Poisoned)?;
            slots = guard;
        }
    }

    fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut slots = self.lock()?;
        let idx = slots
            .iter()
            .position(|slot| slot.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))?;
        slots.remove(idx);
        Ok(())
    }

    fn defer(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError> {
        let visible_at = self.offset(delay);
        let mut slots = self.lock()?;
        let slot = slots
            .iter_mut()
            .find(|slot| slot.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))?;
        slot.visible_at = visible_at;
        slot.receive_count = slot.receive_count.saturating_sub(1);
        drop(slots);
        self.arrived.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annotflow_core::ManualClock;

    fn queue_with_clock() -> (InMemoryQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch(1_000));
        let queue = InMemoryQueue::new("q")
            .with_clock(clock.clone())
            .with_visibility_timeout(Duration::from_secs(30));
        (queue, clock)
    }

    #[test]
    fn received_message_is_hidden_until_acked_or_timed_out() {
        let (queue, clock) = queue_with_clock();
        queue.send("a".to_string()).unwrap();

        let first = queue.receive(Duration::ZERO).unwrap().unwrap();
        assert_eq!(first.receive_count, 1);
        assert!(queue.receive(Duration::ZERO).unwrap().is_none());

        clock.advance(Duration::from_secs(31));
        let second = queue.receive(Duration::ZERO).unwrap().unwrap();
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.receive_count, 2);

        // The first delivery's receipt is stale now.
        assert!(matches!(
            queue.ack(&first.receipt),
            Err(QueueError::UnknownReceipt(_))
        ));
        queue.ack(&second.receipt).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn deferred_message_reappears_after_delay() {
        let (queue, clock) = queue_with_clock();
        queue.send("a".to_string()).unwrap();

        let msg = queue.receive(Duration::ZERO).unwrap().unwrap();
        queue.defer(&msg.receipt, Duration::from_secs(300)).unwrap();

        clock.advance(Duration::from_secs(299));
        assert!(queue.receive(Duration::ZERO).unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        let again = queue.receive(Duration::ZERO).unwrap().unwrap();
        assert_eq!(again.body, "a");
        assert_eq!(again.receive_count, 1);
    }

    #[test]
    fn zero_defer_makes_message_visible_immediately() {
        let (queue, _clock) = queue_with_clock();
        queue.send("a".to_string()).unwrap();

        let msg = queue.receive(Duration::ZERO).unwrap().unwrap();
        queue.defer(&msg.receipt, Duration::ZERO).unwrap();
        assert_eq!(queue.visible_len(), 1);
    }

    #[test]
    fn long_poll_wakes_on_send() {
        let queue = Arc::new(InMemoryQueue::new("q"));
        let sender = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sender.send("late".to_string()).unwrap();
        });

        let msg = queue.receive(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(msg.unwrap().body, "late");
    }

    #[test]
    fn empty_receive_returns_none_after_wait() {
        let queue = InMemoryQueue::new("q");
        assert!(queue.receive(Duration::from_millis(10)).unwrap().is_none());
    }
}

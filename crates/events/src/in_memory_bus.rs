//! In-memory fan-out topic for tests/dev.

use std::sync::{Arc, RwLock};

use crate::bus::{Topic, wrap_body};
use crate::queue::{MessageQueue, QueueError};

/// In-memory topic.
///
/// - No IO / no async
/// - Fan-out to every subscribed queue, each getting its own envelope copy
/// - A failing subscriber does not stop delivery to the others; the first error is
///   reported after all subscribers were tried
pub struct InMemoryTopic {
    name: String,
    subscribers: RwLock<Vec<Arc<dyn MessageQueue>>>,
}

impl InMemoryTopic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Route future publications to `queue` as well.
    pub fn subscribe(&self, queue: Arc<dyn MessageQueue>) {
        // If the lock is poisoned the subscription is dropped; publishing reports it.
        if let Ok(mut subs) = self.subscribers.write() {
            subs.push(queue);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }
}

impl core::fmt::Debug for InMemoryTopic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryTopic")
            .field("name", &self.name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Topic for InMemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, payload: String) -> Result<(), QueueError> {
        let subs = self.subscribers.read().map_err(|_| QueueError::Poisoned)?;

        let mut first_error = None;
        for queue in subs.iter() {
            let body = wrap_body(payload.clone())?;
            if let Err(err) = queue.send(body) {
                tracing::warn!(topic = %self.name, queue = queue.name(), error = %err, "fan-out delivery failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::{Envelope, InMemoryQueue, publish_event};

    #[test]
    fn every_subscriber_gets_a_wrapped_copy() {
        let topic = InMemoryTopic::new("completions");
        let archive = Arc::new(InMemoryQueue::new("archive"));
        let notify = Arc::new(InMemoryQueue::new("notify"));
        topic.subscribe(archive.clone());
        topic.subscribe(notify.clone());

        publish_event(&topic, &serde_json::json!({"job_id": "j1"})).unwrap();

        for queue in [&archive, &notify] {
            let msg = queue.receive(Duration::ZERO).unwrap().unwrap();
            let payload: serde_json::Value = Envelope::open(&msg.body).unwrap();
            assert_eq!(payload["job_id"], "j1");
        }
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let topic = InMemoryTopic::new("empty");
        assert!(topic.publish("{}".to_string()).is_ok());
    }
}

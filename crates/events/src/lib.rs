//! Pipeline events and the queue/topic transport they travel on.
//!
//! - [`envelope`]: the double-wrapped wire format (transport envelope around an encoded
//!   logical payload)
//! - [`payload`]: logical payloads, one type per topic
//! - [`queue`] / [`bus`]: transport abstractions (point-to-point queues, fan-out topics)
//! - in-memory implementations for tests/dev and single-process deployments

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod in_memory_queue;
pub mod payload;
pub mod queue;

pub use bus::{Topic, publish_event};
pub use envelope::{Envelope, EnvelopeError};
pub use in_memory_bus::InMemoryTopic;
pub use in_memory_queue::InMemoryQueue;
pub use payload::{
    JobCompletion, JobRequest, RetrievalAccepted, RetrievalCompleted, RetrievalRequest,
    RetrievalStatus, ThawEvent, TierUpgrade,
};
pub use queue::{MessageQueue, QueueError, ReceiptHandle, ReceivedMessage};

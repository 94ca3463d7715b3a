//! Point-to-point message queue abstraction (mechanics only).
//!
//! Queues provide **at-least-once** delivery:
//!
//! - a received message becomes invisible for a visibility timeout
//! - it is removed only when explicitly acknowledged with its receipt
//! - an unacknowledged message reappears after the timeout (redelivery)
//! - [`MessageQueue::defer`] pushes a received message's reappearance out by a chosen
//!   delay, which is how workers wait without holding their processing slot
//!
//! Consumers must be idempotent: a message may be delivered more than once.

use std::sync::Arc;
use std::time::Duration;

/// Queue transport error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// Receipt no longer refers to an in-flight message (acked or redelivered).
    #[error("unknown or expired receipt: {0}")]
    UnknownReceipt(String),

    /// Internal lock poisoning (in-memory implementations).
    #[error("queue state poisoned")]
    Poisoned,

    /// Backend transport failure (connection, command error, ...).
    #[error("transport error: {0}")]
    Transport(String),
}

/// Opaque token identifying one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A delivered message.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    pub receipt: ReceiptHandle,
    /// Deliveries so far, this one included; deliveries that ended in a deferral do not
    /// count.
    pub receive_count: u32,
}

/// Point-to-point queue with explicit acknowledgement.
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue a raw message body.
    fn send(&self, body: String) -> Result<(), QueueError>;

    /// Long-poll for at most one message, waiting up to `wait`.
    fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Acknowledge (delete) a delivered message.
    fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Keep a delivered message but hide it for `delay` before redelivery, without the
    /// delivery counting toward its receive count.
    fn defer(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError>;
}

impl<Q> MessageQueue for Arc<Q>
where
    Q: MessageQueue + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn send(&self, body: String) -> Result<(), QueueError> {
        (**self).send(body)
    }

    fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>, QueueError> {
        (**self).receive(wait)
    }

    fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        (**self).ack(receipt)
    }

    fn defer(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError> {
        (**self).defer(receipt, delay)
    }
}

//! Fan-out topics (mechanics only).
//!
//! A topic wraps each published payload in a transport [`Envelope`] and delivers a copy
//! to every subscribed queue. Components never talk to each other directly; they
//! publish to topics and consume from their own queue:
//!
//! ```text
//! intake ──▶ job-requests ──▶ [dispatcher queue]
//! reporter ──▶ completions ──┬▶ [archive queue]
//!                            └▶ [notify queue]
//! restore ──▶ retrieval-requests ──▶ [retrieval queue]
//! requester / cold store ──▶ thaw ──▶ [thaw queue]
//! ```
//!
//! Delivery is at-least-once; publication after a committed record write may be
//! retried by the caller, which can duplicate messages downstream.

use std::sync::Arc;

use serde::Serialize;

use crate::envelope::Envelope;
use crate::queue::QueueError;

/// Publish side of a fan-out topic.
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    /// Publish an already-encoded logical payload.
    fn publish(&self, payload: String) -> Result<(), QueueError>;
}

impl<T> Topic for Arc<T>
where
    T: Topic + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn publish(&self, payload: String) -> Result<(), QueueError> {
        (**self).publish(payload)
    }
}

/// Encode a typed payload and publish it.
pub fn publish_event<T, P>(topic: &T, payload: &P) -> Result<(), QueueError>
where
    T: Topic + ?Sized,
    P: Serialize,
{
    let encoded =
        serde_json::to_string(payload).map_err(|e| QueueError::Transport(e.to_string()))?;
    topic.publish(encoded)
}

/// Wrap an encoded payload into a full message body.
pub(crate) fn wrap_body(payload: String) -> Result<String, QueueError> {
    Envelope::new(payload)
        .into_body()
        .map_err(|e| QueueError::Transport(e.to_string()))
}

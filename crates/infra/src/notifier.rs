//! Notification Dispatcher: tells job owners their results are ready.

use std::sync::{Arc, Mutex};

use tracing::info;

use annotflow_events::JobCompletion;

use crate::error::WorkerError;
use crate::workers::{MessageHandler, Outcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn job_completed(completion: &JobCompletion) -> Self {
        Self {
            recipient: completion.email.clone(),
            subject: format!("Results available for job {}", completion.job_id),
            body: format!(
                "Your job {} completed at {} (epoch seconds).\nResults: {}/{}\nLog: {}/{}\n",
                completion.job_id,
                completion.complete_time,
                completion.results_bucket,
                completion.result_key,
                completion.results_bucket,
                completion.log_key,
            ),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to notify {recipient}: {reason}")]
pub struct NotifyError {
    pub recipient: String,
    pub reason: String,
}

/// Delivery channel (e-mail gateway, ...).
pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        (**self).send(notification)
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            recipient = %notification.recipient,
            subject = %notification.subject,
            "notification sent"
        );
        Ok(())
    }
}

/// Keeps sent notifications in memory for tests/dev.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .map_err(|_| NotifyError {
                recipient: notification.recipient.clone(),
                reason: "recorder poisoned".to_string(),
            })?
            .push(notification.clone());
        Ok(())
    }
}

pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

impl MessageHandler for NotificationDispatcher {
    type Payload = JobCompletion;

    fn name(&self) -> &'static str {
        "notifier"
    }

    fn handle(&self, completion: JobCompletion) -> Result<Outcome, WorkerError> {
        let notification = Notification::job_completed(&completion);
        self.notifier
            .send(&notification)
            .map_err(|e| WorkerError::Notify(e.to_string()))?;
        info!(job_id = %completion.job_id, user_id = %completion.user_id, "owner notified");
        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annotflow_core::{JobId, JobStatus, UserId};

    struct Unreachable;

    impl Notifier for Unreachable {
        fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            Err(NotifyError {
                recipient: notification.recipient.clone(),
                reason: "gateway down".to_string(),
            })
        }
    }

    fn completion() -> JobCompletion {
        JobCompletion {
            job_id: JobId::parse("j1").unwrap(),
            user_id: UserId::parse("u1").unwrap(),
            results_bucket: "results".to_string(),
            result_key: "p/u1/j1~in.annot.vcf".to_string(),
            log_key: "p/u1/j1~in.vcf.count.log".to_string(),
            complete_time: 42,
            email: "u1@example.com".to_string(),
            status: JobStatus::Completed,
        }
    }

    #[test]
    fn completion_notifies_the_owner() {
        let notifier = Arc::new(RecordingNotifier::new());
        let dispatcher = NotificationDispatcher::new(notifier.clone());

        assert_eq!(dispatcher.handle(completion()).unwrap(), Outcome::Done);

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "u1@example.com");
        assert!(sent[0].subject.contains("j1"));
    }

    #[test]
    fn send_failure_is_fatal_for_the_message() {
        let dispatcher = NotificationDispatcher::new(Arc::new(Unreachable));
        let err = dispatcher.handle(completion()).unwrap_err();
        assert!(!err.is_malformed());
    }
}

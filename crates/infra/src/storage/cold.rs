//! Cold (archival) storage with asynchronous retrieval.
//!
//! Retrieval is two-phase: `initiate_retrieval` returns a retrieval job id right away
//! (Phase A); the store later announces on its notification topic that the job
//! finished (Phase B), after which `retrieval_output` yields the bytes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use annotflow_core::{ArchiveId, Clock, RetrievalJobId};
use annotflow_events::{QueueError, RetrievalCompleted, RetrievalStatus, ThawEvent, Topic, publish_event};

/// Retrieval speed class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetrievalTier {
    Expedited,
    Standard,
    Bulk,
}

impl RetrievalTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalTier::Expedited => "Expedited",
            RetrievalTier::Standard => "Standard",
            RetrievalTier::Bulk => "Bulk",
        }
    }
}

/// Cold storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ColdStoreError {
    /// No capacity for the requested retrieval tier right now.
    #[error("insufficient capacity for {0:?} retrieval")]
    InsufficientCapacity(RetrievalTier),

    #[error("archive not found: {0}")]
    ArchiveNotFound(ArchiveId),

    #[error("retrieval job not found: {0}")]
    RetrievalNotFound(RetrievalJobId),

    #[error("retrieval job {0} has not completed")]
    NotReady(RetrievalJobId),

    #[error("cold storage backend error: {0}")]
    Backend(String),
}

/// Archival storage.
pub trait ColdStore: Send + Sync {
    fn upload_archive(&self, vault: &str, bytes: Vec<u8>) -> Result<ArchiveId, ColdStoreError>;

    /// Start an asynchronous retrieval (Phase A).
    fn initiate_retrieval(
        &self,
        vault: &str,
        archive: &ArchiveId,
        tier: RetrievalTier,
    ) -> Result<RetrievalJobId, ColdStoreError>;

    /// Bytes of a completed retrieval.
    fn retrieval_output(
        &self,
        vault: &str,
        retrieval: &RetrievalJobId,
    ) -> Result<Vec<u8>, ColdStoreError>;

    /// Delete an archive; deleting a missing archive succeeds.
    fn delete_archive(&self, vault: &str, archive: &ArchiveId) -> Result<(), ColdStoreError>;
}

impl<S> ColdStore for Arc<S>
where
    S: ColdStore + ?Sized,
{
    fn upload_archive(&self, vault: &str, bytes: Vec<u8>) -> Result<ArchiveId, ColdStoreError> {
        (**self).upload_archive(vault, bytes)
    }

    fn initiate_retrieval(
        &self,
        vault: &str,
        archive: &ArchiveId,
        tier: RetrievalTier,
    ) -> Result<RetrievalJobId, ColdStoreError> {
        (**self).initiate_retrieval(vault, archive, tier)
    }

    fn retrieval_output(
        &self,
        vault: &str,
        retrieval: &RetrievalJobId,
    ) -> Result<Vec<u8>, ColdStoreError> {
        (**self).retrieval_output(vault, retrieval)
    }

    fn delete_archive(&self, vault: &str, archive: &ArchiveId) -> Result<(), ColdStoreError> {
        (**self).delete_archive(vault, archive)
    }
}

#[derive(Debug)]
struct Retrieval {
    vault: String,
    archive: ArchiveId,
    tier: RetrievalTier,
    ready_at: i64,
    output: Option<Vec<u8>>,
    announced: bool,
}

#[derive(Debug, Default)]
struct Vaults {
    archives: HashMap<(String, ArchiveId), Vec<u8>>,
    retrievals: HashMap<RetrievalJobId, Retrieval>,
}

/// In-memory cold store for tests/dev.
///
/// Retrievals complete when [`InMemoryColdStore::tick`] runs after their latency has
/// elapsed on the injected clock; completion is announced on the notification topic as
/// a tagged `retrieval_completed` event.
pub struct InMemoryColdStore {
    clock: Arc<dyn Clock>,
    notifications: Option<Arc<dyn Topic>>,
    expedited_available: bool,
    latencies: HashMap<RetrievalTier, Duration>,
    vaults: Mutex<Vaults>,
}

impl InMemoryColdStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let latencies = HashMap::from([
            (RetrievalTier::Expedited, Duration::from_secs(5 * 60)),
            (RetrievalTier::Standard, Duration::from_secs(4 * 60 * 60)),
            (RetrievalTier::Bulk, Duration::from_secs(12 * 60 * 60)),
        ]);
        Self {
            clock,
            notifications: None,
            expedited_available: true,
            latencies,
            vaults: Mutex::new(Vaults::default()),
        }
    }

    /// Topic receiving Phase B (`retrieval_completed`) events.
    pub fn with_notifications(mut self, topic: Arc<dyn Topic>) -> Self {
        self.notifications = Some(topic);
        self
    }

    pub fn with_latency(mut self, tier: RetrievalTier, latency: Duration) -> Self {
        self.latencies.insert(tier, latency);
        self
    }

    /// Simulate exhausted expedited capacity.
    pub fn without_expedited_capacity(mut self) -> Self {
        self.expedited_available = false;
        self
    }

    pub fn contains(&self, vault: &str, archive: &ArchiveId) -> bool {
        self.lock()
            .map(|v| v.archives.contains_key(&(vault.to_string(), archive.clone())))
            .unwrap_or(false)
    }

    pub fn archive_count(&self) -> usize {
        self.lock().map(|v| v.archives.len()).unwrap_or(0)
    }

    /// Tier a retrieval job was started with.
    pub fn retrieval_tier(&self, retrieval: &RetrievalJobId) -> Option<RetrievalTier> {
        self.lock()
            .ok()
            .and_then(|v| v.retrievals.get(retrieval).map(|r| r.tier))
    }

    /// Complete every retrieval whose latency has elapsed and announce it.
    ///
    /// Returns how many retrievals were announced.
    pub fn tick(&self) -> Result<usize, QueueError> {
        let now = self.clock.epoch_seconds();
        let mut finished = Vec::new();
        {
            let mut vaults = self.lock().map_err(|_| QueueError::Poisoned)?;
            let Vaults {
                archives,
                retrievals,
            } = &mut *vaults;

            for (id, retrieval) in retrievals.iter_mut() {
                if retrieval.announced || retrieval.ready_at > now {
                    continue;
                }
                retrieval.output = archives
                    .get(&(retrieval.vault.clone(), retrieval.archive.clone()))
                    .cloned();
                let status = if retrieval.output.is_some() {
                    RetrievalStatus::Succeeded
                } else {
                    RetrievalStatus::Failed
                };
                retrieval.announced = true;
                finished.push(RetrievalCompleted {
                    archive_handle: retrieval.archive.clone(),
                    retrieval_job_id: id.clone(),
                    status,
                });
            }
        }

        for event in &finished {
            info!(
                retrieval_job_id = %event.retrieval_job_id,
                archive_id = %event.archive_handle,
                status = ?event.status,
                "retrieval job finished"
            );
            match &self.notifications {
                Some(topic) => publish_event(topic, &ThawEvent::from(event.clone()))?,
                None => warn!(retrieval_job_id = %event.retrieval_job_id, "no notification topic configured"),
            }
        }
        Ok(finished.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vaults>, ColdStoreError> {
        self.vaults
            .lock()
            .map_err(|_| ColdStoreError::Backend("cold store lock poisoned".to_string()))
    }
}

impl core::fmt::Debug for InMemoryColdStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryColdStore")
            .field("archives", &self.archive_count())
            .field("expedited_available", &self.expedited_available)
            .finish()
    }
}

impl ColdStore for InMemoryColdStore {
    fn upload_archive(&self, vault: &str, bytes: Vec<u8>) -> Result<ArchiveId, ColdStoreError> {
        let id = ArchiveId::new();
        self.lock()?
            .archives
            .insert((vault.to_string(), id.clone()), bytes);
        Ok(id)
    }

    fn initiate_retrieval(
        &self,
        vault: &str,
        archive: &ArchiveId,
        tier: RetrievalTier,
    ) -> Result<RetrievalJobId, ColdStoreError> {
        if tier == RetrievalTier::Expedited && !self.expedited_available {
            return Err(ColdStoreError::InsufficientCapacity(tier));
        }

        let mut vaults = self.lock()?;
        if !vaults
            .archives
            .contains_key(&(vault.to_string(), archive.clone()))
        {
            return Err(ColdStoreError::ArchiveNotFound(archive.clone()));
        }

        let latency = self.latencies.get(&tier).copied().unwrap_or_default();
        let id = RetrievalJobId::new();
        vaults.retrievals.insert(
            id.clone(),
            Retrieval {
                vault: vault.to_string(),
                archive: archive.clone(),
                tier,
                ready_at: self.clock.epoch_seconds() + latency.as_secs() as i64,
                output: None,
                announced: false,
            },
        );
        Ok(id)
    }

    fn retrieval_output(
        &self,
        vault: &str,
        retrieval: &RetrievalJobId,
    ) -> Result<Vec<u8>, ColdStoreError> {
        let vaults = self.lock()?;
        let job = vaults
            .retrievals
            .get(retrieval)
            .filter(|r| r.vault == vault)
            .ok_or_else(|| ColdStoreError::RetrievalNotFound(retrieval.clone()))?;
        job.output
            .clone()
            .ok_or_else(|| ColdStoreError::NotReady(retrieval.clone()))
    }

    fn delete_archive(&self, vault: &str, archive: &ArchiveId) -> Result<(), ColdStoreError> {
        self.lock()?
            .archives
            .remove(&(vault.to_string(), archive.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annotflow_core::ManualClock;
    use annotflow_events::{Envelope, InMemoryQueue, InMemoryTopic, MessageQueue};

    fn setup() -> (InMemoryColdStore, Arc<ManualClock>, Arc<InMemoryQueue>) {
        let clock = Arc::new(ManualClock::at_epoch(0));
        let topic = Arc::new(InMemoryTopic::new("thaw"));
        let queue = Arc::new(InMemoryQueue::new("thaw").with_clock(clock.clone()));
        topic.subscribe(queue.clone());
        let store = InMemoryColdStore::new(clock.clone())
            .with_notifications(topic)
            .with_latency(RetrievalTier::Expedited, Duration::from_secs(60));
        (store, clock, queue)
    }

    #[test]
    fn retrieval_completes_after_latency_and_is_announced() {
        let (store, clock, queue) = setup();
        let archive = store.upload_archive("v", b"result".to_vec()).unwrap();
        let job = store
            .initiate_retrieval("v", &archive, RetrievalTier::Expedited)
            .unwrap();

        assert_eq!(store.tick().unwrap(), 0);
        assert!(matches!(
            store.retrieval_output("v", &job),
            Err(ColdStoreError::NotReady(_))
        ));

        clock.advance(Duration::from_secs(60));
        assert_eq!(store.tick().unwrap(), 1);
        assert_eq!(store.tick().unwrap(), 0);
        assert_eq!(store.retrieval_output("v", &job).unwrap(), b"result");

        let msg = queue.receive(Duration::ZERO).unwrap().unwrap();
        let event: ThawEvent = Envelope::open(&msg.body).unwrap();
        assert_eq!(
            event,
            ThawEvent::RetrievalCompleted(RetrievalCompleted {
                archive_handle: archive,
                retrieval_job_id: job,
                status: RetrievalStatus::Succeeded,
            })
        );
    }

    #[test]
    fn expedited_without_capacity_is_rejected() {
        let (store, _, _) = setup();
        let store = store.without_expedited_capacity();
        let archive = store.upload_archive("v", Vec::new()).unwrap();

        assert!(matches!(
            store.initiate_retrieval("v", &archive, RetrievalTier::Expedited),
            Err(ColdStoreError::InsufficientCapacity(RetrievalTier::Expedited))
        ));
        assert!(store
            .initiate_retrieval("v", &archive, RetrievalTier::Standard)
            .is_ok());
    }

    #[test]
    fn archive_deleted_before_completion_fails_the_retrieval() {
        let (store, clock, queue) = setup();
        let archive = store.upload_archive("v", b"x".to_vec()).unwrap();
        store
            .initiate_retrieval("v", &archive, RetrievalTier::Expedited)
            .unwrap();
        store.delete_archive("v", &archive).unwrap();

        clock.advance(Duration::from_secs(60));
        store.tick().unwrap();

        let msg = queue.receive(Duration::ZERO).unwrap().unwrap();
        let event: ThawEvent = Envelope::open(&msg.body).unwrap();
        assert!(matches!(
            event,
            ThawEvent::RetrievalCompleted(RetrievalCompleted {
                status: RetrievalStatus::Failed,
                ..
            })
        ));
    }
}

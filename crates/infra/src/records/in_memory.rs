use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use annotflow_core::{JobId, JobRecord, Precondition, RecordUpdate, UserId};

use super::{JobRecordStore, RecordStoreError, apply_conditionally};

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<JobId, JobRecord>,
    by_user: HashMap<UserId, BTreeSet<JobId>>,
}

/// In-memory job record store for tests/dev.
///
/// A single lock covers the read-check-write of an update, which gives the same
/// atomicity as a conditional write in a durable store.
#[derive(Debug, Default)]
pub struct InMemoryJobRecordStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> RecordStoreError {
    RecordStoreError::Storage("record store lock poisoned".to_string())
}

impl JobRecordStore for InMemoryJobRecordStore {
    fn create(&self, record: JobRecord) -> Result<(), RecordStoreError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        if tables.records.contains_key(&record.job_id) {
            return Err(RecordStoreError::AlreadyExists(record.job_id));
        }
        tables
            .by_user
            .entry(record.user_id.clone())
            .or_default()
            .insert(record.job_id.clone());
        tables.records.insert(record.job_id.clone(), record);
        Ok(())
    }

    fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, RecordStoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.records.get(job_id).cloned())
    }

    fn query_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, RecordStoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        let mut records: Vec<JobRecord> = tables
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.records.get(id).cloned())
            .collect();
        records.sort_by(|a, b| {
            a.submit_time
                .cmp(&b.submit_time)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(records)
    }

    fn update(
        &self,
        job_id: &JobId,
        update: RecordUpdate,
        precondition: Precondition,
    ) -> Result<JobRecord, RecordStoreError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let stored = tables
            .records
            .get_mut(job_id)
            .ok_or_else(|| RecordStoreError::NotFound(job_id.clone()))?;

        // Work on a copy so a rejected update leaves the stored row untouched.
        let mut next = stored.clone();
        apply_conditionally(&mut next, &update, &precondition)?;
        *stored = next.clone();
        Ok(next)
    }
}

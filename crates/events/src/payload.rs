//! Logical payloads, one per topic.
//!
//! Field names follow the wire contract shared with the web front end and the cold
//! storage notifier; aliases accept the older bucket/key spellings.

use serde::{Deserialize, Serialize};

use annotflow_core::{
    ArchiveHandle, ArchiveId, JobId, JobRecord, JobStatus, RetrievalJobId, Tier, UserId,
};

/// Published by submission intake on the job-request topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub user_id: UserId,
    pub input_file_name: String,
    #[serde(alias = "s3_inputs_bucket")]
    pub inputs_bucket: String,
    #[serde(alias = "s3_key_input_file")]
    pub input_key: String,
    pub submit_time: i64,
    #[serde(alias = "job_status")]
    pub status: JobStatus,
    pub email: String,
    pub tier: Tier,
}

impl JobRequest {
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            user_id: record.user_id.clone(),
            input_file_name: record.input_file_name.clone(),
            inputs_bucket: record.inputs_bucket.clone(),
            input_key: record.input_key.clone(),
            submit_time: record.submit_time,
            status: record.job_status,
            email: record.email.clone(),
            tier: record.tier,
        }
    }
}

/// Published by the completion reporter on the completion topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCompletion {
    pub job_id: JobId,
    pub user_id: UserId,
    #[serde(alias = "s3_results_bucket")]
    pub results_bucket: String,
    #[serde(alias = "s3_key_results_file")]
    pub result_key: String,
    #[serde(alias = "s3_key_log_file")]
    pub log_key: String,
    pub complete_time: i64,
    pub email: String,
    #[serde(alias = "job_status")]
    pub status: JobStatus,
}

/// Asks for one archived result to be brought back from cold storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    #[serde(alias = "results_file_archive_id")]
    pub archive_handle: ArchiveId,
    #[serde(alias = "s3_key_results_file")]
    pub result_key: String,
    #[serde(alias = "s3_results_bucket")]
    pub results_bucket: String,
}

/// External trigger: a user moved to a tier that keeps results live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierUpgrade {
    pub user_id: UserId,
}

/// Phase A: cold storage accepted a retrieval job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalAccepted {
    pub retrieval_job_id: RetrievalJobId,
    pub result_key: String,
    /// Bucket the restored result goes back to; empty means the configured results bucket.
    #[serde(default)]
    pub results_bucket: String,
}

/// Phase B: a retrieval job finished (successfully or not).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalCompleted {
    pub archive_handle: ArchiveId,
    pub retrieval_job_id: RetrievalJobId,
    pub status: RetrievalStatus,
}

/// Final state reported for a retrieval job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalStatus {
    Succeeded,
    Failed,
    InProgress,
    #[serde(other)]
    Unknown,
}

/// Events on the thaw topic, tagged explicitly by phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThawEvent {
    RetrievalAccepted(RetrievalAccepted),
    RetrievalCompleted(RetrievalCompleted),
}

impl From<RetrievalAccepted> for ThawEvent {
    fn from(value: RetrievalAccepted) -> Self {
        ThawEvent::RetrievalAccepted(value)
    }
}

impl From<RetrievalCompleted> for ThawEvent {
    fn from(value: RetrievalCompleted) -> Self {
        ThawEvent::RetrievalCompleted(value)
    }
}

impl RetrievalCompleted {
    /// Archive handle the record should hold while this retrieval is outstanding.
    pub fn expected_handle(&self) -> ArchiveHandle {
        ArchiveHandle::Archived(self.archive_handle.clone())
    }
}

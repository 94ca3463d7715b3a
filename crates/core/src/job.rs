//! Job record and its state machine.
//!
//! A [`JobRecord`] is the single source of truth for one submitted job. Every store
//! backend mutates records exclusively through [`JobRecord::apply`], which is where the
//! lifecycle invariants live:
//!
//! - status only moves forward: `PENDING → RUNNING → COMPLETED`
//! - an archive handle is attached only to completed, archival-eligible jobs
//! - once archived, the handle can only become `"restored"`; it is never cleared

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ArchiveId, JobId, RESTORED_SENTINEL, UserId};

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Submitted, waiting for a dispatcher
    Pending,
    /// Handed to the processing tool
    Running,
    /// Artifacts uploaded and recorded
    Completed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Service tier of the submitting user, captured at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[serde(alias = "free_user")]
    Free,
    #[serde(alias = "premium_user")]
    Premium,
}

impl Tier {
    /// Results of free-tier jobs move to cold storage after the grace period.
    pub fn is_archival_eligible(self) -> bool {
        matches!(self, Tier::Free)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }
}

impl core::str::FromStr for Tier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" | "free_user" => Ok(Tier::Free),
            "premium" | "premium_user" => Ok(Tier::Premium),
            other => Err(DomainError::validation(format!("unknown tier '{other}'"))),
        }
    }
}

/// Cold-storage state of a job's result object.
///
/// Serialized as a plain string: the archive id, or the `"restored"` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ArchiveHandle {
    /// Result lives in cold storage under this id.
    Archived(ArchiveId),
    /// Result was archived once and has been restored to live storage.
    Restored,
}

impl ArchiveHandle {
    pub fn archive_id(&self) -> Option<&ArchiveId> {
        match self {
            ArchiveHandle::Archived(id) => Some(id),
            ArchiveHandle::Restored => None,
        }
    }

    pub fn is_restored(&self) -> bool {
        matches!(self, ArchiveHandle::Restored)
    }
}

impl TryFrom<String> for ArchiveHandle {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == RESTORED_SENTINEL {
            return Ok(ArchiveHandle::Restored);
        }
        ArchiveId::parse(value).map(ArchiveHandle::Archived)
    }
}

impl From<ArchiveHandle> for String {
    fn from(value: ArchiveHandle) -> Self {
        match value {
            ArchiveHandle::Archived(id) => id.into(),
            ArchiveHandle::Restored => RESTORED_SENTINEL.to_string(),
        }
    }
}

impl core::fmt::Display for ArchiveHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ArchiveHandle::Archived(id) => f.write_str(id.as_str()),
            ArchiveHandle::Restored => f.write_str(RESTORED_SENTINEL),
        }
    }
}

/// Location of a job's input object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputObject {
    pub file_name: String,
    pub bucket: String,
    pub key: String,
}

/// Artifact locators written when a job completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionDetails {
    pub results_bucket: String,
    pub result_key: String,
    pub log_key: String,
    /// Completion time, epoch seconds.
    pub complete_time: i64,
}

/// Durable description of one submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub user_id: UserId,
    pub input_file_name: String,
    pub inputs_bucket: String,
    pub input_key: String,
    /// Submission time, epoch seconds.
    pub submit_time: i64,
    pub job_status: JobStatus,
    pub complete_time: Option<i64>,
    pub results_bucket: Option<String>,
    pub result_key: Option<String>,
    pub log_key: Option<String>,
    pub archive_handle: Option<ArchiveHandle>,
    pub email: String,
    pub tier: Tier,
}

/// A field-scoped mutation of a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordUpdate {
    MarkRunning,
    MarkCompleted(CompletionDetails),
    SetArchiveHandle(ArchiveHandle),
    SetTier(Tier),
}

/// Condition on current stored state that must hold for an update to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Commit unconditionally (domain invariants still apply).
    Always,
    StatusIs(JobStatus),
    TierIs(Tier),
    ArchiveHandleIs(Option<ArchiveHandle>),
    All(Vec<Precondition>),
}

impl Precondition {
    pub fn holds(&self, record: &JobRecord) -> bool {
        match self {
            Precondition::Always => true,
            Precondition::StatusIs(status) => record.job_status == *status,
            Precondition::TierIs(tier) => record.tier == *tier,
            Precondition::ArchiveHandleIs(handle) => record.archive_handle == *handle,
            Precondition::All(all) => all.iter().all(|p| p.holds(record)),
        }
    }
}

impl JobRecord {
    /// Create a new record in `PENDING` state.
    pub fn pending(
        job_id: JobId,
        user_id: UserId,
        input: InputObject,
        submit_time: i64,
        email: impl Into<String>,
        tier: Tier,
    ) -> Self {
        Self {
            job_id,
            user_id,
            input_file_name: input.file_name,
            inputs_bucket: input.bucket,
            input_key: input.key,
            submit_time,
            job_status: JobStatus::Pending,
            complete_time: None,
            results_bucket: None,
            result_key: None,
            log_key: None,
            archive_handle: None,
            email: email.into(),
            tier,
        }
    }

    /// Apply a field-scoped update, enforcing lifecycle invariants.
    ///
    /// Re-applying an update that is already reflected in the record is a no-op, which
    /// keeps at-least-once consumers idempotent.
    pub fn apply(&mut self, update: &RecordUpdate) -> DomainResult<()> {
        match update {
            RecordUpdate::MarkRunning => self.advance(JobStatus::Running),
            RecordUpdate::MarkCompleted(details) => {
                self.advance(JobStatus::Completed)?;
                self.results_bucket = Some(details.results_bucket.clone());
                self.result_key = Some(details.result_key.clone());
                self.log_key = Some(details.log_key.clone());
                self.complete_time = Some(details.complete_time);
                Ok(())
            }
            RecordUpdate::SetArchiveHandle(handle) => self.set_archive_handle(handle),
            RecordUpdate::SetTier(tier) => {
                self.tier = *tier;
                Ok(())
            }
        }
    }

    fn advance(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.job_status.can_advance_to(next) {
            return Err(DomainError::invariant(format!(
                "job {} cannot move from {} back to {}",
                self.job_id, self.job_status, next
            )));
        }
        self.job_status = next;
        Ok(())
    }

    fn set_archive_handle(&mut self, handle: &ArchiveHandle) -> DomainResult<()> {
        match (handle, &self.archive_handle) {
            (ArchiveHandle::Archived(_), current) => {
                if self.job_status != JobStatus::Completed {
                    return Err(DomainError::invariant(format!(
                        "job {} archived before completion",
                        self.job_id
                    )));
                }
                if !self.tier.is_archival_eligible() {
                    return Err(DomainError::invariant(format!(
                        "job {} is not archival-eligible ({})",
                        self.job_id,
                        self.tier.as_str()
                    )));
                }
                match current {
                    None => {}
                    Some(existing) if existing == handle => return Ok(()),
                    Some(existing) => {
                        return Err(DomainError::conflict(format!(
                            "job {} already has archive handle {existing}",
                            self.job_id
                        )));
                    }
                }
            }
            (ArchiveHandle::Restored, Some(_)) => {}
            (ArchiveHandle::Restored, None) => {
                return Err(DomainError::invariant(format!(
                    "job {} restored without ever being archived",
                    self.job_id
                )));
            }
        }
        self.archive_handle = Some(handle.clone());
        Ok(())
    }

    /// Archive id still pending restoration, if any.
    pub fn pending_archive(&self) -> Option<&ArchiveId> {
        self.archive_handle.as_ref().and_then(ArchiveHandle::archive_id)
    }

    /// Time left before the grace period after completion has elapsed.
    ///
    /// Returns `None` when the job has not completed yet, `Some(ZERO)` once the grace
    /// period is over.
    pub fn grace_remaining(
        &self,
        now_epoch: i64,
        grace: std::time::Duration,
    ) -> Option<std::time::Duration> {
        let complete_time = self.complete_time?;
        if self.job_status != JobStatus::Completed {
            return None;
        }
        let elapsed = now_epoch.saturating_sub(complete_time).max(0) as u64;
        Some(grace.saturating_sub(std::time::Duration::from_secs(elapsed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use proptest::prelude::*;

    fn record(tier: Tier) -> JobRecord {
        JobRecord::pending(
            JobId::parse("j1").unwrap(),
            UserId::parse("u1").unwrap(),
            InputObject {
                file_name: "in.vcf".to_string(),
                bucket: "inputs".to_string(),
                key: "gas/u1/j1~in.vcf".to_string(),
            },
            1_000,
            "u1@example.com",
            tier,
        )
    }

    fn completion(at: i64) -> RecordUpdate {
        RecordUpdate::MarkCompleted(CompletionDetails {
            results_bucket: "results".to_string(),
            result_key: "gas/u1/j1~in.annot.vcf".to_string(),
            log_key: "gas/u1/j1~in.vcf.count.log".to_string(),
            complete_time: at,
        })
    }

    fn archived(id: &str) -> ArchiveHandle {
        ArchiveHandle::Archived(ArchiveId::parse(id).unwrap())
    }

    #[test]
    fn lifecycle_moves_forward() {
        let mut job = record(Tier::Free);
        job.apply(&RecordUpdate::MarkRunning).unwrap();
        assert_eq!(job.job_status, JobStatus::Running);

        job.apply(&completion(2_000)).unwrap();
        assert_eq!(job.job_status, JobStatus::Completed);
        assert_eq!(job.complete_time, Some(2_000));
    }

    #[test]
    fn completed_never_reverts_to_running() {
        let mut job = record(Tier::Free);
        job.apply(&completion(2_000)).unwrap();

        let err = job.apply(&RecordUpdate::MarkRunning).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(job.job_status, JobStatus::Completed);
    }

    #[test]
    fn archive_handle_requires_completion_and_eligible_tier() {
        let mut job = record(Tier::Free);
        assert!(job.apply(&RecordUpdate::SetArchiveHandle(archived("H1"))).is_err());

        job.apply(&completion(2_000)).unwrap();
        job.apply(&RecordUpdate::SetArchiveHandle(archived("H1"))).unwrap();
        assert_eq!(job.pending_archive().map(ArchiveId::as_str), Some("H1"));

        let mut premium = record(Tier::Premium);
        premium.apply(&completion(2_000)).unwrap();
        assert!(
            premium
                .apply(&RecordUpdate::SetArchiveHandle(archived("H1")))
                .is_err()
        );
        assert!(premium.archive_handle.is_none());
    }

    #[test]
    fn second_archive_handle_conflicts_but_same_is_idempotent() {
        let mut job = record(Tier::Free);
        job.apply(&completion(2_000)).unwrap();
        job.apply(&RecordUpdate::SetArchiveHandle(archived("H1"))).unwrap();
        job.apply(&RecordUpdate::SetArchiveHandle(archived("H1"))).unwrap();

        let err = job
            .apply(&RecordUpdate::SetArchiveHandle(archived("H2")))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn restored_requires_prior_archive() {
        let mut job = record(Tier::Free);
        job.apply(&completion(2_000)).unwrap();
        assert!(
            job.apply(&RecordUpdate::SetArchiveHandle(ArchiveHandle::Restored))
                .is_err()
        );

        job.apply(&RecordUpdate::SetArchiveHandle(archived("H1"))).unwrap();
        job.apply(&RecordUpdate::SetArchiveHandle(ArchiveHandle::Restored))
            .unwrap();
        assert_eq!(job.archive_handle, Some(ArchiveHandle::Restored));
        assert!(job.pending_archive().is_none());
    }

    #[test]
    fn archive_handle_serializes_with_restored_sentinel() {
        let json = serde_json::to_string(&ArchiveHandle::Restored).unwrap();
        assert_eq!(json, "\"restored\"");

        let parsed: ArchiveHandle = serde_json::from_str("\"H1\"").unwrap();
        assert_eq!(parsed, archived("H1"));
    }

    #[test]
    fn grace_remaining_counts_down_from_completion() {
        let mut job = record(Tier::Free);
        let grace = Duration::from_secs(300);
        assert_eq!(job.grace_remaining(5_000, grace), None);

        job.apply(&completion(2_000)).unwrap();
        assert_eq!(job.grace_remaining(2_299, grace), Some(Duration::from_secs(1)));
        assert_eq!(job.grace_remaining(2_301, grace), Some(Duration::ZERO));
    }

    #[test]
    fn preconditions_compose() {
        let mut job = record(Tier::Free);
        job.apply(&completion(2_000)).unwrap();

        let cond = Precondition::All(vec![
            Precondition::TierIs(Tier::Free),
            Precondition::ArchiveHandleIs(None),
        ]);
        assert!(cond.holds(&job));

        job.tier = Tier::Premium;
        assert!(!cond.holds(&job));
    }

    fn arb_update() -> impl Strategy<Value = RecordUpdate> {
        prop_oneof![
            Just(RecordUpdate::MarkRunning),
            (0i64..10_000).prop_map(completion),
        ]
    }

    proptest! {
        #[test]
        fn status_is_monotonic_under_any_update_sequence(
            updates in proptest::collection::vec(arb_update(), 0..20)
        ) {
            let mut job = record(Tier::Free);
            let mut last = job.job_status;
            for update in &updates {
                let _ = job.apply(update);
                prop_assert!(last.can_advance_to(job.job_status));
                last = job.job_status;
            }
        }
    }
}

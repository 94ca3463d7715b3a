//! Object key convention.
//!
//! Inputs and artifacts share one layout: `{prefix}/{user_id}/{job_id}~{file_name}`.
//! Artifacts derive their names from the input file's stem (text before the first
//! `.`): `{job_id}~{stem}.annot.vcf` and `{job_id}~{stem}.vcf.count.log`.

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, UserId};

const RESULT_SUFFIX: &str = ".annot.vcf";
const LOG_SUFFIX: &str = ".vcf.count.log";

/// Key layout rooted at a configurable prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Directory (with trailing slash) holding a user's objects.
    pub fn user_dir(&self, user_id: &UserId) -> String {
        if self.prefix.is_empty() {
            format!("{user_id}/")
        } else {
            format!("{}/{user_id}/", self.prefix)
        }
    }

    /// Full key of a job file for a user.
    pub fn object_key(&self, user_id: &UserId, file: &JobFileName) -> String {
        format!("{}{}", self.user_dir(user_id), file)
    }
}

/// A job-scoped file name: `{job_id}~{name}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFileName {
    job_id: JobId,
    name: String,
}

impl JobFileName {
    pub fn new(job_id: JobId, name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(DomainError::validation(format!(
                "invalid file name '{name}'"
            )));
        }
        Ok(Self { job_id, name })
    }

    /// Parse `{job_id}~{name}`; the job id is everything before the first `~`.
    pub fn parse(file_name: &str) -> DomainResult<Self> {
        let (job, name) = file_name.split_once('~').ok_or_else(|| {
            DomainError::validation(format!("'{file_name}' has no job id prefix"))
        })?;
        Self::new(JobId::parse(job)?, name)
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Original file name, without the job id prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stem(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    pub fn result_file(&self) -> JobFileName {
        self.derived(RESULT_SUFFIX)
    }

    pub fn log_file(&self) -> JobFileName {
        self.derived(LOG_SUFFIX)
    }

    fn derived(&self, suffix: &str) -> JobFileName {
        JobFileName {
            job_id: self.job_id.clone(),
            name: format!("{}{suffix}", self.stem()),
        }
    }
}

impl core::fmt::Display for JobFileName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}~{}", self.job_id, self.name)
    }
}

/// Owner and file parsed back out of an object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultLocation {
    pub user_id: UserId,
    pub file: JobFileName,
}

impl ResultLocation {
    /// Parse `[{prefix}/]{user_id}/{job_id}~{file}`; the prefix may be absent or nested.
    pub fn parse(key: &str) -> DomainResult<Self> {
        let mut segments = key.rsplit('/');
        let file = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DomainError::validation(format!("'{key}' has no file name")))?;
        let user = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DomainError::validation(format!("'{key}' has no user segment")))?;

        Ok(Self {
            user_id: UserId::parse(user)?,
            file: JobFileName::parse(file)?,
        })
    }
}

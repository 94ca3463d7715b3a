//! Strongly-typed identifiers used across the pipeline.
//!
//! Identifiers are opaque strings: job and user ids end up embedded in object keys
//! (`{prefix}/{user_id}/{job_id}~{file}`), so each type rejects the separators that
//! would make a key ambiguous.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

/// Identifier of the user owning a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

/// Handle returned by cold storage for an archived object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArchiveId(String);

/// Identifier of an asynchronous cold-storage retrieval job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RetrievalJobId(String);

/// Value reserved for the restored archive handle; never a valid archive id.
pub(crate) const RESTORED_SENTINEL: &str = "restored";

macro_rules! impl_string_id {
    ($t:ident, $name:literal, $validate:expr) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// Parse and validate an identifier.
            pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: empty", $name)));
                }
                let validate: fn(&str) -> Result<(), String> = $validate;
                validate(&value)
                    .map_err(|reason| DomainError::invalid_id(format!("{}: {}", $name, reason)))?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

fn no_key_separators(value: &str) -> Result<(), String> {
    if value.contains('/') || value.contains('~') {
        return Err(format!("'{value}' contains '/' or '~'"));
    }
    Ok(())
}

fn no_path_separator(value: &str) -> Result<(), String> {
    if value.contains('/') {
        return Err(format!("'{value}' contains '/'"));
    }
    Ok(())
}

fn not_sentinel(value: &str) -> Result<(), String> {
    if value == RESTORED_SENTINEL {
        return Err(format!("'{RESTORED_SENTINEL}' is reserved"));
    }
    Ok(())
}

fn any(_: &str) -> Result<(), String> {
    Ok(())
}

impl_string_id!(JobId, "JobId", no_key_separators);
impl_string_id!(UserId, "UserId", no_path_separator);
impl_string_id!(ArchiveId, "ArchiveId", not_sentinel);
impl_string_id!(RetrievalJobId, "RetrievalJobId", any);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_rejects_key_separators() {
        assert!(JobId::parse("j1").is_ok());
        assert!(JobId::parse("j~1").is_err());
        assert!(JobId::parse("a/b").is_err());
        assert!(JobId::parse("").is_err());
    }

    #[test]
    fn archive_id_cannot_be_the_restored_sentinel() {
        assert!(ArchiveId::parse("H1").is_ok());
        assert!(matches!(
            ArchiveId::parse("restored"),
            Err(DomainError::InvalidId(_))
        ));
    }

    #[test]
    fn ids_deserialize_with_validation() {
        let ok: Result<UserId, _> = serde_json::from_str("\"u1\"");
        assert_eq!(ok.unwrap().as_str(), "u1");

        let bad: Result<UserId, _> = serde_json::from_str("\"u/1\"");
        assert!(bad.is_err());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }
}

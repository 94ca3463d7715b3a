//! `annotflow-core`: job lifecycle domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job record state machine, the object key convention and a
//! clock abstraction so time-dependent rules can be tested deterministically.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod keys;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{ArchiveId, JobId, RetrievalJobId, UserId};
pub use job::{
    ArchiveHandle, CompletionDetails, InputObject, JobRecord, JobStatus, Precondition,
    RecordUpdate, Tier,
};
pub use keys::{JobFileName, KeyLayout, ResultLocation};

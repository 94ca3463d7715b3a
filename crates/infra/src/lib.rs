//! Infrastructure layer: stores, queue backends, configuration and the pipeline
//! components that move a job from submission to archive and back.

pub mod archiver;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event_bus;
pub mod intake;
pub mod launcher;
pub mod notifier;
pub mod pipeline;
pub mod queries;
pub mod records;
pub mod reporter;
pub mod restore;
pub mod scratch;
pub mod sidecar;
pub mod storage;
pub mod thaw;
pub mod workers;

pub use config::{ConfigError, PipelineConfig};
pub use error::WorkerError;
pub use pipeline::{Channels, Pipeline, Services};

#[cfg(test)]
mod integration_tests;

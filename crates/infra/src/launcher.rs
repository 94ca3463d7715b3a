//! Launching the external processing tool.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread;

use tracing::{error, info};

use annotflow_core::JobFileName;

use crate::error::WorkerError;
use crate::reporter::CompletionReporter;

/// A processing run to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub input: JobFileName,
    /// Local path of the downloaded input; the tool's only argument.
    pub input_path: PathBuf,
}

/// Starts processing without waiting for it.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, request: LaunchRequest) -> Result<(), WorkerError>;
}

impl<L> ProcessLauncher for Arc<L>
where
    L: ProcessLauncher + ?Sized,
{
    fn launch(&self, request: LaunchRequest) -> Result<(), WorkerError> {
        (**self).launch(request)
    }
}

/// Runs an external command on a detached thread and reports completion when it exits
/// successfully.
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
    reporter: Arc<CompletionReporter>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, reporter: Arc<CompletionReporter>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            reporter,
        }
    }

    /// Arguments placed before the input path.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, request: LaunchRequest) -> Result<(), WorkerError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(&request.input_path);
        if let Some(dir) = request.input_path.parent() {
            command.current_dir(dir);
        }

        let reporter = self.reporter.clone();
        let job_id = request.input.job_id().clone();
        let program = self.program.display().to_string();

        thread::Builder::new()
            .name(format!("run-{job_id}"))
            .spawn(move || {
                info!(job_id = %job_id, program = %program, "processing started");
                match command.status() {
                    Ok(status) if status.success() => {
                        if let Err(err) = reporter.report(&request.input) {
                            error!(job_id = %job_id, error = %err, "completion report failed");
                        }
                    }
                    Ok(status) => {
                        error!(job_id = %job_id, code = ?status.code(), "processing exited unsuccessfully");
                    }
                    Err(err) => error!(job_id = %job_id, error = %err, "failed to run processing"),
                }
            })
            .map_err(|e| WorkerError::Launch(e.to_string()))?;

        Ok(())
    }
}

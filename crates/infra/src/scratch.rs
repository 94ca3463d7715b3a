//! Local scratch directory for inputs and artifacts in flight.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;

use annotflow_core::JobFileName;

#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path of a job file: `{root}/{job_id}~{name}`.
    pub fn path_for(&self, file: &JobFileName) -> PathBuf {
        self.root.join(file.to_string())
    }

    pub fn write(&self, file: &JobFileName, bytes: &[u8]) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.path_for(file);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Best-effort removal; a missing file is fine, other failures are logged.
    pub fn remove(&self, file: &JobFileName) {
        let path = self.path_for(file);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove scratch file"),
        }
    }
}

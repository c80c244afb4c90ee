//! Atomic persistence of [`RunState`] to a single JSON file.

use crate::error::Result;
use crate::state::RunState;
use crate::PipelineError;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reads and writes the checkpoint file at one path.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling temporary file, `<name>.tmp`.
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Write `state` to the temporary file, then rename it over the target.
    pub fn save(&self, state: &RunState) -> Result<()> {
        let temp = self.write_temp(state)?;
        self.commit(&temp)?;
        debug!(
            path = %self.path.display(),
            step = %state.last_completed_step,
            chapters = state.completed_chapters.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Serialize `state` into the temporary file and fsync it.
    ///
    /// The target file is untouched until [`CheckpointStore::commit`].
    pub(crate) fn write_temp(&self, state: &RunState) -> Result<PathBuf> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(parent, e))?;
        }

        let body = serde_json::to_vec_pretty(state)?;
        let temp = self.temp_path();
        let mut file = File::create(&temp).map_err(|e| self.io_error(&temp, e))?;
        file.write_all(&body).map_err(|e| self.io_error(&temp, e))?;
        file.sync_all().map_err(|e| self.io_error(&temp, e))?;
        Ok(temp)
    }

    /// Rename a fully written temporary file over the target.
    pub(crate) fn commit(&self, temp: &Path) -> Result<()> {
        fs::rename(temp, &self.path).map_err(|e| {
            let _ = fs::remove_file(temp);
            self.io_error(&self.path, e)
        })
    }

    /// Load and validate the run state.
    ///
    /// An absent file is [`PipelineError::CheckpointMissing`]; a file that
    /// does not parse is [`PipelineError::CheckpointCorrupt`].
    pub fn load(&self) -> Result<RunState> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PipelineError::CheckpointMissing(self.path.clone()))
            }
            Err(e) => return Err(self.io_error(&self.path, e)),
        };

        let state: RunState =
            serde_json::from_slice(&bytes).map_err(|e| PipelineError::CheckpointCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        state.validate()?;

        debug!(
            path = %self.path.display(),
            step = %state.last_completed_step,
            "checkpoint loaded"
        );
        Ok(state)
    }

    /// Load the run state, or `None` if no checkpoint exists yet.
    pub fn load_optional(&self) -> Result<Option<RunState>> {
        match self.load() {
            Ok(state) => Ok(Some(state)),
            Err(PipelineError::CheckpointMissing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> PipelineError {
        PipelineError::CheckpointIo {
            path: path.to_path_buf(),
            source,
        }
    }
}

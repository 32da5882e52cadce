//! Units of work dispatched to every host of a job.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use tempfile::TempPath;

use crate::relocation::{RelocationError, RelocationSpec, validate_file_name};

/// Local copy of a file to be placed on remote hosts.
///
/// Temporary payloads are deleted when the last handle is dropped.
#[derive(Debug)]
pub struct Payload {
    path: PathBuf,
    _temp: Option<TempPath>,
}

impl Payload {
    /// Use an existing local file; it is left alone afterwards.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _temp: None,
        }
    }

    /// Write `bytes` to a fresh temporary file.
    ///
    /// # Errors
    /// Returns error if the temporary file cannot be written.
    pub fn from_bytes(bytes: &[u8]) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new().prefix("fleet-upload-").tempfile()?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(Self::from_temp(file.into_temp_path()))
    }

    /// Empty temporary file for the caller to fill, e.g. from a streamed upload.
    ///
    /// # Errors
    /// Returns error if the temporary file cannot be created.
    pub fn staging() -> std::io::Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix("fleet-upload-")
            .tempfile()?
            .into_temp_path();
        Ok(Self::from_temp(temp))
    }

    /// Take ownership of a temporary file.
    #[must_use]
    pub fn from_temp(temp: TempPath) -> Self {
        Self {
            path: temp.to_path_buf(),
            _temp: Some(temp),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A file placement: payload, remote name and destination.
#[derive(Debug, Clone)]
pub struct Placement {
    pub payload: Arc<Payload>,
    pub file_name: String,
    pub spec: RelocationSpec,
}

impl Placement {
    /// Build a placement after validating the remote file name.
    ///
    /// # Errors
    /// Returns error if `file_name` is not a plain base name.
    pub fn new(
        payload: Arc<Payload>,
        file_name: impl Into<String>,
        spec: RelocationSpec,
    ) -> Result<Self, RelocationError> {
        let file_name = file_name.into();
        validate_file_name(&file_name)?;
        Ok(Self {
            payload,
            file_name,
            spec,
        })
    }
}

/// What to do on each host.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Run a shell command, optionally probing for a started process.
    Command {
        command: String,
        postcheck: Option<String>,
    },
    /// Upload and relocate a file.
    Place(Placement),
}

impl Operation {
    /// Shell command without a postcheck.
    #[must_use]
    pub fn command(command: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            postcheck: None,
        }
    }

    /// Shell command followed by a process check.
    #[must_use]
    pub fn command_with_postcheck(command: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            postcheck: Some(pattern.into()),
        }
    }

    /// Description recorded on the job.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Command { command, .. } => command.clone(),
            Self::Place(p) => format!(
                "place {} -> {} ({}:{} {})",
                p.file_name,
                p.spec.final_path(&p.file_name),
                p.spec.owner(),
                p.spec.group(),
                p.spec.mode()
            ),
        }
    }
}

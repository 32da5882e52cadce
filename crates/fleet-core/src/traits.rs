//! Core traits for job storage and remote execution.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::{ExecOutput, FailureKind, HostResult, HostStatus, Job, JobId, Target};

/// Remote session error.
///
/// Every variant means the operation did not run to completion on the host.
/// [`SessionError::failure_kind`] tells whether anything ran at all.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("authentication failed for {0}")]
    Auth(String),
    #[error("invalid private key: {0}")]
    Key(String),
    #[error("host key for {0} rejected")]
    HostKeyRejected(String),
    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: &'static str, after: Duration },
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Timeout phase covering TCP connect, handshake and authentication.
    pub const CONNECT_PHASE: &'static str = "connect";

    /// Classify the error.
    ///
    /// Only failures to reach or log into the host are connection failures.
    /// Once a session is up, a stalled command, a broken channel or a failed
    /// transfer is an execution failure.
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Connect(_) | Self::Auth(_) | Self::Key(_) | Self::HostKeyRejected(_) => {
                FailureKind::Connection
            }
            Self::Timeout { phase, .. } if *phase == Self::CONNECT_PHASE => FailureKind::Connection,
            Self::InvalidCommand(_) => FailureKind::Internal,
            Self::Timeout { .. } | Self::Channel(_) | Self::Transfer(_) | Self::Io(_) => {
                FailureKind::Execution
            }
        }
    }
}

/// Trait for remote shell backends.
///
/// One call opens one connection, performs one operation and closes it.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` on the target, optionally feeding `stdin`.
    async fn exec(
        &self,
        target: &Target,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, SessionError>;

    /// Copy a local file to `remote_path` on the target.
    async fn upload(
        &self,
        target: &Target,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), SessionError>;

    /// Copy `remote_path` from the target into a local file.
    async fn download(
        &self,
        target: &Target,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), SessionError>;

    /// Run a command and fold the outcome into a [`HostResult`].
    async fn run_command(&self, target: &Target, command: &str) -> HostResult {
        HostResult::from_exec(self.exec(target, command, None).await)
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("Host {host} is not part of job {id}")]
    UnknownHost { id: JobId, host: String },
    #[error("Host {host} cannot move from {from} to {to}")]
    InvalidTransition {
        host: String,
        from: HostStatus,
        to: HostStatus,
    },
    #[error("Host {0} already has a result")]
    DuplicateResult(String),
    #[error("Job {id} still has {pending} unfinished host(s)")]
    NotReady { id: JobId, pending: usize },
    #[error("Job {0} is already finalized")]
    AlreadyFinalized(JobId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for job storage backends.
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Create a job with every host queued and return its id.
    async fn create(&self, hosts: Vec<String>, command: &str) -> Result<JobId, StorageError>;

    /// Get an independent copy of a job.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StorageError>;

    /// Advance one host's status.
    async fn update_status(
        &self,
        id: JobId,
        host: &str,
        status: HostStatus,
    ) -> Result<(), StorageError>;

    /// Record a host's result together with its terminal status.
    async fn store_result(
        &self,
        id: JobId,
        host: &str,
        result: HostResult,
    ) -> Result<(), StorageError>;

    /// Mark a job completed once every host is terminal.
    async fn finalize(&self, id: JobId) -> Result<(), StorageError>;

    /// Number of jobs tracked.
    async fn job_count(&self) -> Result<usize, StorageError>;
}

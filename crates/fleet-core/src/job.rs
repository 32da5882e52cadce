//! Job records and per-host status.

use std::{
    collections::BTreeMap,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::HostResult;

/// Job identifier.
pub type JobId = Uuid;

/// Lifecycle of one host within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    /// Waiting for a worker.
    Queued,
    /// Operation in flight.
    Running,
    /// Finished and the remote reported success.
    Completed,
    /// Finished with any kind of failure.
    Failed,
}

impl HostStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Terminal status matching a result.
    #[must_use]
    pub const fn for_result(result: &HostResult) -> Self {
        if result.ok { Self::Completed } else { Self::Failed }
    }

    /// Whether `next` is a legal step forward from `self`.
    ///
    /// `queued -> running -> {completed | failed}`; `queued` may also go straight
    /// to a terminal state when the worker fails before it can start.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        match self {
            Self::Queued => !matches!(next, Self::Queued),
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Failed => false,
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One operation fanned out across a set of hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(rename = "jobId")]
    pub id: JobId,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Operation description.
    pub command: String,
    /// Targets in submission order.
    pub hosts: Vec<String>,
    pub statuses: BTreeMap<String, HostStatus>,
    pub results: BTreeMap<String, HostResult>,
    pub completed: bool,
}

impl Job {
    /// Create a job with every host queued.
    #[must_use]
    pub fn new(hosts: Vec<String>, command: impl Into<String>) -> Self {
        let statuses = hosts
            .iter()
            .map(|h| (h.clone(), HostStatus::Queued))
            .collect();
        Self {
            id: Uuid::new_v4(),
            created_at: now(),
            completed_at: None,
            command: command.into(),
            hosts,
            statuses,
            results: BTreeMap::new(),
            completed: false,
        }
    }

    /// Whether every host has reached a terminal status.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.statuses.values().all(|s| s.is_terminal())
    }

    /// Number of hosts still queued or running.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.statuses.values().filter(|s| !s.is_terminal()).count()
    }
}

/// Current Unix time in seconds.
#[must_use]
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

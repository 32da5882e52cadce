//! In-memory job storage.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use fleet_core::{
    HostResult, HostStatus, Job, JobId, JobStorage, StorageError,
    job::now,
};

/// In-memory storage implementation.
///
/// One mutex guards every operation. Data is lost on restart.
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, Job>>, StorageError> {
        self.jobs
            .lock()
            .map_err(|e| StorageError::Internal(e.to_string()))
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn host_status(job: &Job, host: &str) -> Result<HostStatus, StorageError> {
    job.statuses
        .get(host)
        .copied()
        .ok_or_else(|| StorageError::UnknownHost {
            id: job.id,
            host: host.to_string(),
        })
}

#[async_trait]
impl JobStorage for MemoryJobStore {
    async fn create(&self, hosts: Vec<String>, command: &str) -> Result<JobId, StorageError> {
        let mut job = Job::new(hosts, command);
        let mut jobs = self.lock()?;
        // Ids stay unique per process.
        while jobs.contains_key(&job.id) {
            job.id = uuid::Uuid::new_v4();
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: JobId,
        host: &str,
        status: HostStatus,
    ) -> Result<(), StorageError> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        let current = host_status(job, host)?;
        if !current.can_advance_to(status) {
            return Err(StorageError::InvalidTransition {
                host: host.to_string(),
                from: current,
                to: status,
            });
        }
        job.statuses.insert(host.to_string(), status);
        Ok(())
    }

    async fn store_result(
        &self,
        id: JobId,
        host: &str,
        result: HostResult,
    ) -> Result<(), StorageError> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        if job.results.contains_key(host) {
            return Err(StorageError::DuplicateResult(host.to_string()));
        }
        let current = host_status(job, host)?;
        let terminal = HostStatus::for_result(&result);
        if !current.can_advance_to(terminal) {
            return Err(StorageError::InvalidTransition {
                host: host.to_string(),
                from: current,
                to: terminal,
            });
        }
        job.results.insert(host.to_string(), result);
        job.statuses.insert(host.to_string(), terminal);
        Ok(())
    }

    async fn finalize(&self, id: JobId) -> Result<(), StorageError> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        if job.completed {
            return Err(StorageError::AlreadyFinalized(id));
        }
        let pending = job.pending();
        if pending > 0 {
            return Err(StorageError::NotReady { id, pending });
        }
        job.completed = true;
        job.completed_at = Some(now());
        Ok(())
    }

    async fn job_count(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.len())
    }
}

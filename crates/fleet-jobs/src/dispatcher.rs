//! Fan-out of operations across hosts.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use fleet_core::{
    FailureKind, FleetConfig, HostDefaults, HostResult, HostStatus, Job, JobId, JobStorage,
    RemoteShell, SessionError, StorageError, Target,
};
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    operation::{Operation, Payload, Placement},
    postcheck,
    relocation::{self, RelocationError, RelocationSpec, validate_file_name},
};

/// Dispatcher error.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("No hosts given")]
    NoHosts,
    #[error("Download of {path} from {host} failed: {source}")]
    SourceDownload {
        host: String,
        path: String,
        source: SessionError,
    },
    #[error("Local staging failed: {0}")]
    Staging(#[from] std::io::Error),
    #[error(transparent)]
    Placement(#[from] RelocationError),
}

/// Tunables shared by every dispatch.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Concurrent hosts per job.
    pub max_parallel: usize,
    /// Delay between a command and its postcheck.
    pub postcheck_grace: Duration,
    /// Remote directory for staged uploads.
    pub staging_dir: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_parallel: 30,
            postcheck_grace: Duration::from_secs(1),
            staging_dir: "/tmp".to_string(),
        }
    }
}

impl DispatchSettings {
    #[must_use]
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            max_parallel: config.max_parallel.max(1),
            postcheck_grace: config.postcheck_grace,
            staging_dir: config.staging_dir.clone(),
        }
    }
}

/// Aggregate of a blocking dispatch, keyed by host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub results: BTreeMap<String, HostResult>,
    pub statuses: BTreeMap<String, HostStatus>,
}

impl BatchOutcome {
    fn from_completions(completions: Vec<(String, HostResult)>) -> Self {
        let mut outcome = Self::default();
        for (host, result) in completions {
            outcome
                .statuses
                .insert(host.clone(), HostStatus::for_result(&result));
            outcome.results.insert(host, result);
        }
        outcome
    }

    /// Whether every host succeeded.
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.results.values().all(|r| r.ok)
    }
}

/// Everything a per-host worker needs, shared across one dispatch.
struct WorkerContext<S, R> {
    shell: Arc<R>,
    settings: DispatchSettings,
    operation: Operation,
    job: Option<(Arc<S>, JobId)>,
}

/// Dispatcher for fleet operations.
///
/// The store is passed in explicitly; there is no global job registry.
pub struct Dispatcher<S, R>
where
    S: JobStorage,
    R: RemoteShell,
{
    store: Arc<S>,
    shell: Arc<R>,
    defaults: HostDefaults,
    settings: DispatchSettings,
}

impl<S, R> Dispatcher<S, R>
where
    S: JobStorage + 'static,
    R: RemoteShell + 'static,
{
    /// Create a new dispatcher.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        shell: Arc<R>,
        defaults: HostDefaults,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            shell,
            defaults,
            settings,
        }
    }

    /// Login defaults applied to hosts.
    #[must_use]
    pub const fn defaults(&self) -> &HostDefaults {
        &self.defaults
    }

    #[must_use]
    pub fn shell(&self) -> &R {
        &self.shell
    }

    /// Dispatch settings.
    #[must_use]
    pub const fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Run `operation` on every host and wait for all of them.
    ///
    /// # Errors
    /// Returns error if `hosts` is empty. Host failures are reported in the
    /// outcome, never as an error.
    pub async fn run(
        &self,
        hosts: &[String],
        operation: Operation,
    ) -> Result<BatchOutcome, DispatchError> {
        if hosts.is_empty() {
            return Err(DispatchError::NoHosts);
        }
        tracing::info!(hosts = hosts.len(), op = %operation.describe(), "Dispatching (blocking)");
        let ctx = self.context(operation, None);
        let completions = fan_out(ctx, self.targets(hosts)).await;
        Ok(BatchOutcome::from_completions(completions))
    }

    /// Create a job for `operation` and return its id without waiting.
    ///
    /// # Errors
    /// Returns error if `hosts` is empty or the job cannot be created.
    pub async fn submit(
        &self,
        hosts: Vec<String>,
        operation: Operation,
    ) -> Result<JobId, DispatchError> {
        if hosts.is_empty() {
            return Err(DispatchError::NoHosts);
        }
        let targets = self.targets(&hosts);
        let id = self.store.create(hosts, &operation.describe()).await?;
        tracing::info!(job_id = %id, hosts = targets.len(), "Job submitted");

        let store = Arc::clone(&self.store);
        let ctx = self.context(operation, Some((Arc::clone(&store), id)));
        tokio::spawn(async move {
            let completions = fan_out(ctx, targets).await;
            let failed = completions.iter().filter(|(_, r)| !r.ok).count();
            match store.finalize(id).await {
                Ok(()) => tracing::info!(
                    job_id = %id,
                    hosts = completions.len(),
                    failed,
                    "Job completed"
                ),
                Err(e) => tracing::error!(job_id = %id, error = %e, "Failed to finalize job"),
            }
        });

        Ok(id)
    }

    /// Snapshot of a job.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn job(&self, id: JobId) -> Result<Option<Job>, DispatchError> {
        Ok(self.store.get(id).await?)
    }

    /// Download `path` from `source` into a local temporary file.
    ///
    /// # Errors
    /// Returns error if the temporary file cannot be created or the download fails.
    pub async fn fetch_source(&self, source: &Target, path: &str) -> Result<Payload, DispatchError> {
        let temp = tempfile::Builder::new()
            .prefix("fleet-source-")
            .tempfile()?
            .into_temp_path();
        self.shell
            .download(source, path, &temp)
            .await
            .map_err(|source_err| {
                tracing::warn!(host = %source.host, path, error = %source_err, "Source download failed");
                DispatchError::SourceDownload {
                    host: source.host.clone(),
                    path: path.to_string(),
                    source: source_err,
                }
            })?;
        tracing::info!(host = %source.host, path, "Source file staged locally");
        Ok(Payload::from_temp(temp))
    }

    /// Upload and place a local payload on every host, waiting for all of them.
    ///
    /// # Errors
    /// Returns error if `hosts` is empty.
    pub async fn place_file(
        &self,
        hosts: &[String],
        placement: Placement,
    ) -> Result<BatchOutcome, DispatchError> {
        self.run(hosts, Operation::Place(placement)).await
    }

    /// Copy `path` from `source` to every host.
    ///
    /// The source file is fetched once. If that fails no target is touched.
    ///
    /// # Errors
    /// Returns error if `hosts` is empty, the placement is invalid or the
    /// source download fails.
    pub async fn copy_between_hosts(
        &self,
        source: &Target,
        path: &str,
        hosts: &[String],
        spec: RelocationSpec,
    ) -> Result<BatchOutcome, DispatchError> {
        if hosts.is_empty() {
            return Err(DispatchError::NoHosts);
        }
        let file_name = path.rsplit('/').next().unwrap_or_default();
        validate_file_name(file_name)?;
        let payload = self.fetch_source(source, path).await?;
        let placement = Placement::new(Arc::new(payload), file_name, spec)?;
        self.place_file(hosts, placement).await
    }

    fn targets(&self, hosts: &[String]) -> Vec<Target> {
        hosts.iter().map(|h| self.defaults.target(h)).collect()
    }

    fn context(&self, operation: Operation, job: Option<(Arc<S>, JobId)>) -> Arc<WorkerContext<S, R>> {
        Arc::new(WorkerContext {
            shell: Arc::clone(&self.shell),
            settings: self.settings.clone(),
            operation,
            job,
        })
    }
}

/// Run the context's operation on every target, at most `max_parallel` at a
/// time, and return outcomes in completion order.
async fn fan_out<S, R>(ctx: Arc<WorkerContext<S, R>>, targets: Vec<Target>) -> Vec<(String, HostResult)>
where
    S: JobStorage + 'static,
    R: RemoteShell + 'static,
{
    let semaphore = Arc::new(Semaphore::new(ctx.settings.max_parallel.max(1)));
    let mut remaining: Vec<String> = targets.iter().map(|t| t.host.clone()).collect();
    let mut set = JoinSet::new();

    for target in targets {
        let ctx = Arc::clone(&ctx);
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let host = target.host.clone();
            let _permit = semaphore.acquire_owned().await;
            if let Some((store, id)) = &ctx.job {
                if let Err(e) = store.update_status(*id, &host, HostStatus::Running).await {
                    tracing::warn!(job_id = %id, %host, error = %e, "Failed to mark host running");
                }
            }

            // Inner task so a panic in the operation becomes this host's failure.
            let worker_ctx = Arc::clone(&ctx);
            let result = tokio::spawn(async move { execute(&worker_ctx, &target).await })
                .await
                .unwrap_or_else(|e| {
                    tracing::error!(%host, error = %e, "Host worker failed");
                    HostResult::failure(FailureKind::Internal, format!("worker failed: {e}"))
                });

            record(&ctx, &host, result.clone()).await;
            (host, result)
        });
    }

    let mut completions = Vec::with_capacity(remaining.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((host, result)) => {
                if let Some(pos) = remaining.iter().position(|h| *h == host) {
                    remaining.swap_remove(pos);
                }
                completions.push((host, result));
            }
            Err(e) => tracing::error!(error = %e, "Dispatch task failed"),
        }
    }

    // Hosts whose supervisor task died still get exactly one failed result.
    for host in remaining {
        let result = HostResult::failure(FailureKind::Internal, "dispatch task failed");
        record(&ctx, &host, result.clone()).await;
        completions.push((host, result));
    }

    completions
}

async fn record<S, R>(ctx: &WorkerContext<S, R>, host: &str, result: HostResult)
where
    S: JobStorage,
    R: RemoteShell,
{
    if let Some((store, id)) = &ctx.job {
        if let Err(e) = store.store_result(*id, host, result).await {
            tracing::warn!(job_id = %id, host, error = %e, "Failed to store host result");
        }
    }
}

async fn execute<S, R>(ctx: &WorkerContext<S, R>, target: &Target) -> HostResult
where
    S: JobStorage,
    R: RemoteShell,
{
    let shell = ctx.shell.as_ref();
    let result = match &ctx.operation {
        Operation::Command { command, postcheck } => {
            let result = shell.run_command(target, command).await;
            match postcheck {
                // Nothing ran if the host was unreachable, so there is nothing to check.
                Some(pattern) if result.error_kind != Some(FailureKind::Connection) => {
                    match postcheck::check(shell, target, pattern, ctx.settings.postcheck_grace).await {
                        Some(check) => result.with_postcheck(check),
                        None => result,
                    }
                }
                _ => result,
            }
        }
        Operation::Place(placement) => {
            relocation::relocate(
                shell,
                target,
                placement.payload.path(),
                &placement.file_name,
                &placement.spec,
                &ctx.settings.staging_dir,
            )
            .await
        }
    };

    if result.ok {
        tracing::debug!(host = %target.host, "Host finished");
    } else {
        tracing::warn!(
            host = %target.host,
            exit_code = ?result.exit_code,
            error = ?result.error,
            "Host failed"
        );
    }
    result
}

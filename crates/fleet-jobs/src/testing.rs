//! Scripted remote shell for dispatcher tests.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use fleet_core::{ExecOutput, RemoteShell, SessionError, Target};
use tokio::sync::Semaphore;

/// Per-host scripted behavior.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    Exit(u32),
    Unreachable,
    /// Logged in, but the command outlived its timeout.
    TimedOut,
    Panic,
}

type Log = Arc<Mutex<Vec<(String, String)>>>;

#[derive(Default)]
pub struct MockShell {
    behaviors: HashMap<String, Behavior>,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    postcheck_output: String,
    failing_postcheck: bool,
    download_content: Vec<u8>,
    in_flight: AtomicUsize,
    peak: Arc<AtomicUsize>,
    calls: Log,
    uploads: Log,
}

impl MockShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(host.to_string(), behavior);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Block every call until permits are added to the gate.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn with_postcheck_output(mut self, stdout: &str) -> Self {
        self.postcheck_output = stdout.to_string();
        self
    }

    pub fn with_failing_postcheck(mut self) -> Self {
        self.failing_postcheck = true;
        self
    }

    pub fn with_download_content(mut self, content: &[u8]) -> Self {
        self.download_content = content.to_vec();
        self
    }

    pub fn gate_handle(&self) -> Arc<Semaphore> {
        Arc::clone(self.gate.as_ref().expect("shell is not gated"))
    }

    pub fn peak_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak)
    }

    pub fn calls_handle(&self) -> Log {
        Arc::clone(&self.calls)
    }

    pub fn uploads_handle(&self) -> Log {
        Arc::clone(&self.uploads)
    }

    fn behavior(&self, host: &str) -> Behavior {
        self.behaviors.get(host).copied().unwrap_or(Behavior::Succeed)
    }

    async fn enter(&self, host: &str, what: &str) -> Behavior {
        self.calls
            .lock()
            .unwrap()
            .push((host.to_string(), what.to_string()));
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.behavior(host)
    }
}

fn unreachable(target: &Target) -> SessionError {
    SessionError::Connect(format!("{}: connection refused", target.address()))
}

#[async_trait]
impl RemoteShell for MockShell {
    async fn exec(
        &self,
        target: &Target,
        command: &str,
        _stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, SessionError> {
        let behavior = self.enter(&target.host, command).await;

        if command.contains("pgrep -f") {
            if self.failing_postcheck {
                return Err(SessionError::Channel("pgrep channel closed".into()));
            }
            return Ok(ExecOutput {
                stdout: self.postcheck_output.clone(),
                exit_code: Some(0),
                ..ExecOutput::default()
            });
        }

        match behavior {
            Behavior::Succeed => Ok(ExecOutput {
                stdout: format!("{}\n", command.trim_start_matches("echo ")),
                exit_code: Some(0),
                ..ExecOutput::default()
            }),
            Behavior::Exit(code) => Ok(ExecOutput {
                stderr: format!("exit {code}\n"),
                exit_code: Some(code),
                ..ExecOutput::default()
            }),
            Behavior::Unreachable => Err(unreachable(target)),
            Behavior::TimedOut => Err(SessionError::Timeout {
                phase: "command",
                after: Duration::from_secs(1),
            }),
            Behavior::Panic => panic!("scripted panic on {}", target.host),
        }
    }

    async fn upload(
        &self,
        target: &Target,
        _local_path: &Path,
        remote_path: &str,
    ) -> Result<(), SessionError> {
        match self.enter(&target.host, "upload").await {
            Behavior::Unreachable => Err(unreachable(target)),
            Behavior::Panic => panic!("scripted panic on {}", target.host),
            Behavior::Succeed | Behavior::Exit(_) | Behavior::TimedOut => {
                self.uploads
                    .lock()
                    .unwrap()
                    .push((target.host.clone(), remote_path.to_string()));
                Ok(())
            }
        }
    }

    async fn download(
        &self,
        target: &Target,
        _remote_path: &str,
        local_path: &Path,
    ) -> Result<(), SessionError> {
        match self.enter(&target.host, "download").await {
            Behavior::Unreachable => Err(unreachable(target)),
            Behavior::Panic => panic!("scripted panic on {}", target.host),
            Behavior::Succeed | Behavior::Exit(_) | Behavior::TimedOut => {
                tokio::fs::write(local_path, &self.download_content).await?;
                Ok(())
            }
        }
    }
}

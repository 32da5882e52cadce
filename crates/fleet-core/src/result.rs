//! Per-host outcomes.

use serde::{Deserialize, Serialize};

use crate::traits::SessionError;

/// Failure classification carried by a failed [`HostResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Could not reach or authenticate to the host.
    Connection,
    /// The remote command ran and exited nonzero.
    Execution,
    /// The elevated placement sequence failed at some sub-step.
    Relocation,
    /// Unexpected failure inside the dispatcher itself.
    Internal,
}

/// Result of probing for a background process after a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Postcheck {
    pub started: bool,
    pub pids: Vec<u32>,
}

impl Postcheck {
    /// Parse `pgrep`-style output: every whitespace separated numeric token is a pid.
    #[must_use]
    pub fn from_output(stdout: &str) -> Self {
        let pids: Vec<u32> = stdout
            .split_whitespace()
            .filter_map(|tok| tok.parse().ok())
            .collect();
        Self {
            started: !pids.is_empty(),
            pids,
        }
    }
}

/// Raw output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status, absent when the process died without reporting one.
    pub exit_code: Option<u32>,
    /// Signal name when the remote process was killed.
    pub exit_signal: Option<String>,
}

impl ExecOutput {
    /// Whether the remote process exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// Outcome of one operation on one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResult {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postcheck: Option<Postcheck>,
    /// Final remote path of a placed file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
}

impl HostResult {
    /// Classify the output of a command that actually ran.
    #[must_use]
    pub fn from_output(output: ExecOutput) -> Self {
        let ok = output.success();
        let (error, error_kind) = match (ok, output.exit_code, &output.exit_signal) {
            (true, _, _) => (None, None),
            (false, Some(_), _) => (None, Some(FailureKind::Execution)),
            (false, None, Some(signal)) => (
                Some(format!("remote process terminated by signal {signal}")),
                Some(FailureKind::Execution),
            ),
            (false, None, None) => (
                Some("remote process exited without a status".to_string()),
                Some(FailureKind::Execution),
            ),
        };
        Self {
            ok,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            error,
            error_kind,
            postcheck: None,
            dest: None,
        }
    }

    /// Convert a command attempt into a result, whichever way it went.
    #[must_use]
    pub fn from_exec(outcome: Result<ExecOutput, SessionError>) -> Self {
        match outcome {
            Ok(output) => Self::from_output(output),
            Err(e) => Self::session_failure(&e),
        }
    }

    /// The operation failed at the session level.
    ///
    /// The kind comes from [`SessionError::failure_kind`]: unreachable hosts are
    /// connection failures, a session that broke or stalled after login is an
    /// execution failure.
    #[must_use]
    pub fn session_failure(err: &SessionError) -> Self {
        Self::failure(err.failure_kind(), format!("SSH error: {err}"))
    }

    /// Failure with a diagnostic and no exit code.
    #[must_use]
    pub fn failure(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            error_kind: Some(kind),
            ..Self::default()
        }
    }

    /// Attach a postcheck result. Never changes `ok`.
    #[must_use]
    pub fn with_postcheck(mut self, postcheck: Postcheck) -> Self {
        self.postcheck = Some(postcheck);
        self
    }

    /// Truncate stdout/stderr to at most `budget` characters.
    ///
    /// Only for presentation copies; stored results keep the full text.
    #[must_use]
    pub fn truncated(&self, budget: usize) -> Self {
        let mut copy = self.clone();
        copy.stdout = truncate_chars(&self.stdout, budget);
        copy.stderr = truncate_chars(&self.stderr, budget);
        copy
    }
}

fn truncate_chars(s: &str, budget: usize) -> String {
    match s.char_indices().nth(budget) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(code: Option<u32>) -> ExecOutput {
        ExecOutput {
            stdout: "ok\n".into(),
            stderr: String::new(),
            exit_code: code,
            exit_signal: None,
        }
    }

    #[test]
    fn test_zero_exit_is_ok() {
        let result = HostResult::from_output(output(Some(0)));
        assert!(result.ok);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.error.is_none());
        assert!(result.error_kind.is_none());
    }

    #[test]
    fn test_nonzero_exit_has_code_but_no_error() {
        let result = HostResult::from_output(output(Some(3)));
        assert!(!result.ok);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.error.is_none());
        assert_eq!(result.error_kind, Some(FailureKind::Execution));
    }

    #[test]
    fn test_signal_has_error_without_code() {
        let mut out = output(None);
        out.exit_signal = Some("KILL".into());
        let result = HostResult::from_output(out);
        assert!(!result.ok);
        assert!(result.exit_code.is_none());
        assert!(result.error.unwrap().contains("KILL"));
    }

    #[test]
    fn test_connection_failure_has_error_without_code() {
        let result = HostResult::from_exec(Err(SessionError::Connect("refused".into())));
        assert!(!result.ok);
        assert!(result.exit_code.is_none());
        assert_eq!(result.error_kind, Some(FailureKind::Connection));
        assert!(result.error.unwrap().contains("refused"));
    }

    #[test]
    fn test_failures_after_login_are_execution() {
        let stalled = HostResult::from_exec(Err(SessionError::Timeout {
            phase: "command",
            after: std::time::Duration::from_secs(30),
        }));
        assert_eq!(stalled.error_kind, Some(FailureKind::Execution));
        assert!(stalled.exit_code.is_none());
        assert!(stalled.error.unwrap().contains("command timed out"));

        let broken = HostResult::from_exec(Err(SessionError::Channel("closed".into())));
        assert_eq!(broken.error_kind, Some(FailureKind::Execution));
        let transfer = HostResult::session_failure(&SessionError::Transfer("disk full".into()));
        assert_eq!(transfer.error_kind, Some(FailureKind::Execution));
    }

    #[test]
    fn test_unreachable_host_is_connection() {
        let connect_timeout = HostResult::from_exec(Err(SessionError::Timeout {
            phase: SessionError::CONNECT_PHASE,
            after: std::time::Duration::from_secs(30),
        }));
        assert_eq!(connect_timeout.error_kind, Some(FailureKind::Connection));
        let auth = HostResult::from_exec(Err(SessionError::Auth("ops@10.0.0.1:22".into())));
        assert_eq!(auth.error_kind, Some(FailureKind::Connection));
        let bad_command = HostResult::from_exec(Err(SessionError::InvalidCommand("empty".into())));
        assert_eq!(bad_command.error_kind, Some(FailureKind::Internal));
    }

    #[test]
    fn test_postcheck_parses_pids() {
        let check = Postcheck::from_output("123\n456\nnot-a-pid\n");
        assert!(check.started);
        assert_eq!(check.pids, vec![123, 456]);
        assert!(!Postcheck::from_output("").started);
    }

    #[test]
    fn test_postcheck_keeps_ok() {
        let failed = HostResult::from_output(output(Some(1)));
        let merged = failed.with_postcheck(Postcheck::from_output("42"));
        assert!(!merged.ok);
        assert!(merged.postcheck.unwrap().started);
    }

    #[test]
    fn test_truncated_copy_leaves_stored_text() {
        let mut result = HostResult::from_output(output(Some(0)));
        result.stdout = "héllo world".into();
        let short = result.truncated(2);
        assert_eq!(short.stdout, "hé");
        assert_eq!(result.stdout, "héllo world");
    }

    #[test]
    fn test_serializes_camel_case() {
        let result = HostResult::from_output(output(Some(2)));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["exitCode"], 2);
        assert_eq!(json["errorKind"], "execution");
        assert!(json.get("error").is_none());
    }
}

//! Background-process check run after a command.

use std::time::Duration;

use fleet_core::{Postcheck, RemoteShell, Target};

/// Command listing pids whose command line matches `pattern`.
///
/// The check's own shells carry the pattern in their arguments, so `$$` and
/// `$PPID` are filtered out.
///
/// # Errors
/// Returns error if the pattern cannot be quoted.
pub fn check_command(pattern: &str) -> Result<String, shlex::QuoteError> {
    let quoted = shlex::try_quote(pattern)?;
    Ok(format!(
        "for pid in $(pgrep -f -- {quoted}); do \
         if [ \"$pid\" != \"$$\" ] && [ \"$pid\" != \"$PPID\" ]; then echo \"$pid\"; fi; \
         done; true"
    ))
}

/// Wait `grace`, then look for processes matching `pattern` on the target.
///
/// Any failure yields `None`; the check never affects the host's outcome.
pub async fn check<R>(shell: &R, target: &Target, pattern: &str, grace: Duration) -> Option<Postcheck>
where
    R: RemoteShell + ?Sized,
{
    let command = match check_command(pattern) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(host = %target.host, error = %e, "Postcheck pattern rejected");
            return None;
        }
    };
    if !grace.is_zero() {
        tokio::time::sleep(grace).await;
    }

    match shell.exec(target, &command, None).await {
        Ok(output) if output.success() => {
            let check = Postcheck::from_output(&output.stdout);
            tracing::debug!(host = %target.host, pattern, pids = ?check.pids, "Postcheck finished");
            Some(check)
        }
        Ok(output) => {
            tracing::debug!(host = %target.host, exit_code = ?output.exit_code, "Postcheck failed");
            None
        }
        Err(e) => {
            tracing::debug!(host = %target.host, error = %e, "Postcheck failed");
            None
        }
    }
}

//! Privileged file placement.
//!
//! A payload is first uploaded to an unprivileged staging path, then a single
//! elevated script checks the owner and group, creates the destination
//! directory, moves the file and fixes ownership and mode.
//!
//! There is no rollback. A failure after the move leaves the file in place with
//! whatever ownership it had reached, and a failure before the move leaves the
//! staged copy behind.

use std::{fmt, path::Path};

use fleet_core::{Credential, FailureKind, HostResult, RemoteShell, Target};
use thiserror::Error;
use uuid::Uuid;

/// Longest accepted owner or group name.
const MAX_ACCOUNT_LEN: usize = 32;

/// Validation error for a placement request.
#[derive(Debug, Error)]
pub enum RelocationError {
    #[error("Invalid owner: {0:?}")]
    InvalidOwner(String),
    #[error("Invalid group: {0:?}")]
    InvalidGroup(String),
    #[error("Invalid destination directory: {0:?}")]
    InvalidDestDir(String),
    #[error("Invalid file mode: {0:?} (expected 3 or 4 octal digits)")]
    InvalidMode(String),
    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),
    #[error("Failed to quote {0}")]
    Quote(#[from] shlex::QuoteError),
}

/// How the elevated script obtains root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// `sudo -S`, password written to the channel's stdin.
    SudoStdin,
    /// `sudo -n`, requires a passwordless sudoers rule.
    SudoNonInteractive,
}

impl Elevation {
    /// Default elevation for a login credential.
    #[must_use]
    pub const fn for_credential(credential: &Credential) -> Self {
        match credential {
            Credential::Password(_) => Self::SudoStdin,
            Credential::PrivateKey { .. } => Self::SudoNonInteractive,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::SudoStdin => "sudo -S -p '' sh -c",
            Self::SudoNonInteractive => "sudo -n sh -c",
        }
    }
}

/// Sub-steps of the elevated script, each with its own exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationStep {
    OwnerExists,
    GroupExists,
    CreateDir,
    Move,
    Chown,
    Chmod,
}

impl RelocationStep {
    const ALL: [Self; 6] = [
        Self::OwnerExists,
        Self::GroupExists,
        Self::CreateDir,
        Self::Move,
        Self::Chown,
        Self::Chmod,
    ];

    /// Exit code the script uses when this step fails.
    #[must_use]
    pub const fn exit_code(self) -> u32 {
        match self {
            Self::OwnerExists => 10,
            Self::GroupExists => 11,
            Self::CreateDir => 12,
            Self::Move => 13,
            Self::Chown => 14,
            Self::Chmod => 15,
        }
    }

    /// Step for a script exit code.
    #[must_use]
    pub fn from_exit_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.exit_code() == code)
    }
}

impl fmt::Display for RelocationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OwnerExists => "check owner",
            Self::GroupExists => "check group",
            Self::CreateDir => "create directory",
            Self::Move => "move",
            Self::Chown => "chown",
            Self::Chmod => "chmod",
        };
        f.write_str(s)
    }
}

/// Whether `name` is an acceptable user or group name.
///
/// Letters, digits, `.`, `_` and `-`, not starting with a digit, dot or dash.
#[must_use]
pub fn is_valid_account_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_ACCOUNT_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Validate a plain file name (no directories).
///
/// # Errors
/// Returns error for empty names, path separators, `.`/`..` and control characters.
pub fn validate_file_name(name: &str) -> Result<&str, RelocationError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.chars().any(char::is_control);
    if invalid {
        Err(RelocationError::InvalidFileName(name.to_string()))
    } else {
        Ok(name)
    }
}

/// Collision-resistant staging path for `file_name` under `staging_dir`.
#[must_use]
pub fn staging_path(staging_dir: &str, file_name: &str) -> String {
    format!(
        "{}/fleet-{}-{file_name}",
        staging_dir.trim_end_matches('/'),
        Uuid::new_v4().simple()
    )
}

/// Where and how a file should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationSpec {
    dest_dir: String,
    owner: String,
    group: String,
    mode: String,
    elevation: Option<Elevation>,
}

impl RelocationSpec {
    /// Default permission bits.
    pub const DEFAULT_MODE: &'static str = "644";

    /// Validate and build a placement spec.
    ///
    /// # Errors
    /// Returns error if owner, group or destination directory is unsafe to
    /// embed in a remote command.
    pub fn new(
        dest_dir: impl Into<String>,
        owner: impl Into<String>,
        group: impl Into<String>,
    ) -> Result<Self, RelocationError> {
        let (dest_dir, owner, group) = (dest_dir.into(), owner.into(), group.into());
        if !is_valid_account_name(&owner) {
            return Err(RelocationError::InvalidOwner(owner));
        }
        if !is_valid_account_name(&group) {
            return Err(RelocationError::InvalidGroup(group));
        }
        if !dest_dir.starts_with('/') || dest_dir.chars().any(char::is_control) {
            return Err(RelocationError::InvalidDestDir(dest_dir));
        }
        let trimmed = dest_dir.trim_end_matches('/');
        let dest_dir = if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() };
        Ok(Self {
            dest_dir,
            owner,
            group,
            mode: Self::DEFAULT_MODE.to_string(),
            elevation: None,
        })
    }

    /// Override the permission bits.
    ///
    /// # Errors
    /// Returns error unless `mode` is 3 or 4 octal digits.
    pub fn with_mode(mut self, mode: impl Into<String>) -> Result<Self, RelocationError> {
        let mode = mode.into();
        let valid = (3..=4).contains(&mode.len()) && mode.chars().all(|c| ('0'..='7').contains(&c));
        if !valid {
            return Err(RelocationError::InvalidMode(mode));
        }
        self.mode = mode;
        Ok(self)
    }

    /// Force an elevation method instead of deriving it from the credential.
    #[must_use]
    pub const fn with_elevation(mut self, elevation: Elevation) -> Self {
        self.elevation = Some(elevation);
        self
    }

    #[must_use]
    pub fn dest_dir(&self) -> &str {
        &self.dest_dir
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// Final remote path for `file_name`.
    #[must_use]
    pub fn final_path(&self, file_name: &str) -> String {
        if self.dest_dir == "/" {
            format!("/{file_name}")
        } else {
            format!("{}/{file_name}", self.dest_dir)
        }
    }

    /// Shell script run as root. Each step exits with its own code.
    ///
    /// # Errors
    /// Returns error if a path cannot be quoted.
    pub fn script(&self, staged: &str, final_path: &str) -> Result<String, RelocationError> {
        let q = |s: &str| shlex::try_quote(s).map(std::borrow::Cow::into_owned);
        let owner = q(&self.owner)?;
        let group = q(&self.group)?;
        let owner_group = q(&format!("{}:{}", self.owner, self.group))?;
        let dir = q(&self.dest_dir)?;
        let staged = q(staged)?;
        let dest = q(final_path)?;
        let fail = |step: RelocationStep, msg: String| -> Result<String, RelocationError> {
            Ok(format!("{{ echo {} >&2; exit {}; }}", q(&msg)?, step.exit_code()))
        };

        let lines = [
            format!(
                "id -u {owner} >/dev/null 2>&1 || {}",
                fail(RelocationStep::OwnerExists, format!("user {} does not exist", self.owner))?
            ),
            format!(
                "getent group {group} >/dev/null 2>&1 || {}",
                fail(RelocationStep::GroupExists, format!("group {} does not exist", self.group))?
            ),
            format!("mkdir -p -- {dir} || exit {}", RelocationStep::CreateDir.exit_code()),
            format!("mv -f -- {staged} {dest} || exit {}", RelocationStep::Move.exit_code()),
            format!("chown -- {owner_group} {dest} || exit {}", RelocationStep::Chown.exit_code()),
            format!("chmod -- {} {dest} || exit {}", self.mode, RelocationStep::Chmod.exit_code()),
        ];
        Ok(lines.join("\n"))
    }

    fn elevation_for(&self, credential: &Credential) -> Elevation {
        match (self.elevation, credential.password()) {
            (Some(Elevation::SudoStdin), None) => Elevation::SudoNonInteractive,
            (Some(e), _) => e,
            (None, _) => Elevation::for_credential(credential),
        }
    }

    /// Full elevated command and the stdin to feed it.
    ///
    /// The password never appears in the command text.
    ///
    /// # Errors
    /// Returns error if the script cannot be quoted.
    pub fn elevated_command(
        &self,
        credential: &Credential,
        staged: &str,
        final_path: &str,
    ) -> Result<(String, Option<Vec<u8>>), RelocationError> {
        let script = self.script(staged, final_path)?;
        let elevation = self.elevation_for(credential);
        let command = format!("{} {}", elevation.prefix(), shlex::try_quote(&script)?);
        let stdin = match (elevation, credential.password()) {
            (Elevation::SudoStdin, Some(pw)) => Some(format!("{pw}\n").into_bytes()),
            _ => None,
        };
        Ok((command, stdin))
    }
}

/// Upload `local_path` to the target and move it into place.
///
/// Always returns a fully populated result; never panics on remote failure.
pub async fn relocate<R>(
    shell: &R,
    target: &Target,
    local_path: &Path,
    file_name: &str,
    spec: &RelocationSpec,
    staging_dir: &str,
) -> HostResult
where
    R: RemoteShell + ?Sized,
{
    let staged = staging_path(staging_dir, file_name);
    let final_path = spec.final_path(file_name);

    let (command, stdin) = match spec.elevated_command(&target.credential, &staged, &final_path) {
        Ok(built) => built,
        Err(e) => return HostResult::failure(FailureKind::Internal, e.to_string()),
    };

    if let Err(e) = shell.upload(target, local_path, &staged).await {
        tracing::warn!(host = %target.host, error = %e, "Staging upload failed");
        let mut result = HostResult::session_failure(&e);
        result.error = Some(format!("staging upload failed: {e}"));
        return result;
    }
    tracing::debug!(host = %target.host, %staged, "Payload staged");

    let output = match shell.exec(target, &command, stdin.as_deref()).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(host = %target.host, error = %e, "Elevated placement could not run");
            return HostResult::session_failure(&e);
        }
    };

    let mut result = HostResult::from_output(output);
    if result.ok {
        tracing::info!(host = %target.host, dest = %final_path, "File placed");
        result.dest = Some(final_path);
        return result;
    }

    let detail = result.stderr.trim();
    let message = match result.exit_code.and_then(RelocationStep::from_exit_code) {
        Some(step) => format!("relocation failed at step `{step}`: {detail}"),
        None => match result.exit_code {
            Some(code) => format!("relocation failed (elevation exit {code}): {detail}"),
            None => result
                .error
                .clone()
                .unwrap_or_else(|| "relocation failed".to_string()),
        },
    };
    tracing::warn!(host = %target.host, staged = %staged, %message, "File placement failed");
    result.error = Some(message);
    result.error_kind = Some(FailureKind::Relocation);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RelocationSpec {
        RelocationSpec::new("/opt/app/", "appuser", "appgroup").unwrap()
    }

    #[test]
    fn test_rejects_shell_metacharacters_in_owner() {
        let err = RelocationSpec::new("/opt/app", "root; rm -rf /", "root").unwrap_err();
        assert!(matches!(err, RelocationError::InvalidOwner(_)));

        for bad in ["$(id)", "a b", "`x`", "-rf", "", "user\n", "9lives"] {
            assert!(!is_valid_account_name(bad), "{bad:?} accepted");
        }
        for good in ["root", "www-data", "svc_app", "_ntp", "user.name"] {
            assert!(is_valid_account_name(good), "{good:?} rejected");
        }
    }

    #[test]
    fn test_rejects_group_dir_and_mode() {
        assert!(matches!(
            RelocationSpec::new("/opt", "root", "wheel|cat"),
            Err(RelocationError::InvalidGroup(_))
        ));
        assert!(matches!(
            RelocationSpec::new("relative/dir", "root", "root"),
            Err(RelocationError::InvalidDestDir(_))
        ));
        assert!(matches!(spec().with_mode("999"), Err(RelocationError::InvalidMode(_))));
        assert!(matches!(spec().with_mode("7"), Err(RelocationError::InvalidMode(_))));
        assert_eq!(spec().with_mode("0750").unwrap().mode(), "0750");
    }

    #[test]
    fn test_file_name_validation() {
        assert!(validate_file_name("app.tar.gz").is_ok());
        for bad in ["", ".", "..", "../etc/passwd", "a/b", "x\ny"] {
            assert!(validate_file_name(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_staging_paths_do_not_collide() {
        let a = staging_path("/tmp/", "app.bin");
        let b = staging_path("/tmp", "app.bin");
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp/fleet-"));
        assert!(a.ends_with("-app.bin"));
    }

    #[test]
    fn test_final_path_normalizes_trailing_slash() {
        assert_eq!(spec().final_path("app.bin"), "/opt/app/app.bin");
        let root = RelocationSpec::new("/", "root", "root").unwrap();
        assert_eq!(root.final_path("motd"), "/motd");
    }

    #[test]
    fn test_script_steps_in_order() {
        let script = spec().script("/tmp/fleet-x-app.bin", "/opt/app/app.bin").unwrap();
        let order = ["id -u", "getent group", "mkdir -p", "mv -f", "chown", "chmod"];
        let mut last = 0;
        for needle in order {
            let pos = script.find(needle).unwrap_or_else(|| panic!("missing {needle}"));
            assert!(pos >= last, "{needle} out of order");
            last = pos;
        }
        assert!(script.contains("exit 13"));
        assert!(script.contains("appuser:appgroup"));
    }

    #[test]
    fn test_password_goes_to_stdin_not_command() {
        let credential = Credential::Password("s3cret!".into());
        let (command, stdin) = spec()
            .elevated_command(&credential, "/tmp/s", "/opt/app/f")
            .unwrap();
        assert!(command.starts_with("sudo -S -p '' sh -c "));
        assert!(!command.contains("s3cret"));
        assert_eq!(stdin.unwrap(), b"s3cret!\n");
    }

    #[test]
    fn test_key_credential_uses_non_interactive_sudo() {
        let credential = Credential::PrivateKey {
            pem: String::new(),
            passphrase: None,
        };
        let (command, stdin) = spec()
            .with_elevation(Elevation::SudoStdin)
            .elevated_command(&credential, "/tmp/s", "/opt/app/f")
            .unwrap();
        assert!(command.starts_with("sudo -n sh -c "));
        assert!(stdin.is_none());
    }

    #[test]
    fn test_step_exit_codes_round_trip() {
        for step in RelocationStep::ALL {
            assert_eq!(RelocationStep::from_exit_code(step.exit_code()), Some(step));
        }
        assert_eq!(RelocationStep::from_exit_code(1), None);
    }

    /// Runs the generated script locally as the current user.
    #[cfg(unix)]
    mod script_execution {
        use std::{os::unix::fs::PermissionsExt, process::Command};

        use super::*;

        fn id(flag: &str) -> String {
            let out = Command::new("id").arg(flag).output().unwrap();
            assert!(out.status.success(), "id {flag} failed");
            String::from_utf8(out.stdout).unwrap().trim().to_string()
        }

        fn run(script: &str) -> Option<i32> {
            Command::new("sh").arg("-c").arg(script).status().unwrap().code()
        }

        struct Scene {
            dir: tempfile::TempDir,
            staged: String,
            dest_dir: String,
        }

        fn scene() -> Scene {
            let dir = tempfile::tempdir().unwrap();
            let staged = dir.path().join("fleet-staged-app.conf");
            std::fs::write(&staged, b"listen 8080\n").unwrap();
            let dest_dir = dir.path().join("etc/app").to_string_lossy().into_owned();
            Scene {
                staged: staged.to_string_lossy().into_owned(),
                dest_dir,
                dir,
            }
        }

        #[test]
        fn test_script_places_file_with_owner_and_mode() {
            let scene = scene();
            let spec = RelocationSpec::new(&scene.dest_dir, id("-un"), id("-gn"))
                .unwrap()
                .with_mode("640")
                .unwrap();
            let dest = spec.final_path("app.conf");

            let code = run(&spec.script(&scene.staged, &dest).unwrap());

            assert_eq!(code, Some(0));
            let meta = std::fs::metadata(&dest).unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o640);
            assert_eq!(std::fs::read(&dest).unwrap(), b"listen 8080\n");
            assert!(!Path::new(&scene.staged).exists());
        }

        #[test]
        fn test_script_missing_staged_file_fails_at_move() {
            let scene = scene();
            let spec = RelocationSpec::new(&scene.dest_dir, id("-un"), id("-gn")).unwrap();
            let dest = spec.final_path("app.conf");
            let missing = scene.dir.path().join("never-uploaded");

            let code = run(&spec.script(&missing.to_string_lossy(), &dest).unwrap());

            assert_eq!(code, i32::try_from(RelocationStep::Move.exit_code()).ok());
            assert!(!Path::new(&dest).exists());
        }

        #[test]
        fn test_script_unknown_owner_stops_before_touching_files() {
            let scene = scene();
            let spec = RelocationSpec::new(&scene.dest_dir, "fleet_no_such_user", id("-gn")).unwrap();
            let dest = spec.final_path("app.conf");

            let code = run(&spec.script(&scene.staged, &dest).unwrap());

            assert_eq!(code, i32::try_from(RelocationStep::OwnerExists.exit_code()).ok());
            assert!(Path::new(&scene.staged).exists());
            assert!(!Path::new(&scene.dest_dir).exists());
        }
    }
}

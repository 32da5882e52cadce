//! Login-shell command wrapping.

use std::path::Path;

use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Command is empty")]
    EmptyCommand,
    #[error("Failed to quote command: {0}")]
    QuoteError(#[from] shlex::QuoteError),
    #[error("Invalid shell: {0}")]
    InvalidShell(String),
}

/// Remote shell used to wrap commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginShell {
    Zsh(String),
    Bash(String),
    Sh(String),
    Other(String),
}

impl LoginShell {
    /// Program name or path as it will appear on the remote side.
    #[must_use]
    pub fn program(&self) -> &str {
        match self {
            Self::Zsh(p) | Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Whether this shell supports login mode.
    #[must_use]
    pub const fn login(&self) -> bool {
        matches!(self, Self::Zsh(_) | Self::Bash(_))
    }

    /// Classify a shell by its file name.
    ///
    /// # Errors
    /// Returns error if the name is empty or contains whitespace.
    pub fn from_program(program: &str) -> Result<Self, CommandBuildError> {
        let program = program.trim();
        if program.is_empty() || program.contains(char::is_whitespace) {
            return Err(CommandBuildError::InvalidShell(program.to_string()));
        }
        let name = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        let owned = program.to_string();
        Ok(match name {
            "zsh" => Self::Zsh(owned),
            "bash" => Self::Bash(owned),
            "sh" => Self::Sh(owned),
            _ => Self::Other(owned),
        })
    }

    /// Wrap `command` so it runs with the user's login environment.
    ///
    /// The command is passed as one quoted argument to `-c`, so pipes and
    /// redirections keep their shell meaning.
    ///
    /// # Errors
    /// Returns error if the command is blank or cannot be quoted.
    pub fn wrap(&self, command: &str) -> Result<String, CommandBuildError> {
        if command.trim().is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        let quoted = shlex::try_quote(command)?;
        let flag = if self.login() { "-lc" } else { "-c" };
        Ok(format!("{} {flag} {quoted}", self.program()))
    }
}

impl Default for LoginShell {
    fn default() -> Self {
        Self::Bash("bash".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bash_uses_login_flag() {
        let shell = LoginShell::default();
        let wrapped = shell.wrap("echo ok").unwrap();
        assert!(wrapped.starts_with("bash -lc "));
        assert_eq!(shlex::split(&wrapped).unwrap(), vec!["bash", "-lc", "echo ok"]);
    }

    #[test]
    fn test_sh_has_no_login_flag() {
        let shell = LoginShell::from_program("/bin/sh").unwrap();
        assert_eq!(shell, LoginShell::Sh("/bin/sh".into()));
        assert_eq!(shell.wrap("true").unwrap(), "/bin/sh -c true");
    }

    #[test]
    fn test_pipes_and_quotes_stay_one_argument() {
        let shell = LoginShell::default();
        let wrapped = shell.wrap("ps aux | grep 'my app' > /tmp/out").unwrap();
        let parts = shlex::split(&wrapped).unwrap();
        assert_eq!(parts, vec!["bash", "-lc", "ps aux | grep 'my app' > /tmp/out"]);
    }

    #[test]
    fn test_rejects_blank_and_nul() {
        let shell = LoginShell::default();
        assert!(matches!(shell.wrap("   "), Err(CommandBuildError::EmptyCommand)));
        assert!(matches!(shell.wrap("echo \0"), Err(CommandBuildError::QuoteError(_))));
        assert!(LoginShell::from_program("bash -x").is_err());
    }
}

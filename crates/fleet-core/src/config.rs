//! Environment-supplied configuration.

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

use crate::{Credential, HostDefaults};

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// How presented host keys are verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept and remember any key on first contact; reject later mismatches.
    #[default]
    TrustOnFirstUse,
    /// Only accept keys listed in a `known_hosts` file.
    Strict,
}

impl FromStr for HostKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tofu" | "accept-new" => Ok(Self::TrustOnFirstUse),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown host key policy `{other}` (expected tofu or strict)")),
        }
    }
}

/// Where the private key comes from, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySource {
    pub path: PathBuf,
    pub passphrase: Option<String>,
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub bind: SocketAddr,
    pub ssh_port: u16,
    pub connect_timeout: Duration,
    pub exec_timeout: Duration,
    pub transfer_timeout: Duration,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<KeySource>,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts: Option<PathBuf>,
    pub login_shell: String,
    pub max_parallel: usize,
    pub postcheck_grace: Duration,
    pub staging_dir: String,
    /// Carried for operators; no retention sweep runs.
    pub job_cleanup: Duration,
    /// Request body limit in bytes.
    pub max_content_length: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            ssh_port: 22,
            connect_timeout: Duration::from_secs(30),
            exec_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(600),
            username: "user".to_string(),
            password: None,
            private_key: None,
            host_key_policy: HostKeyPolicy::TrustOnFirstUse,
            known_hosts: None,
            login_shell: "bash".to_string(),
            max_parallel: 30,
            postcheck_grace: Duration::from_secs(1),
            staging_dir: "/tmp".to_string(),
            job_cleanup: Duration::from_secs(3600),
            max_content_length: 2 * 1024 * 1024 * 1024_u64,
        }
    }
}

impl FleetConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    ///
    /// # Errors
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(bind) = get("FLEET_BIND") {
            cfg.bind = parse("FLEET_BIND", &bind)?;
        }
        if let Some(port) = get("PORT") {
            cfg.bind.set_port(parse("PORT", &port)?);
        }
        if let Some(v) = get("SSH_DEFAULT_PORT") {
            cfg.ssh_port = parse("SSH_DEFAULT_PORT", &v)?;
        }
        if let Some(v) = get("SSH_TIMEOUT_SECONDS") {
            let secs = Duration::from_secs(parse("SSH_TIMEOUT_SECONDS", &v)?);
            cfg.connect_timeout = secs;
            cfg.exec_timeout = secs;
        }
        if let Some(v) = get("SSH_TRANSFER_TIMEOUT_SECONDS") {
            cfg.transfer_timeout = Duration::from_secs(parse("SSH_TRANSFER_TIMEOUT_SECONDS", &v)?);
        }
        if let Some(v) = get("SSH_USERNAME") {
            cfg.username = v;
        }
        cfg.password = get("SSH_PASSWORD");
        if let Some(path) = get("SSH_PRIVATE_KEY_PATH") {
            cfg.private_key = Some(KeySource {
                path: PathBuf::from(path),
                passphrase: get("SSH_KEY_PASSPHRASE"),
            });
        }
        if let Some(v) = get("SSH_HOST_KEY_POLICY") {
            cfg.host_key_policy = v.parse().map_err(|reason| ConfigError::Invalid {
                key: "SSH_HOST_KEY_POLICY",
                value: v.clone(),
                reason,
            })?;
        }
        cfg.known_hosts = get("SSH_KNOWN_HOSTS").map(PathBuf::from);
        if let Some(v) = get("SSH_LOGIN_SHELL") {
            cfg.login_shell = v;
        }
        if let Some(v) = get("MAX_PARALLEL") {
            let n: usize = parse("MAX_PARALLEL", &v)?;
            if n == 0 {
                return Err(ConfigError::Invalid {
                    key: "MAX_PARALLEL",
                    value: v,
                    reason: "must be at least 1".to_string(),
                });
            }
            cfg.max_parallel = n;
        }
        if let Some(v) = get("POSTCHECK_GRACE_MS") {
            cfg.postcheck_grace = Duration::from_millis(parse("POSTCHECK_GRACE_MS", &v)?);
        }
        if let Some(v) = get("STAGING_DIR") {
            cfg.staging_dir = v;
        }
        if let Some(v) = get("JOB_CLEANUP_SECONDS") {
            cfg.job_cleanup = Duration::from_secs(parse("JOB_CLEANUP_SECONDS", &v)?);
        }
        if let Some(v) = get("MAX_CONTENT_LENGTH") {
            cfg.max_content_length = parse("MAX_CONTENT_LENGTH", &v)?;
        }

        Ok(cfg)
    }

    /// Resolve the default credential, reading the key file if one is configured.
    ///
    /// A configured key wins over a password.
    ///
    /// # Errors
    /// Returns error if the key file cannot be read.
    pub fn credential(&self) -> Result<Credential, ConfigError> {
        if let Some(key) = &self.private_key {
            let pem = std::fs::read_to_string(&key.path).map_err(|source| ConfigError::Read {
                path: key.path.clone(),
                source,
            })?;
            return Ok(Credential::PrivateKey {
                pem,
                passphrase: key.passphrase.clone(),
            });
        }
        if self.password.is_none() {
            tracing::warn!("Neither SSH_PASSWORD nor SSH_PRIVATE_KEY_PATH is set; logins will fail");
        }
        Ok(Credential::Password(self.password.clone().unwrap_or_default()))
    }

    /// Login defaults for dispatched hosts.
    ///
    /// # Errors
    /// Returns error if the key file cannot be read.
    pub fn host_defaults(&self) -> Result<HostDefaults, ConfigError> {
        Ok(HostDefaults {
            port: self.ssh_port,
            username: self.username.clone(),
            credential: self.credential()?,
        })
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

//! Connection targets and credentials.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Credential used to authenticate a remote session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Password authentication.
    Password(String),
    /// Private key authentication (PEM or OpenSSH encoded).
    PrivateKey {
        pem: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

impl Credential {
    /// Password usable for privilege elevation, if this credential carries one.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        match self {
            Self::Password(p) => Some(p),
            Self::PrivateKey { .. } => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("pem", &"<redacted>")
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// A single remote host plus everything needed to log into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Network address of the host.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Authentication credential.
    pub credential: Credential,
}

impl Target {
    /// Create a new target.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        credential: Credential,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            credential,
        }
    }

    /// `host:port` form used for logging and host-key bookkeeping.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Login defaults applied to every host of a dispatch.
///
/// Requests only name hosts; port, user and credential come from here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDefaults {
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

impl HostDefaults {
    /// Build the target for one host.
    #[must_use]
    pub fn target(&self, host: &str) -> Target {
        Target::new(host, self.port, self.username.clone(), self.credential.clone())
    }
}

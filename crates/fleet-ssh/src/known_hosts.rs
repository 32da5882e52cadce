//! Host identity verification.

use std::{collections::HashMap, path::PathBuf, sync::Mutex};

use fleet_core::HostKeyPolicy;
use russh::keys::{HashAlg, PublicKey, check_known_hosts, check_known_hosts_path};

/// Decides whether a presented server key is acceptable.
///
/// Under trust-on-first-use the first key seen for a `host:port` is remembered
/// for the life of the process and any later, different key is refused.
#[derive(Debug)]
pub struct HostKeyVerifier {
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
    seen: Mutex<HashMap<String, String>>,
}

impl HostKeyVerifier {
    /// Create a verifier for the given policy.
    ///
    /// `known_hosts` is only consulted by the strict policy; `None` means the
    /// user's default `~/.ssh/known_hosts`.
    #[must_use]
    pub fn new(policy: HostKeyPolicy, known_hosts: Option<PathBuf>) -> Self {
        Self {
            policy,
            known_hosts,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Verifier that accepts and remembers keys on first contact.
    #[must_use]
    pub fn trust_on_first_use() -> Self {
        Self::new(HostKeyPolicy::TrustOnFirstUse, None)
    }

    /// Active policy.
    #[must_use]
    pub const fn policy(&self) -> HostKeyPolicy {
        self.policy
    }

    /// Check a server key presented by `host:port`.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        match self.policy {
            HostKeyPolicy::TrustOnFirstUse => self.remember_or_compare(host, port, key),
            HostKeyPolicy::Strict => self.check_file(host, port, key),
        }
    }

    fn remember_or_compare(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        let address = format!("{host}:{port}");
        let Ok(mut seen) = self.seen.lock() else {
            tracing::error!(%address, "Host key memory poisoned; refusing key");
            return false;
        };
        match seen.get(&address) {
            Some(known) if *known == fingerprint => true,
            Some(known) => {
                tracing::warn!(%address, %known, presented = %fingerprint, "Host key changed");
                false
            }
            None => {
                tracing::info!(%address, %fingerprint, "Trusting host key on first use");
                seen.insert(address, fingerprint);
                true
            }
        }
    }

    fn check_file(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        let checked = match &self.known_hosts {
            Some(path) => check_known_hosts_path(host, port, key, path),
            None => check_known_hosts(host, port, key),
        };
        match checked {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(host, port, "Host key not present in known_hosts");
                false
            }
            Err(e) => {
                tracing::warn!(host, port, error = %e, "Host key verification failed");
                false
            }
        }
    }
}

impl Default for HostKeyVerifier {
    fn default() -> Self {
        Self::trust_on_first_use()
    }
}

//! SSH remote session backend.
//!
//! Provides:
//! - `SshSession` - one connection per command or SFTP transfer
//! - Login-shell command wrapping
//! - Private key loading and host-key verification

pub mod command;
pub mod keys;
pub mod known_hosts;
pub mod session;

pub use command::{CommandBuildError, LoginShell};
pub use keys::{KeyKind, load_private_key};
pub use known_hosts::HostKeyVerifier;
pub use session::{SessionOptions, SshSession};

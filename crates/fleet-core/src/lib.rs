//! Core abstractions for fleet command dispatch.
//!
//! This crate provides the fundamental building blocks:
//! - `Job`, `HostStatus`, `HostResult` - the job data model
//! - `Target`, `Credential` - who to connect to and how
//! - `RemoteShell` and `JobStorage` traits
//! - `FleetConfig` - environment configuration

pub mod config;
pub mod job;
pub mod result;
pub mod target;
pub mod traits;

pub use config::{ConfigError, FleetConfig, HostKeyPolicy};
pub use job::{HostStatus, Job, JobId};
pub use result::{ExecOutput, FailureKind, HostResult, Postcheck};
pub use target::{Credential, HostDefaults, Target};
pub use traits::{JobStorage, RemoteShell, SessionError, StorageError};

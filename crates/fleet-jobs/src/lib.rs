//! Job dispatch and storage for fleet operations.
//!
//! Provides:
//! - `Dispatcher` - Fan an operation out to many hosts, blocking or as a job
//! - `relocate` - Staged upload plus elevated move into place
//! - `postcheck` - Post-command process check
//! - Storage implementations (memory)

pub mod dispatcher;
pub mod operation;
pub mod postcheck;
pub mod relocation;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::{BatchOutcome, DispatchError, DispatchSettings, Dispatcher};
pub use operation::{Operation, Payload, Placement};
pub use relocation::{Elevation, RelocationError, RelocationSpec, RelocationStep, relocate};
pub use storage::MemoryJobStore;

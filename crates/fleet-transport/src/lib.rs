//! HTTP transport for fleet dispatch.
//!
//! Provides:
//! - Wire protocol and request validation (JSON bodies, multipart uploads)
//! - Axum router over a `Dispatcher`

pub mod http;
pub mod protocol;

pub use http::{ApiError, AppState, router};
pub use protocol::{ValidationErrors, is_valid_ipv4};

//! # Trellis Core
//!
//! Shared foundation for the Trellis plugin runtime: the error kinds every
//! component reports and the `Result` alias used across the workspace.

mod error;

pub use error::{Error, Result};

/// Version of the host runtime, surfaced to plugins at initialization and
/// checked against `min_host_version` declarations.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

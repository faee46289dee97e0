//! The transport-independent plugin contract.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use trellis_core::Result;

use crate::host::{CallContext, HostApi};
use crate::registration::Registration;

/// A live plugin instance, whatever its transport.
///
/// The manager drives the lifecycle: `registration` is read once at
/// register time and cached, `init` runs before the plugin becomes
/// dispatchable, `call` may run concurrently from many tasks, and
/// `shutdown` is invoked exactly once when the record is removed or
/// replaced. Implementations that require serialized calls must provide it
/// internally.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// The plugin's capability declaration.
    async fn registration(&self) -> Result<Registration>;

    /// Initialize with the sandboxed host interface.
    async fn init(&self, host: Arc<dyn HostApi>) -> Result<()>;

    /// Invoke a named function with encoded arguments.
    async fn call(&self, ctx: &CallContext, function: &str, args: Value) -> Result<Value>;

    /// Release resources; for out-of-process plugins this ends the child.
    async fn shutdown(&self) -> Result<()>;
}

//! Host side of the out-of-process runtime.

mod broker;
mod plugin;

pub use broker::Broker;
pub use plugin::{ENV_CONFIG_PREFIX, RpcPlugin, RpcPluginOptions};

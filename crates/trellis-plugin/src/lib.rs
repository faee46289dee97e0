//! # Trellis Plugin Runtime
//!
//! The core of the Trellis extension system: discovers third-party plugins
//! on disk, runs them as WebAssembly modules or out-of-process RPC
//! executables, mediates every interaction with the host through a
//! capability-scoped, rate-limited, audited sandbox, and hot-reloads them
//! when their artifacts change.
//!
//! ## Components
//!
//! - [`manager::PluginManager`] — registry, lifecycle, dispatch, and
//!   aggregated views (routes, menu items, widgets, jobs);
//! - [`sandbox::Sandbox`] — per-plugin enforcement in front of the
//!   [`host::HostFacade`] capability surface;
//! - [`rpc`] — the out-of-process runtime with its bidirectional broker;
//! - [`wasm`] — the WebAssembly runtime (feature `wasm`, on by default);
//! - [`loader::PluginLoader`] + [`watcher::HotReloadWatcher`] — discovery,
//!   signature verification, lazy loading, and debounced hot reload;
//! - [`logring`] and [`usage`] — the audit surfaces admins observe.

pub mod dispatch;
pub mod host;
pub mod limiter;
pub mod loader;
pub mod logring;
pub mod manager;
pub mod restrict;
pub mod rpc;
pub mod sandbox;
pub mod templates;
pub mod usage;
#[cfg(feature = "wasm")]
pub mod wasm;
pub mod watcher;

pub use host::{
    CacheStore, ConfigSource, Database, DbRow, DbValue, EventSink, HostFacade, HttpFetcher,
    Mailer, PluginCaller, Translator,
};
pub use loader::{LoadReport, LoaderOptions, PluginLoader};
pub use logring::{LogEntry, LogRing};
pub use manager::{LazyLoader, PluginManager, PluginRecord, PluginSummary, Sourced};
pub use rpc::{RpcPlugin, RpcPluginOptions};
pub use sandbox::Sandbox;
pub use usage::{UsageCounters, UsageSnapshot};
pub use watcher::HotReloadWatcher;

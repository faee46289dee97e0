//! The host capability surface plugins consume.
//!
//! Every interaction a plugin has with the platform goes through
//! [`HostApi`]: database access, cache, outbound HTTP, email, structured
//! logging, configuration, translation, plugin-to-plugin calls, and event
//! publication. The host hands each plugin a sandboxed implementation; the
//! plugin-side SDK implements the same trait over the RPC callback channel.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_core::Result;

/// Maximum number of plugin-to-plugin hops within one outer request.
pub const MAX_CALL_DEPTH: u8 = 10;

/// A database row: column name to value, binary values coerced to strings.
pub type Row = BTreeMap<String, Value>;

/// Outcome of an outbound HTTP request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

/// Log severity, ordered `debug < info < warn < error`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Routine events.
    Info,
    /// Unexpected but recoverable conditions.
    Warn,
    /// Failures.
    Error,
}

impl LogLevel {
    /// Parse a level name; anything unrecognized is treated as `info`.
    #[must_use]
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(Self::Info)
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Per-request context carried through every call.
///
/// Tracks the plugin-to-plugin caller chain and the bounded call depth; the
/// sandbox increments the depth on each `call_plugin` and refuses beyond
/// [`MAX_CALL_DEPTH`]. The context crosses the RPC boundary inside call
/// payloads so chains spanning processes stay bounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallContext {
    /// Plugin that issued the current call, when it came from a plugin.
    #[serde(default)]
    pub caller: Option<String>,

    /// Number of plugin-to-plugin hops already taken.
    #[serde(default)]
    pub depth: u8,
}

impl CallContext {
    /// Context for a request entering the system from outside any plugin.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Context for a call issued by `caller`, one hop deeper.
    #[must_use]
    pub fn hop(&self, caller: impl Into<String>) -> Self {
        Self {
            caller: Some(caller.into()),
            depth: self.depth.saturating_add(1),
        }
    }
}

/// The capability interface plugins consume.
///
/// All methods are cancel-safe; blocking happens only in the backing
/// collaborators. Implementations must be shareable across threads.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Run a read query. A `@name:` prefix selects a named backend.
    async fn db_query(&self, ctx: &CallContext, query: &str, args: &[Value]) -> Result<Vec<Row>>;

    /// Run a statement, returning the number of affected rows.
    async fn db_exec(&self, ctx: &CallContext, query: &str, args: &[Value]) -> Result<u64>;

    /// Fetch a cache entry. A miss is `Ok(None)`, not an error.
    async fn cache_get(&self, ctx: &CallContext, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a cache entry. `ttl_secs` of zero means no expiry.
    async fn cache_set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<()>;

    /// Remove a cache entry.
    async fn cache_delete(&self, ctx: &CallContext, key: &str) -> Result<()>;

    /// Issue an outbound HTTP request.
    async fn http_request(
        &self,
        ctx: &CallContext,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse>;

    /// Send an email through the host's provider.
    async fn send_email(
        &self,
        ctx: &CallContext,
        to: &[String],
        subject: &str,
        body: &str,
        html: bool,
    ) -> Result<()>;

    /// Emit a structured log entry.
    fn log(&self, level: LogLevel, message: &str, fields: BTreeMap<String, Value>);

    /// Look up a host configuration value.
    async fn config_get(&self, ctx: &CallContext, key: &str) -> Result<Option<String>>;

    /// Translate a message key with positional arguments.
    async fn translate(&self, key: &str, args: &[Value]) -> String;

    /// Invoke a function on another plugin.
    async fn call_plugin(
        &self,
        ctx: &CallContext,
        name: &str,
        function: &str,
        args: Value,
    ) -> Result<Value>;

    /// Publish an event onto the host's event bus.
    async fn publish_event(&self, ctx: &CallContext, event_type: &str, data: Value) -> Result<()>;
}

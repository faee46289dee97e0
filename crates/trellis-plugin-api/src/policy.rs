//! Permissions, resource requests, and platform-side resource policies.
//!
//! A plugin *requests* capabilities in its registration; the platform
//! *grants* them through a [`ResourcePolicy`] that may narrow every request.
//! The sandbox only ever consults the policy.

use serde::{Deserialize, Serialize};

/// Capability families a permission can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionType {
    /// Database query/exec.
    Db,
    /// Cache get/set/delete.
    Cache,
    /// Outbound HTTP.
    Http,
    /// Outbound email.
    Email,
    /// Host configuration lookup.
    Config,
    /// Calling other plugins.
    PluginCall,
}

impl PermissionType {
    /// Whether access levels are meaningful for this family.
    ///
    /// For http/email/plugin_call the presence of the permission is
    /// sufficient; scope then narrows it.
    #[must_use]
    pub const fn is_leveled(self) -> bool {
        matches!(self, Self::Db | Self::Cache | Self::Config)
    }
}

/// Access level within a capability family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Read-only access.
    Read,
    /// Write-only access.
    Write,
    /// Both directions.
    ReadWrite,
}

impl Default for AccessLevel {
    fn default() -> Self {
        Self::Read
    }
}

impl AccessLevel {
    /// Whether a grant at `self` satisfies a request for `wanted`.
    #[must_use]
    pub const fn satisfies(self, wanted: Self) -> bool {
        match self {
            Self::ReadWrite => true,
            Self::Read => matches!(wanted, Self::Read),
            Self::Write => matches!(wanted, Self::Write),
        }
    }
}

/// A single granted or requested capability.
///
/// The meaning of `scope` depends on the family: table allowlist for db
/// (with `*` glob), host patterns for http (leading `*.` wildcard), plugin
/// names for plugin_call (`*` = any), addresses or `@domain` suffixes for
/// email, key patterns for config. Cache scope is implicit: keys are always
/// namespaced by plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Capability family.
    #[serde(rename = "type")]
    pub kind: PermissionType,

    /// Access level, relevant for db/cache/config.
    #[serde(default)]
    pub access: AccessLevel,

    /// Family-dependent scope entries.
    #[serde(default)]
    pub scope: Vec<String>,
}

impl Permission {
    /// A permission with the given family and access, no scope.
    #[must_use]
    pub const fn new(kind: PermissionType, access: AccessLevel) -> Self {
        Self {
            kind,
            access,
            scope: Vec::new(),
        }
    }

    /// Attach scope entries.
    #[must_use]
    pub fn with_scope(mut self, scope: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.scope = scope.into_iter().map(Into::into).collect();
        self
    }
}

/// Resources a plugin asks for in its registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Memory ceiling in bytes.
    #[serde(default = "default_memory")]
    pub max_memory_bytes: u64,

    /// Per-call timeout in milliseconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Initialization timeout in milliseconds.
    #[serde(default = "default_init_timeout")]
    pub init_timeout_ms: u64,

    /// Shutdown timeout in milliseconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,

    /// Capabilities the plugin requests.
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

const fn default_memory() -> u64 {
    64 * 1024 * 1024
}

const fn default_call_timeout() -> u64 {
    30_000
}

const fn default_init_timeout() -> u64 {
    10_000
}

const fn default_shutdown_timeout() -> u64 {
    5_000
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            max_memory_bytes: default_memory(),
            call_timeout_ms: default_call_timeout(),
            init_timeout_ms: default_init_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            permissions: Vec::new(),
        }
    }
}

/// Review status of a plugin's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    /// Not yet reviewed; runs with the conservative default grants.
    PendingReview,
    /// Reviewed and approved.
    Approved,
    /// Reviewed with narrowed grants.
    Restricted,
    /// Every capability-bearing call is denied.
    Blocked,
}

/// Platform-controlled limits and grants for one plugin.
///
/// The policy may narrow anything the plugin requested; the sandbox consults
/// nothing else. Rate caps of zero or below disable the corresponding
/// limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// Review status.
    pub status: PolicyStatus,

    /// Memory ceiling in bytes.
    #[serde(default = "default_memory")]
    pub max_memory_bytes: u64,

    /// Per-call timeout in milliseconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Initialization timeout in milliseconds.
    #[serde(default = "default_init_timeout")]
    pub init_timeout_ms: u64,

    /// Shutdown timeout in milliseconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,

    /// Granted capabilities (a subset of what was requested).
    #[serde(default)]
    pub permissions: Vec<Permission>,

    /// Ceiling on total plugin-originated calls per second.
    #[serde(default)]
    pub max_calls_per_second: i64,

    /// Ceiling on database operations per minute.
    #[serde(default)]
    pub max_db_per_minute: i64,

    /// Ceiling on outbound HTTP requests per minute.
    #[serde(default)]
    pub max_http_per_minute: i64,
}

impl ResourcePolicy {
    /// The conservative policy applied to plugins nobody has reviewed:
    /// pending status, db:read + cache:readwrite, low rate caps.
    #[must_use]
    pub fn default_for_unknown() -> Self {
        Self {
            status: PolicyStatus::PendingReview,
            max_memory_bytes: default_memory(),
            call_timeout_ms: default_call_timeout(),
            init_timeout_ms: default_init_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            permissions: vec![
                Permission::new(PermissionType::Db, AccessLevel::Read),
                Permission::new(PermissionType::Cache, AccessLevel::ReadWrite),
            ],
            max_calls_per_second: 10,
            max_db_per_minute: 60,
            max_http_per_minute: 30,
        }
    }

    /// An approved policy granting the given permissions with no rate caps.
    #[must_use]
    pub fn approved(permissions: Vec<Permission>) -> Self {
        Self {
            status: PolicyStatus::Approved,
            permissions,
            max_calls_per_second: 0,
            max_db_per_minute: 0,
            max_http_per_minute: 0,
            max_memory_bytes: default_memory(),
            call_timeout_ms: default_call_timeout(),
            init_timeout_ms: default_init_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }

    /// Whether the policy grants `kind` at `access`.
    ///
    /// For families where access levels carry no meaning, any grant of the
    /// family satisfies any requested access.
    #[must_use]
    pub fn grants(&self, kind: PermissionType, access: AccessLevel) -> bool {
        self.permissions.iter().any(|p| {
            p.kind == kind && (!kind.is_leveled() || p.access.satisfies(access))
        })
    }

    /// Merged scope entries across every grant of `kind`.
    ///
    /// Returns an empty vector when the family is granted without scope,
    /// which families interpret as "unscoped" per their own rules.
    #[must_use]
    pub fn scope_for(&self, kind: PermissionType) -> Vec<&str> {
        self.permissions
            .iter()
            .filter(|p| p.kind == kind)
            .flat_map(|p| p.scope.iter().map(String::as_str))
            .collect()
    }
}

//! Error types for Trellis.

use thiserror::Error;

/// Result type alias using the Trellis error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Core error types for the plugin runtime.
///
/// Each variant is an error *kind* with a stable meaning; the runtime
/// decides per kind whether a failure is surfaced, accumulated, or logged.
#[derive(Debug, Error)]
pub enum Error {
    /// Plugin is not known to the registry.
    #[error("plugin not found: {name}{}", caller.as_deref().map(|c| format!(" (called from {c})")).unwrap_or_default())]
    NotFound {
        /// Name that was looked up.
        name: String,
        /// Plugin that issued the call, when it came from another plugin.
        caller: Option<String>,
    },

    /// Plugin is registered but currently disabled.
    #[error("plugin disabled: {name}")]
    Disabled {
        /// Name of the disabled plugin.
        name: String,
    },

    /// Attempt to register a name already in use.
    #[error("plugin already registered: {name}")]
    Duplicate {
        /// Name that collided.
        name: String,
    },

    /// Capability not granted, scope mismatch, or policy status blocked.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A sliding-window rate limit was exhausted.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A plugin-to-plugin call chain exceeded the depth ceiling.
    #[error("plugin call depth exceeded at {source_plugin} -> {target} (depth {depth})")]
    CallDepthExceeded {
        /// Plugin issuing the call that tripped the ceiling.
        source_plugin: String,
        /// Plugin the call was aimed at.
        target: String,
        /// Depth the chain had reached.
        depth: u8,
    },

    /// Transport, signature, descriptor, or binary-permission failure at load.
    #[error("plugin load failed: {0}")]
    LoadFailed(String),

    /// RPC channel error after a successful load.
    #[error("plugin transport failed: {0}")]
    TransportFailed(String),

    /// The plugin itself signalled failure in a successful RPC reply.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// A per-call deadline tripped.
    #[error("deadline exceeded calling {plugin}.{function}")]
    DeadlineExceeded {
        /// Plugin whose call timed out.
        plugin: String,
        /// Function that was being invoked.
        function: String,
    },

    /// Malformed encoded arguments or an unknown RPC method.
    #[error("bad input: {0}")]
    BadInput(String),

    /// A backing collaborator (database, cache, mailer, ...) failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal invariant violation or aggregated failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Plugin unknown to the registry.
    #[must_use]
    pub fn not_found(name: impl Into<String>, caller: Option<String>) -> Self {
        Self::NotFound {
            name: name.into(),
            caller,
        }
    }

    /// Plugin known but inactive.
    #[must_use]
    pub fn disabled(name: impl Into<String>) -> Self {
        Self::Disabled { name: name.into() }
    }

    /// Name already in use.
    #[must_use]
    pub fn duplicate(name: impl Into<String>) -> Self {
        Self::Duplicate { name: name.into() }
    }

    /// Capability refused by the sandbox.
    #[must_use]
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Sliding window exhausted.
    #[must_use]
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    /// Load-time failure of any cause.
    #[must_use]
    pub fn load_failed(msg: impl Into<String>) -> Self {
        Self::LoadFailed(msg.into())
    }

    /// RPC channel failure after load.
    #[must_use]
    pub fn transport_failed(msg: impl Into<String>) -> Self {
        Self::TransportFailed(msg.into())
    }

    /// Failure signalled by the plugin itself.
    #[must_use]
    pub fn plugin(msg: impl Into<String>) -> Self {
        Self::Plugin(msg.into())
    }

    /// Malformed arguments or unknown method.
    #[must_use]
    pub fn bad_input(msg: impl Into<String>) -> Self {
        Self::BadInput(msg.into())
    }

    /// Collaborator failure.
    #[must_use]
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Serialization failure.
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Internal invariant violation.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Collapse a batch of failures into a single aggregate error.
    ///
    /// Returns `None` when the batch is empty.
    #[must_use]
    pub fn aggregate(label: &str, errors: Vec<Self>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let joined = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Some(Self::Internal(format!("{label}: {joined}")))
    }

    /// Whether this error was produced by sandbox policy enforcement.
    #[must_use]
    pub fn is_policy_denial(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_) | Self::RateLimited(_) | Self::CallDepthExceeded { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_caller() {
        let err = Error::not_found("stats", Some("mail".to_string()));
        let msg = err.to_string();
        assert!(msg.contains("stats"));
        assert!(msg.contains("mail"));

        let bare = Error::not_found("stats", None);
        assert!(!bare.to_string().contains("called from"));
    }

    #[test]
    fn aggregate_of_empty_is_none() {
        assert!(Error::aggregate("shutdown", Vec::new()).is_none());
    }

    #[test]
    fn aggregate_joins_messages() {
        let errs = vec![Error::disabled("a"), Error::duplicate("b")];
        let agg = Error::aggregate("shutdown", errs).unwrap();
        let msg = agg.to_string();
        assert!(msg.contains("plugin disabled: a"));
        assert!(msg.contains("plugin already registered: b"));
    }

    #[test]
    fn policy_denials_are_classified() {
        assert!(Error::permission_denied("x").is_policy_denial());
        assert!(Error::rate_limited("x").is_policy_denial());
        assert!(!Error::backend("x").is_policy_denial());
    }
}

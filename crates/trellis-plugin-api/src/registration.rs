//! Plugin registration model.
//!
//! A [`Registration`] is the complete declaration a plugin publishes when
//! asked for it: identity, metadata, and every capability it contributes to
//! the host (routes, menu items, widgets, jobs, templates, translations,
//! error codes) plus the resources it requests. Fields are populated once by
//! the plugin and treated as read-only by every consumer afterwards; absent
//! optional collections behave as empty.

use std::collections::HashMap;

use semver::Version;
use serde::{Deserialize, Serialize};

/// Complete capability declaration published by a plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registration {
    /// Plugin name (unique identifier within the manager).
    pub name: String,

    /// Plugin version (semver).
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Plugin author.
    #[serde(default)]
    pub author: Option<String>,

    /// Plugin license.
    #[serde(default)]
    pub license: Option<String>,

    /// Plugin homepage URL.
    #[serde(default)]
    pub homepage: Option<String>,

    /// Minimum host version required.
    #[serde(default)]
    pub min_host_version: Option<String>,

    /// HTTP routes contributed by the plugin.
    #[serde(default)]
    pub routes: Vec<RouteSpec>,

    /// Admin menu items contributed by the plugin.
    #[serde(default)]
    pub menu_items: Vec<MenuItem>,

    /// Dashboard widgets contributed by the plugin.
    #[serde(default)]
    pub widgets: Vec<WidgetSpec>,

    /// Scheduled jobs contributed by the plugin.
    #[serde(default)]
    pub jobs: Vec<JobSpec>,

    /// Templates shipped inside the plugin package.
    #[serde(default)]
    pub templates: Vec<TemplateSpec>,

    /// Inline translation bundle, if the plugin ships one.
    #[serde(default)]
    pub translations: Option<TranslationBundle>,

    /// Error codes the plugin may surface. The platform prefixes each code
    /// with `<plugin_name>:` before exposing it externally.
    #[serde(default)]
    pub error_codes: Vec<ErrorCodeSpec>,

    /// Resources the plugin requests; the platform policy may narrow them.
    #[serde(default)]
    pub resources: super::policy::ResourceRequest,
}

impl Registration {
    /// Validate identity fields.
    ///
    /// # Errors
    ///
    /// Returns an error when the name is empty or carries characters outside
    /// `[A-Za-z0-9_-]`, or when the version is not parseable semver.
    pub fn validate(&self) -> trellis_core::Result<()> {
        if self.name.is_empty() {
            return Err(trellis_core::Error::bad_input("plugin name is required"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(trellis_core::Error::bad_input(format!(
                "plugin name '{}' must contain only alphanumeric characters, hyphens, and underscores",
                self.name
            )));
        }
        if self.version.is_empty() {
            return Err(trellis_core::Error::bad_input("plugin version is required"));
        }
        Version::parse(&self.version).map_err(|e| {
            trellis_core::Error::bad_input(format!("invalid plugin version '{}': {e}", self.version))
        })?;
        Ok(())
    }

    /// Check the declared minimum host version against the running host.
    ///
    /// # Errors
    ///
    /// Returns an error when `min_host_version` is malformed or newer than
    /// the running host.
    pub fn check_host_version(&self, host_version: &str) -> trellis_core::Result<()> {
        let Some(min) = &self.min_host_version else {
            return Ok(());
        };
        let min = Version::parse(min).map_err(|e| {
            trellis_core::Error::bad_input(format!("invalid min_host_version '{min}': {e}"))
        })?;
        let host = Version::parse(host_version).map_err(|e| {
            trellis_core::Error::internal(format!("invalid host version '{host_version}': {e}"))
        })?;
        if host < min {
            return Err(trellis_core::Error::load_failed(format!(
                "plugin '{}' requires host {min}, running {host}",
                self.name
            )));
        }
        Ok(())
    }

    /// Error codes with the external `<plugin_name>:` prefix applied.
    #[must_use]
    pub fn prefixed_error_codes(&self) -> Vec<ErrorCodeSpec> {
        self.error_codes
            .iter()
            .map(|spec| ErrorCodeSpec {
                code: format!("{}:{}", self.name, spec.code),
                message: spec.message.clone(),
                http_status: spec.http_status,
            })
            .collect()
    }
}

/// An HTTP route the plugin asks the host to mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSpec {
    /// HTTP method.
    pub method: String,

    /// Route path, relative to the plugin's mount point.
    pub path: String,

    /// Name of the plugin function handling the route.
    pub handler: String,

    /// Middleware chain applied before the handler.
    #[serde(default)]
    pub middleware: Vec<String>,

    /// Route description.
    #[serde(default)]
    pub description: Option<String>,
}

/// A navigation entry, possibly nested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuItem {
    /// Stable identifier.
    pub id: String,

    /// Display label (subject to translation).
    pub label: String,

    /// Icon identifier.
    #[serde(default)]
    pub icon: Option<String>,

    /// Target path.
    #[serde(default)]
    pub path: Option<String>,

    /// Menu location the item attaches to.
    #[serde(default)]
    pub location: Option<String>,

    /// Parent item id, for attaching into an existing tree.
    #[serde(default)]
    pub parent: Option<String>,

    /// Sort order among siblings.
    #[serde(default)]
    pub order: i32,

    /// Nested children.
    #[serde(default)]
    pub children: Vec<MenuItem>,
}

/// A dashboard widget declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidgetSpec {
    /// Stable identifier.
    pub id: String,

    /// Widget title.
    pub title: String,

    /// Name of the plugin function rendering the widget.
    pub handler: String,

    /// Dashboard location the widget attaches to.
    #[serde(default)]
    pub location: Option<String>,

    /// Display size hint.
    #[serde(default)]
    pub size: Option<String>,

    /// Sort order among widgets at the same location.
    #[serde(default)]
    pub order: i32,

    /// Whether the widget supports client-driven refresh.
    #[serde(default)]
    pub refreshable: bool,

    /// Refresh interval in seconds, when refreshable.
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
}

/// A scheduled job declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Stable identifier.
    pub id: String,

    /// Name of the plugin function the scheduler invokes.
    pub handler: String,

    /// Cron expression.
    pub schedule: String,

    /// Job description.
    #[serde(default)]
    pub description: Option<String>,

    /// Whether the job is active.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Execution timeout, as a duration string such as `"30s"`.
    #[serde(default)]
    pub timeout: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A template shipped in the plugin package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// Template name as the engine resolves it.
    pub name: String,

    /// Path within the plugin package.
    pub path: String,

    /// Whether this template may shadow an existing host template.
    #[serde(default)]
    pub override_existing: bool,
}

/// Inline translations keyed by language tag, then by message key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslationBundle {
    /// Namespace the keys are registered under.
    pub namespace: String,

    /// Language tags the bundle covers.
    #[serde(default)]
    pub languages: Vec<String>,

    /// `language -> key -> text`.
    #[serde(default)]
    pub entries: HashMap<String, HashMap<String, String>>,
}

/// An error code the plugin may surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCodeSpec {
    /// Code, unique within the plugin.
    pub code: String,

    /// Default human-readable message.
    pub message: String,

    /// Suggested HTTP status when the code crosses the HTTP boundary.
    #[serde(default)]
    pub http_status: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(name: &str, version: &str) -> Registration {
        Registration {
            name: name.to_string(),
            version: version.to_string(),
            ..Registration::default()
        }
    }

    #[test]
    fn validate_accepts_well_formed_names() {
        assert!(minimal("stats-widget_2", "1.2.3").validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_identity() {
        assert!(minimal("", "1.0.0").validate().is_err());
        assert!(minimal("bad name", "1.0.0").validate().is_err());
        assert!(minimal("ok", "").validate().is_err());
        assert!(minimal("ok", "not-semver").validate().is_err());
    }

    #[test]
    fn host_version_gate() {
        let mut reg = minimal("stats", "1.0.0");
        reg.min_host_version = Some("0.2.0".to_string());
        assert!(reg.check_host_version("0.1.0").is_err());
        assert!(reg.check_host_version("0.2.0").is_ok());
        assert!(reg.check_host_version("1.0.0").is_ok());

        reg.min_host_version = None;
        assert!(reg.check_host_version("0.0.1").is_ok());
    }

    #[test]
    fn error_codes_are_prefixed() {
        let mut reg = minimal("stats", "1.0.0");
        reg.error_codes.push(ErrorCodeSpec {
            code: "no_data".to_string(),
            message: "no data available".to_string(),
            http_status: Some(404),
        });
        let codes = reg.prefixed_error_codes();
        assert_eq!(codes[0].code, "stats:no_data");
    }

    #[test]
    fn absent_collections_deserialize_empty() {
        let reg: Registration =
            serde_json::from_str(r#"{"name":"stats","version":"1.0.0"}"#).unwrap();
        assert!(reg.routes.is_empty());
        assert!(reg.jobs.is_empty());
        assert!(reg.translations.is_none());
        assert!(reg.resources.permissions.is_empty());
    }
}

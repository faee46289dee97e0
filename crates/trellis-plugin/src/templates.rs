//! Process-global registry of plugin template overrides.
//!
//! The template engine is an external collaborator; the runtime only tracks
//! which plugin claims which template name so the engine can resolve
//! overrides. Like the log ring, the registry is a process-wide singleton
//! with a setter so tests install their own.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use trellis_plugin_api::TemplateSpec;

/// A template claimed by a plugin.
#[derive(Debug, Clone)]
pub struct TemplateOverride {
    /// Plugin that shipped the template.
    pub plugin: String,
    /// Path within the plugin package.
    pub path: String,
    /// Whether it may shadow an existing host template.
    pub override_existing: bool,
}

/// Registry mapping template names to their owning plugin.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, TemplateOverride>>,
}

impl TemplateRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish every template a plugin declares. Later registrations win
    /// for colliding names.
    pub fn publish(&self, plugin: &str, specs: &[TemplateSpec]) {
        let mut templates = self.templates.write();
        for spec in specs {
            templates.insert(
                spec.name.clone(),
                TemplateOverride {
                    plugin: plugin.to_string(),
                    path: spec.path.clone(),
                    override_existing: spec.override_existing,
                },
            );
        }
    }

    /// Drop every template the plugin published.
    pub fn remove_plugin(&self, plugin: &str) {
        self.templates.write().retain(|_, t| t.plugin != plugin);
    }

    /// Resolve a template name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<TemplateOverride> {
        self.templates.read().get(name).cloned()
    }

    /// All registered names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.templates.read().keys().cloned().collect()
    }
}

static GLOBAL: Lazy<RwLock<Arc<TemplateRegistry>>> =
    Lazy::new(|| RwLock::new(Arc::new(TemplateRegistry::new())));

/// The process-global registry.
#[must_use]
pub fn global() -> Arc<TemplateRegistry> {
    Arc::clone(&GLOBAL.read())
}

/// Replace the process-global registry.
pub fn set_global(registry: Arc<TemplateRegistry>) {
    *GLOBAL.write() = registry;
}

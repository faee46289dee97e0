//! Plugin registry, lifecycle, and dispatch.
//!
//! The manager owns the only mutable shared state in the core: the map from
//! plugin name to live record. Lookups take the shared lock and release it
//! before invoking the plugin, so a long-running call never blocks registry
//! mutation; mutations take the exclusive lock. Replacement constructs and
//! initializes the new instance before the old one is shut down, and
//! callers already holding the old record finish against it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use trellis_core::{Error, Result};
use trellis_plugin_api::host::{CallContext, HostApi};
use trellis_plugin_api::policy::ResourcePolicy;
use trellis_plugin_api::registration::{JobSpec, MenuItem, Registration, RouteSpec, WidgetSpec};
use trellis_plugin_api::Plugin;

use crate::host::{HostFacade, PluginCaller};
use crate::sandbox::Sandbox;
use crate::templates;
use crate::usage::UsageSnapshot;

/// A live plugin: the implementation handle, its cached registration
/// snapshot, its enabled flag, and its sandbox.
pub struct PluginRecord {
    /// The transport-specific implementation.
    pub plugin: Arc<dyn Plugin>,
    /// Registration captured at register time; the runtime never re-reads
    /// it, so later mutations by the plugin change nothing.
    pub registration: Registration,
    /// The enforcement wrapper bound to this plugin's policy.
    pub sandbox: Arc<Sandbox>,
    enabled: AtomicBool,
}

impl PluginRecord {
    /// Whether the record is dispatchable.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// Materializes plugins on first dispatch when the loader runs lazily.
#[async_trait]
pub trait LazyLoader: Send + Sync {
    /// Ensure `name` is registered, loading it if it is merely discovered.
    async fn ensure_loaded(&self, name: &str) -> Result<()>;
}

/// An aggregated-view entry tagged with its source plugin.
#[derive(Debug, Clone)]
pub struct Sourced<T> {
    /// Plugin that declared the entry.
    pub plugin: String,
    /// The declaration itself.
    pub entry: T,
}

/// Summary row for admin listings.
#[derive(Debug, Clone)]
pub struct PluginSummary {
    /// Plugin name.
    pub name: String,
    /// Declared version.
    pub version: String,
    /// Whether the record is enabled.
    pub enabled: bool,
    /// Usage counters at the time of the listing.
    pub usage: UsageSnapshot,
}

/// The registry of live plugins.
pub struct PluginManager {
    host_version: String,
    facade: Arc<HostFacade>,
    plugins: RwLock<HashMap<String, Arc<PluginRecord>>>,
    policies: RwLock<HashMap<String, ResourcePolicy>>,
    lazy_loader: RwLock<Option<Arc<dyn LazyLoader>>>,
}

impl PluginManager {
    /// A manager dispatching plugin-to-plugin calls through `facade`.
    #[must_use]
    pub fn new(host_version: impl Into<String>, facade: Arc<HostFacade>) -> Arc<Self> {
        let manager = Arc::new(Self {
            host_version: host_version.into(),
            facade,
            plugins: RwLock::new(HashMap::new()),
            policies: RwLock::new(HashMap::new()),
            lazy_loader: RwLock::new(None),
        });
        let caller: Arc<dyn PluginCaller> = Arc::clone(&manager) as Arc<dyn PluginCaller>;
        manager.facade.attach_plugin_caller(&caller);
        manager
    }

    /// Install the lazy-loading collaborator consulted on lookup misses.
    pub fn set_lazy_loader(&self, loader: Arc<dyn LazyLoader>) {
        *self.lazy_loader.write() = Some(loader);
    }

    /// The platform policy for `name`: the stored one, or the conservative
    /// default for plugins nobody has reviewed.
    #[must_use]
    pub fn policy_for(&self, name: &str) -> ResourcePolicy {
        self.policies
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(ResourcePolicy::default_for_unknown)
    }

    /// Store a policy and swap it into the live sandbox, if any. The swap
    /// is atomic from the viewpoint of in-flight calls.
    pub fn set_policy(&self, name: &str, policy: ResourcePolicy) {
        self.policies.write().insert(name.to_string(), policy.clone());
        let record = self.plugins.read().get(name).cloned();
        if let Some(record) = record {
            record.sandbox.set_policy(policy);
        }
    }

    /// Register a plugin: read its registration, refuse duplicates,
    /// initialize it behind a sandbox, store the record, and publish its
    /// template overrides. Nothing is stored when initialization fails.
    ///
    /// # Errors
    ///
    /// Fails on invalid registrations, duplicate names, host-version
    /// mismatches, and initialization failures.
    pub async fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let registration = plugin.registration().await?;
        registration.validate()?;
        registration.check_host_version(&self.host_version)?;
        let name = registration.name.clone();

        if self.plugins.read().contains_key(&name) {
            return Err(Error::duplicate(name));
        }

        let sandbox = Sandbox::new(&name, Arc::clone(&self.facade), self.policy_for(&name));
        plugin.init(Arc::clone(&sandbox) as Arc<dyn HostApi>).await?;

        let record = Arc::new(PluginRecord {
            plugin,
            registration,
            sandbox,
            enabled: AtomicBool::new(true),
        });

        let duplicate = {
            let mut plugins = self.plugins.write();
            if plugins.contains_key(&name) {
                true
            } else {
                plugins.insert(name.clone(), Arc::clone(&record));
                false
            }
        };
        if duplicate {
            // Lost a registration race after init; roll the newcomer back.
            record.plugin.shutdown().await.ok();
            return Err(Error::duplicate(name));
        }

        templates::global().publish(&name, &record.registration.templates);
        tracing::info!(plugin = %name, version = %record.registration.version, "registered plugin");
        Ok(())
    }

    /// Shut a plugin down and remove its record.
    ///
    /// # Errors
    ///
    /// Fails when the name is unknown; shutdown failures propagate after
    /// the record is already gone.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let record = self
            .plugins
            .write()
            .remove(name)
            .ok_or_else(|| Error::not_found(name, None))?;
        templates::global().remove_plugin(name);
        tracing::info!(plugin = %name, "unregistered plugin");
        record.plugin.shutdown().await
    }

    /// Mark a plugin dispatchable.
    ///
    /// # Errors
    ///
    /// Fails when the name is unknown.
    pub fn enable(&self, name: &str) -> Result<()> {
        let plugins = self.plugins.write();
        let record = plugins.get(name).ok_or_else(|| Error::not_found(name, None))?;
        record.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Mark a plugin inactive: lookups refuse it and aggregated views skip
    /// it, but the record and its state stay.
    ///
    /// # Errors
    ///
    /// Fails when the name is unknown.
    pub fn disable(&self, name: &str) -> Result<()> {
        let plugins = self.plugins.write();
        let record = plugins.get(name).ok_or_else(|| Error::not_found(name, None))?;
        record.enabled.store(false, Ordering::Release);
        Ok(())
    }

    /// Fetch an enabled plugin's record.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<PluginRecord>> {
        self.plugins
            .read()
            .get(name)
            .filter(|r| r.is_enabled())
            .cloned()
    }

    /// Whether a record exists under `name`, enabled or not.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.read().contains_key(name)
    }

    /// Usage counters for one plugin.
    #[must_use]
    pub fn usage_for(&self, name: &str) -> Option<UsageSnapshot> {
        self.plugins.read().get(name).map(|r| r.sandbox.usage())
    }

    /// Invoke `function` on plugin `name` for a host-originated request.
    ///
    /// # Errors
    ///
    /// Fails with distinct errors for unknown and disabled plugins, plus
    /// whatever the plugin itself returns.
    pub async fn call(
        &self,
        ctx: &CallContext,
        name: &str,
        function: &str,
        args: Value,
    ) -> Result<Value> {
        self.dispatch(ctx, None, name, function, args).await
    }

    /// Invoke `function` on plugin `name` on behalf of plugin `caller`;
    /// not-found and disabled errors name the caller.
    ///
    /// # Errors
    ///
    /// As [`Self::call`].
    pub async fn call_from(
        &self,
        ctx: &CallContext,
        caller: &str,
        name: &str,
        function: &str,
        args: Value,
    ) -> Result<Value> {
        self.dispatch(ctx, Some(caller), name, function, args).await
    }

    async fn dispatch(
        &self,
        ctx: &CallContext,
        caller: Option<&str>,
        name: &str,
        function: &str,
        args: Value,
    ) -> Result<Value> {
        let mut record = self.plugins.read().get(name).cloned();

        if record.is_none() {
            // A lazily discovered plugin may exist on disk; materialize it
            // and retry the lookup once.
            let loader = self.lazy_loader.read().clone();
            if let Some(loader) = loader {
                if let Err(e) = loader.ensure_loaded(name).await {
                    tracing::warn!(plugin = %name, "lazy load failed: {e}");
                }
                record = self.plugins.read().get(name).cloned();
            }
        }

        let Some(record) = record else {
            return Err(Error::not_found(name, caller.map(str::to_string)));
        };
        if !record.is_enabled() {
            return Err(Error::disabled(name));
        }
        record.plugin.call(ctx, function, args).await
    }

    /// Atomically swap the plugin under `name` for `new`.
    ///
    /// The new instance is initialized first; the old one is shut down only
    /// after the swap, and in-flight calls holding the old record finish
    /// against it. When `name` is absent this degenerates to registration.
    ///
    /// # Errors
    ///
    /// Fails when the new instance's registration is invalid or does not
    /// carry `name`, or when its initialization fails; the live record is
    /// untouched in every failure case.
    pub async fn replace(&self, name: &str, new: Arc<dyn Plugin>) -> Result<()> {
        let registration = new.registration().await?;
        registration.validate()?;
        registration.check_host_version(&self.host_version)?;
        if registration.name != name {
            return Err(Error::bad_input(format!(
                "replacement for '{name}' registers as '{}'",
                registration.name
            )));
        }

        let sandbox = Sandbox::new(name, Arc::clone(&self.facade), self.policy_for(name));
        new.init(Arc::clone(&sandbox) as Arc<dyn HostApi>).await?;

        let record = Arc::new(PluginRecord {
            plugin: new,
            registration,
            sandbox,
            enabled: AtomicBool::new(true),
        });

        let old = self.plugins.write().insert(name.to_string(), record);

        let registry = templates::global();
        registry.remove_plugin(name);
        if let Some(current) = self.plugins.read().get(name) {
            registry.publish(name, &current.registration.templates);
        }

        if let Some(old) = old {
            if let Err(e) = old.plugin.shutdown().await {
                tracing::warn!(plugin = %name, "old instance shutdown failed: {e}");
            }
            tracing::info!(plugin = %name, "replaced plugin");
        } else {
            tracing::info!(plugin = %name, "registered plugin via replace");
        }
        Ok(())
    }

    /// Every route declared by enabled plugins, tagged with its source.
    #[must_use]
    pub fn routes(&self) -> Vec<Sourced<RouteSpec>> {
        self.collect(|reg| reg.routes.clone())
    }

    /// Menu items from enabled plugins, optionally filtered by location,
    /// ordered by their declared sort order.
    #[must_use]
    pub fn menu_items(&self, location: Option<&str>) -> Vec<Sourced<MenuItem>> {
        let mut items: Vec<Sourced<MenuItem>> = self.collect(|reg| reg.menu_items.clone());
        if let Some(location) = location {
            items.retain(|i| i.entry.location.as_deref() == Some(location));
        }
        items.sort_by_key(|i| i.entry.order);
        items
    }

    /// Widgets from enabled plugins, optionally filtered by location,
    /// ordered by their declared sort order.
    #[must_use]
    pub fn widgets(&self, location: Option<&str>) -> Vec<Sourced<WidgetSpec>> {
        let mut widgets: Vec<Sourced<WidgetSpec>> = self.collect(|reg| reg.widgets.clone());
        if let Some(location) = location {
            widgets.retain(|w| w.entry.location.as_deref() == Some(location));
        }
        widgets.sort_by_key(|w| w.entry.order);
        widgets
    }

    /// Scheduled jobs declared by enabled plugins.
    #[must_use]
    pub fn jobs(&self) -> Vec<Sourced<JobSpec>> {
        self.collect(|reg| reg.jobs.clone())
    }

    fn collect<T>(&self, pick: impl Fn(&Registration) -> Vec<T>) -> Vec<Sourced<T>> {
        self.plugins
            .read()
            .values()
            .filter(|record| record.is_enabled())
            .flat_map(|record| {
                let plugin = record.registration.name.clone();
                pick(&record.registration)
                    .into_iter()
                    .map(move |entry| Sourced {
                        plugin: plugin.clone(),
                        entry,
                    })
            })
            .collect()
    }

    /// Summary of every record, enabled or not.
    #[must_use]
    pub fn list(&self) -> Vec<PluginSummary> {
        let mut summaries: Vec<PluginSummary> = self
            .plugins
            .read()
            .values()
            .map(|record| PluginSummary {
                name: record.registration.name.clone(),
                version: record.registration.version.clone(),
                enabled: record.is_enabled(),
                usage: record.sandbox.usage(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn count(&self) -> usize {
        self.plugins.read().len()
    }

    /// Shut down every plugin, emptying the registry and accumulating
    /// failures into one aggregate error.
    ///
    /// # Errors
    ///
    /// Fails when any plugin's shutdown failed.
    pub async fn shutdown_all(&self) -> Result<()> {
        let drained: Vec<(String, Arc<PluginRecord>)> =
            self.plugins.write().drain().collect();

        let registry = templates::global();
        let mut failures = Vec::new();
        for (name, record) in drained {
            registry.remove_plugin(&name);
            if let Err(e) = record.plugin.shutdown().await {
                failures.push(Error::internal(format!("{name}: {e}")));
            }
        }
        match Error::aggregate("shutdown failures", failures) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PluginCaller for PluginManager {
    async fn route(
        &self,
        ctx: &CallContext,
        name: &str,
        function: &str,
        args: Value,
    ) -> Result<Value> {
        let caller = ctx.caller.clone();
        self.dispatch(ctx, caller.as_deref(), name, function, args)
            .await
    }
}

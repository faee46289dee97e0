//! Plugin discovery and materialization.
//!
//! Discovery walks the plugin root: every top-level `*.wasm` file is a
//! wasm plugin named after the file, and every first-level subdirectory
//! with a `plugin.yaml` descriptor of `runtime: grpc` is an out-of-process
//! plugin. Discovery is distinct from being loaded: eager mode
//! materializes everything up front, lazy mode materializes on first
//! dispatch via [`PluginManager::set_lazy_loader`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use trellis_core::{Error, Result};
use trellis_plugin_api::Plugin;
use trellis_plugin_api::policy::{AccessLevel, PermissionType};

use crate::manager::{LazyLoader, PluginManager};
use crate::restrict::RestrictionOptions;
use crate::rpc::{RpcPlugin, RpcPluginOptions};

/// Environment variable forcing signature verification at load.
pub const ENV_REQUIRE_SIGNATURES: &str = "TRELLIS_REQUIRE_SIGNATURES";

/// Descriptor file expected at the root of a plugin subdirectory.
pub const DESCRIPTOR_FILE: &str = "plugin.yaml";

/// Runtime named in a plugin descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorRuntime {
    /// A WebAssembly module.
    Wasm,
    /// An out-of-process RPC executable.
    Grpc,
    /// A template-only package, owned by the template engine.
    #[default]
    Template,
}

/// Raw `plugin.yaml` shape. Unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
struct RawDescriptor {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    runtime: DescriptorRuntime,
    #[serde(default)]
    binary: Option<String>,
}

/// A parsed descriptor with defaults applied.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Plugin name; defaults to the subdirectory name.
    pub name: String,
    /// Declared version, if any.
    pub version: Option<String>,
    /// Declared runtime.
    pub runtime: DescriptorRuntime,
    /// Binary path relative to the subdirectory; defaults to the name.
    pub binary: String,
}

/// Parse a descriptor file, applying the directory-name default.
///
/// # Errors
///
/// Fails when the file is unreadable or not YAML.
pub fn parse_descriptor(path: &Path, dir_name: &str) -> Result<Manifest> {
    let text = std::fs::read_to_string(path)?;
    let raw: RawDescriptor = serde_yaml::from_str(&text)
        .map_err(|e| Error::load_failed(format!("{}: {e}", path.display())))?;
    let name = raw
        .name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| dir_name.to_string());
    let binary = raw.binary.filter(|b| !b.is_empty()).unwrap_or_else(|| name.clone());
    Ok(Manifest {
        name,
        version: raw.version,
        runtime: raw.runtime,
        binary,
    })
}

/// How a discovered plugin is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    /// A lone `*.wasm` file.
    Wasm,
    /// A descriptor directory with an RPC executable.
    Rpc,
}

/// A plugin present on disk, loaded or not.
#[derive(Debug, Clone)]
pub struct Discovery {
    /// Plugin name.
    pub name: String,
    /// Wasm file or plugin subdirectory.
    pub path: PathBuf,
    /// Materialization kind.
    pub kind: DiscoveryKind,
    /// Cached manifest for descriptor-based plugins.
    pub manifest: Option<Manifest>,
    /// Whether a live instance currently backs this discovery.
    pub loaded: bool,
}

impl Discovery {
    /// Absolute path of the RPC binary, for descriptor discoveries.
    #[must_use]
    pub fn binary_path(&self) -> Option<PathBuf> {
        let manifest = self.manifest.as_ref()?;
        let binary = Path::new(&manifest.binary);
        Some(if binary.is_absolute() {
            binary.to_path_buf()
        } else {
            self.path.join(binary)
        })
    }
}

/// Outcome of an eager [`PluginLoader::load_all`].
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Discoveries present after the walk.
    pub discovered: usize,
    /// Plugins successfully materialized by this call.
    pub loaded: usize,
    /// Per-plugin failures; they do not abort the rest.
    pub failures: Vec<(String, String)>,
}

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Plugin root to walk.
    pub root: PathBuf,
    /// Host version handed to RPC children.
    pub host_version: String,
    /// Verify artifact signatures even without the environment override.
    pub verify_signatures: bool,
    /// Keys trusted to sign artifacts.
    pub trusted_keys: Vec<trellis_signer::PublicKey>,
    /// OS restriction applied to RPC children.
    pub restriction: RestrictionOptions,
    /// Per-call deadline for RPC plugins.
    pub call_timeout: Duration,
    /// Launch/handshake deadline for RPC plugins.
    pub startup_timeout: Duration,
    /// Root for per-plugin writable work directories.
    pub work_root: PathBuf,
}

impl LoaderOptions {
    /// Options rooted at `root` with defaults everywhere else.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        let work_root = root.join(".work");
        Self {
            root,
            host_version: trellis_core::HOST_VERSION.to_string(),
            verify_signatures: false,
            trusted_keys: Vec::new(),
            restriction: RestrictionOptions::default(),
            call_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(10),
            work_root,
        }
    }
}

/// Walks the plugin root and turns discoveries into live plugins.
pub struct PluginLoader {
    options: LoaderOptions,
    manager: Arc<PluginManager>,
    discoveries: DashMap<String, Discovery>,
    #[cfg(feature = "wasm")]
    engine: wasmtime::Engine,
}

impl PluginLoader {
    /// A loader feeding `manager`, creating the plugin root if missing.
    ///
    /// # Errors
    ///
    /// Fails when the plugin root cannot be created.
    pub fn new(manager: Arc<PluginManager>, options: LoaderOptions) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&options.root)?;
        Ok(Arc::new(Self {
            options,
            manager,
            discoveries: DashMap::new(),
            #[cfg(feature = "wasm")]
            engine: crate::wasm::default_engine(),
        }))
    }

    /// The plugin root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.options.root
    }

    /// Whether signatures must verify before anything loads.
    #[must_use]
    pub fn signatures_required(&self) -> bool {
        self.options.verify_signatures
            || std::env::var(ENV_REQUIRE_SIGNATURES).is_ok_and(|v| v == "1")
    }

    /// Walk the root and record discoveries. Bad descriptors are logged
    /// and skipped; repeating the walk on an unchanged tree yields the
    /// same set.
    ///
    /// # Errors
    ///
    /// Fails only when the root itself cannot be read.
    pub fn discover_all(&self) -> Result<Vec<Discovery>> {
        for entry in std::fs::read_dir(&self.options.root)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() && path.extension().is_some_and(|ext| ext == "wasm") {
                let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned())
                else {
                    continue;
                };
                self.record(Discovery {
                    name,
                    path,
                    kind: DiscoveryKind::Wasm,
                    manifest: None,
                    loaded: false,
                });
            } else if path.is_dir() {
                let descriptor = path.join(DESCRIPTOR_FILE);
                if !descriptor.is_file() {
                    continue;
                }
                let dir_name = entry.file_name().to_string_lossy().into_owned();
                match parse_descriptor(&descriptor, &dir_name) {
                    Ok(manifest) if manifest.runtime == DescriptorRuntime::Grpc => {
                        self.record(Discovery {
                            name: manifest.name.clone(),
                            path,
                            kind: DiscoveryKind::Rpc,
                            manifest: Some(manifest),
                            loaded: false,
                        });
                    }
                    Ok(manifest) => {
                        tracing::debug!(
                            plugin = %manifest.name,
                            runtime = ?manifest.runtime,
                            "descriptor is not loader-managed; skipping"
                        );
                    }
                    Err(e) => {
                        tracing::warn!("skipping bad descriptor {}: {e}", descriptor.display());
                    }
                }
            }
        }
        Ok(self.discoveries())
    }

    /// Record (or refresh) a discovery, preserving its loaded flag.
    pub(crate) fn record(&self, discovery: Discovery) {
        match self.discoveries.get_mut(&discovery.name) {
            Some(mut existing) => {
                let loaded = existing.loaded;
                *existing = Discovery { loaded, ..discovery };
            }
            None => {
                self.discoveries.insert(discovery.name.clone(), discovery);
            }
        }
    }

    /// Current discovery set.
    #[must_use]
    pub fn discoveries(&self) -> Vec<Discovery> {
        let mut all: Vec<Discovery> = self
            .discoveries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// One discovery by name.
    #[must_use]
    pub fn discovery(&self, name: &str) -> Option<Discovery> {
        self.discoveries.get(name).map(|d| d.value().clone())
    }

    /// Walk the root and, unless `lazy`, materialize every discovery.
    /// Failures are collected, not propagated; one broken plugin never
    /// blocks the rest.
    ///
    /// # Errors
    ///
    /// Fails only when the root cannot be read.
    pub async fn load_all(&self, lazy: bool) -> Result<LoadReport> {
        let discovered = self.discover_all()?;
        let mut report = LoadReport {
            discovered: discovered.len(),
            ..LoadReport::default()
        };
        if lazy {
            tracing::info!(count = report.discovered, "recorded discoveries for lazy loading");
            return Ok(report);
        }

        for discovery in discovered {
            if discovery.loaded {
                continue;
            }
            match self.materialize(&discovery.name).await {
                Ok(()) => report.loaded += 1,
                Err(e) => {
                    tracing::warn!(plugin = %discovery.name, "load failed: {e}");
                    report.failures.push((discovery.name, e.to_string()));
                }
            }
        }
        tracing::info!(
            loaded = report.loaded,
            failed = report.failures.len(),
            "plugin load complete"
        );
        Ok(report)
    }

    /// Materialize one discovery and register it with the manager.
    ///
    /// # Errors
    ///
    /// Load, signature, and registration failures all surface as-is; a
    /// partially constructed instance is shut down first.
    pub async fn materialize(&self, name: &str) -> Result<()> {
        let discovery = self
            .discovery(name)
            .ok_or_else(|| Error::not_found(name, None))?;

        let instance = self.build_instance(&discovery).await?;
        if let Err(e) = self.manager.register(Arc::clone(&instance)).await {
            instance.shutdown().await.ok();
            return Err(e);
        }
        if let Some(mut entry) = self.discoveries.get_mut(name) {
            entry.loaded = true;
        }
        Ok(())
    }

    /// Construct a live instance without registering it.
    async fn build_instance(&self, discovery: &Discovery) -> Result<Arc<dyn Plugin>> {
        match discovery.kind {
            DiscoveryKind::Wasm => {
                if self.signatures_required() {
                    self.verify_signature(&discovery.path)?;
                }
                #[cfg(feature = "wasm")]
                {
                    let plugin = crate::wasm::WasmPlugin::load(&self.engine, &discovery.path)?;
                    Ok(Arc::new(plugin))
                }
                #[cfg(not(feature = "wasm"))]
                {
                    Err(Error::load_failed(format!(
                        "{}: wasm support is not compiled in",
                        discovery.path.display()
                    )))
                }
            }
            DiscoveryKind::Rpc => {
                let binary = discovery.binary_path().ok_or_else(|| {
                    Error::load_failed(format!("'{}' has no manifest", discovery.name))
                })?;
                if !binary.is_file() {
                    return Err(Error::load_failed(format!(
                        "binary {} does not exist",
                        binary.display()
                    )));
                }
                ensure_executable(&binary)?;
                if self.signatures_required() {
                    self.verify_signature(&binary)?;
                }

                let policy = self.manager.policy_for(&discovery.name);
                let options = RpcPluginOptions {
                    binary,
                    install_dir: discovery.path.clone(),
                    work_dir: self.options.work_root.join(&discovery.name),
                    host_version: self.options.host_version.clone(),
                    call_timeout: self.options.call_timeout,
                    startup_timeout: self.options.startup_timeout,
                    restriction: self.options.restriction.clone(),
                    http_granted: policy.grants(PermissionType::Http, AccessLevel::Read),
                };
                let plugin = RpcPlugin::launch(options).await?;
                Ok(Arc::new(plugin))
            }
        }
    }

    /// Atomic reload: construct and initialize the new instance first,
    /// then swap it in under the same name (or plain-register it when the
    /// name is absent). On construction failure the live record is
    /// untouched.
    ///
    /// # Errors
    ///
    /// Surfaces construction and swap failures.
    pub async fn reload(&self, name: &str) -> Result<()> {
        let discovery = self
            .discovery(name)
            .ok_or_else(|| Error::not_found(name, None))?;

        let instance = self.build_instance(&discovery).await?;
        if let Err(e) = self.manager.replace(name, Arc::clone(&instance)).await {
            instance.shutdown().await.ok();
            return Err(e);
        }
        if let Some(mut entry) = self.discoveries.get_mut(name) {
            entry.loaded = true;
        }
        tracing::info!(plugin = %name, "reloaded");
        Ok(())
    }

    /// Unregister a live plugin and forget its discovery entirely.
    pub async fn remove(&self, name: &str) {
        if self.manager.contains(name) {
            if let Err(e) = self.manager.unregister(name).await {
                tracing::warn!(plugin = %name, "unregister failed: {e}");
            }
        }
        self.discoveries.remove(name);
    }

    /// Unregister a live plugin but keep the discovery, marked unloaded;
    /// used when an RPC binary vanishes while its descriptor remains.
    pub async fn unload(&self, name: &str) {
        if self.manager.contains(name) {
            if let Err(e) = self.manager.unregister(name).await {
                tracing::warn!(plugin = %name, "unregister failed: {e}");
            }
        }
        if let Some(mut entry) = self.discoveries.get_mut(name) {
            entry.loaded = false;
        }
    }

    /// Discovery owning `path` as its wasm artifact.
    #[must_use]
    pub fn find_by_wasm_path(&self, path: &Path) -> Option<String> {
        self.discoveries
            .iter()
            .find(|d| d.kind == DiscoveryKind::Wasm && d.path == path)
            .map(|d| d.name.clone())
    }

    /// Discovery owning `path` as its RPC binary.
    #[must_use]
    pub fn find_by_binary(&self, path: &Path) -> Option<String> {
        self.discoveries
            .iter()
            .find(|d| d.kind == DiscoveryKind::Rpc && d.binary_path().as_deref() == Some(path))
            .map(|d| d.name.clone())
    }

    /// Discovery rooted at subdirectory `dir`.
    #[must_use]
    pub fn find_by_dir(&self, dir: &Path) -> Option<String> {
        self.discoveries
            .iter()
            .find(|d| d.kind == DiscoveryKind::Rpc && d.path == dir)
            .map(|d| d.name.clone())
    }

    fn verify_signature(&self, artifact: &Path) -> Result<()> {
        trellis_signer::verify_artifact(artifact, &self.options.trusted_keys).map_err(|e| {
            Error::load_failed(format!(
                "signature verification failed for {}: {e}",
                artifact.display()
            ))
        })
    }
}

#[async_trait]
impl LazyLoader for PluginLoader {
    async fn ensure_loaded(&self, name: &str) -> Result<()> {
        if self.manager.contains(name) {
            return Ok(());
        }
        if self.discovery(name).is_none() {
            return Err(Error::not_found(name, None));
        }
        self.materialize(name).await
    }
}

fn ensure_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let mode = std::fs::metadata(path)?.permissions().mode();
        if mode & 0o111 == 0 {
            return Err(Error::load_failed(format!(
                "binary {} is not executable",
                path.display()
            )));
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("trellis-loader-{tag}-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn descriptor_defaults() {
        let dir = scratch("descr");
        let path = dir.join(DESCRIPTOR_FILE);

        std::fs::write(&path, "runtime: grpc\n").unwrap();
        let manifest = parse_descriptor(&path, "my-plugin").unwrap();
        assert_eq!(manifest.name, "my-plugin");
        assert_eq!(manifest.binary, "my-plugin");
        assert_eq!(manifest.runtime, DescriptorRuntime::Grpc);

        std::fs::write(&path, "name: analytics\nbinary: bin/analytics\nruntime: grpc\n").unwrap();
        let manifest = parse_descriptor(&path, "dir-name").unwrap();
        assert_eq!(manifest.name, "analytics");
        assert_eq!(manifest.binary, "bin/analytics");

        // No runtime key defaults to template.
        std::fs::write(&path, "name: theme\n").unwrap();
        let manifest = parse_descriptor(&path, "theme").unwrap();
        assert_eq!(manifest.runtime, DescriptorRuntime::Template);

        // Unknown keys are ignored.
        std::fs::write(&path, "name: x\nruntime: grpc\nfancy_extra: true\n").unwrap();
        assert!(parse_descriptor(&path, "x").is_ok());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn malformed_descriptor_is_an_error() {
        let dir = scratch("bad-descr");
        let path = dir.join(DESCRIPTOR_FILE);
        std::fs::write(&path, ":\n  - not yaml at all\n :").unwrap();
        assert!(parse_descriptor(&path, "x").is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn binary_path_resolution() {
        let discovery = Discovery {
            name: "tool".to_string(),
            path: PathBuf::from("/plugins/tool"),
            kind: DiscoveryKind::Rpc,
            manifest: Some(Manifest {
                name: "tool".to_string(),
                version: None,
                runtime: DescriptorRuntime::Grpc,
                binary: "bin/tool".to_string(),
            }),
            loaded: false,
        };
        assert_eq!(
            discovery.binary_path().unwrap(),
            PathBuf::from("/plugins/tool/bin/tool")
        );

        let absolute = Discovery {
            manifest: Some(Manifest {
                name: "tool".to_string(),
                version: None,
                runtime: DescriptorRuntime::Grpc,
                binary: "/opt/tool".to_string(),
            }),
            ..discovery
        };
        assert_eq!(absolute.binary_path().unwrap(), PathBuf::from("/opt/tool"));
    }
}

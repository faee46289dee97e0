//! Out-of-process plugin lifecycle.
//!
//! Launch child → handshake → registration fetch → init → N × (call |
//! host callback) → shutdown → kill. The child dials the control endpoint
//! (broker id 0); at init the host binds a fresh callback endpoint, serves
//! the caller's sandboxed host API on it, and hands the id to the child.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use trellis_core::{Error, Result};
use trellis_plugin_api::host::{CallContext, HostApi};
use trellis_plugin_api::registration::Registration;
use trellis_plugin_api::rpc::peer::{RejectAll, RpcPeer, RpcService};
use trellis_plugin_api::rpc::protocol::{
    self, CallParams, Frame, HostCallParams, InitParams, RegisterReply,
};
use trellis_plugin_api::rpc::transport::BrokerListener;
use trellis_plugin_api::Plugin;

use super::broker::Broker;
use crate::dispatch::dispatch_host_call;
use crate::restrict::{self, RestrictionOptions};

/// Environment prefix surfaced to plugins as configuration:
/// `TRELLIS_PLUGIN_<NAME>_<KEY>` becomes config key `<key>` (lowercased);
/// hyphens in the plugin name map to underscores before upcasing.
pub const ENV_CONFIG_PREFIX: &str = "TRELLIS_PLUGIN_";

/// How to launch and talk to one plugin executable.
#[derive(Debug, Clone)]
pub struct RpcPluginOptions {
    /// The plugin executable.
    pub binary: PathBuf,
    /// Immutable install directory, surfaced as config `plugin_dir`.
    pub install_dir: PathBuf,
    /// Per-plugin writable directory, created owner-only on demand.
    pub work_dir: PathBuf,
    /// Host version surfaced as config `host_version`.
    pub host_version: String,
    /// Deadline for each `Plugin.Call`.
    pub call_timeout: Duration,
    /// Deadline for launch, handshake, and registration fetch.
    pub startup_timeout: Duration,
    /// OS restriction to apply to the child.
    pub restriction: RestrictionOptions,
    /// Whether the plugin was granted outbound HTTP; without it the child
    /// environment carries the no-network marker.
    pub http_granted: bool,
}

impl RpcPluginOptions {
    /// Options with the default timeouts.
    #[must_use]
    pub fn new(binary: PathBuf, install_dir: PathBuf, work_dir: PathBuf) -> Self {
        Self {
            binary,
            install_dir,
            work_dir,
            host_version: trellis_core::HOST_VERSION.to_string(),
            call_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(10),
            restriction: RestrictionOptions::default(),
            http_granted: false,
        }
    }
}

/// Assemble the per-plugin config map handed over in `Plugin.Init`.
pub(crate) fn assemble_config(
    host_version: &str,
    plugin_name: &str,
    install_dir: &Path,
    work_dir: &Path,
) -> HashMap<String, String> {
    let mut config = HashMap::new();
    config.insert("host_version".to_string(), host_version.to_string());
    config.insert("plugin_name".to_string(), plugin_name.to_string());
    config.insert("plugin_dir".to_string(), install_dir.display().to_string());
    config.insert("work_dir".to_string(), work_dir.display().to_string());

    let prefix = format!(
        "{ENV_CONFIG_PREFIX}{}_",
        plugin_name.replace('-', "_").to_uppercase()
    );
    for (key, value) in std::env::vars() {
        if let Some(rest) = key.strip_prefix(&prefix) {
            if !rest.is_empty() {
                config.insert(rest.to_lowercase(), value);
            }
        }
    }
    config
}

fn ensure_work_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

async fn timed(
    peer: &RpcPeer,
    plugin: &str,
    function: &str,
    limit: Duration,
    method: &str,
    payload: Value,
) -> Result<Value> {
    match tokio::time::timeout(limit, peer.call(method, payload)).await {
        Ok(result) => result,
        // The child may still run to completion; its orphaned reply is
        // discarded by the response router.
        Err(_) => Err(Error::DeadlineExceeded {
            plugin: plugin.to_string(),
            function: function.to_string(),
        }),
    }
}

/// Serves `HostAPI.Call` for one plugin's callback connections.
struct HostCallbackService {
    host: Arc<dyn HostApi>,
    plugin: String,
}

#[async_trait]
impl RpcService for HostCallbackService {
    async fn handle(&self, method: &str, payload: Value) -> Result<Value> {
        if method != protocol::METHOD_HOST_CALL {
            return Err(Error::bad_input(format!("unexpected method: {method}")));
        }
        let params: HostCallParams = serde_json::from_value(payload)
            .map_err(|e| Error::bad_input(format!("malformed host call: {e}")))?;
        // The channel is bound to a plugin at init; the caller the child
        // reports is informational only.
        let ctx = CallContext {
            caller: Some(self.plugin.clone()),
            depth: params.depth,
        };
        dispatch_host_call(self.host.as_ref(), &ctx, &params.method, params.args).await
    }
}

/// A plugin running in a child process, driven over RPC.
pub struct RpcPlugin {
    options: RpcPluginOptions,
    broker: Arc<Broker>,
    peer: Arc<RpcPeer>,
    peer_task: Mutex<Option<JoinHandle<()>>>,
    registration: Registration,
    child: Mutex<Option<Child>>,
    callback_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RpcPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPlugin")
            .field("options", &self.options)
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

impl RpcPlugin {
    /// Launch the executable and complete handshake and registration fetch.
    ///
    /// # Errors
    ///
    /// Any failure up to and including the registration fetch is a load
    /// failure; the child is killed and the broker torn down.
    pub async fn launch(options: RpcPluginOptions) -> Result<Self> {
        ensure_work_dir(&options.work_dir)?;
        let broker = Arc::new(Broker::new(options.work_dir.join("broker"))?);
        let listener = broker
            .listen(protocol::CONTROL_ENDPOINT_ID)
            .map_err(|e| Error::load_failed(format!("control endpoint: {e}")))?;

        let mut command = Command::new(&options.binary);
        restrict::apply(
            &mut command,
            &options.work_dir,
            options.http_granted,
            &options.restriction,
        );
        command.env(protocol::ENV_MAGIC_COOKIE, protocol::MAGIC_COOKIE_VALUE);
        command.env(protocol::ENV_BROKER_DIR, broker.dir());
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            Error::load_failed(format!("failed to launch {}: {e}", options.binary.display()))
        })?;

        Self::establish(options, broker, listener, Some(child)).await
    }

    /// Complete the session over an externally managed transport: the
    /// executable (or an in-process stand-in) was started by the caller and
    /// will dial the control endpoint of `broker`.
    ///
    /// # Errors
    ///
    /// As [`Self::launch`], minus the spawn.
    pub async fn attach(
        options: RpcPluginOptions,
        broker: Arc<Broker>,
        listener: BrokerListener,
    ) -> Result<Self> {
        Self::establish(options, broker, listener, None).await
    }

    async fn establish(
        options: RpcPluginOptions,
        broker: Arc<Broker>,
        listener: BrokerListener,
        mut child: Option<Child>,
    ) -> Result<Self> {
        match Self::try_establish(&options, listener).await {
            Ok((peer, peer_task, registration)) => Ok(Self {
                options,
                broker,
                peer,
                peer_task: Mutex::new(Some(peer_task)),
                registration,
                child: Mutex::new(child),
                callback_tasks: Mutex::new(Vec::new()),
            }),
            Err(e) => {
                if let Some(mut child) = child.take() {
                    child.start_kill().ok();
                }
                Err(e)
            }
        }
    }

    async fn try_establish(
        options: &RpcPluginOptions,
        listener: BrokerListener,
    ) -> Result<(Arc<RpcPeer>, JoinHandle<()>, Registration)> {
        let label = options
            .binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plugin".to_string());

        let mut conn = tokio::time::timeout(options.startup_timeout, listener.accept())
            .await
            .map_err(|_| {
                Error::load_failed(format!(
                    "{label}: plugin did not connect before the startup timeout"
                ))
            })??;

        let frame = tokio::time::timeout(options.startup_timeout, protocol::read_frame(&mut conn))
            .await
            .map_err(|_| Error::load_failed(format!("{label}: handshake timeout")))?
            .map_err(|e| Error::load_failed(format!("{label}: {e}")))?;

        match frame {
            Some(Frame::Handshake {
                protocol_version,
                cookie,
            }) if protocol_version == protocol::PROTOCOL_VERSION
                && cookie == protocol::MAGIC_COOKIE_VALUE => {}
            Some(Frame::Handshake {
                protocol_version, ..
            }) => {
                let reason = format!(
                    "handshake mismatch (got protocol {protocol_version}, want {})",
                    protocol::PROTOCOL_VERSION
                );
                protocol::write_frame(
                    &mut conn,
                    &Frame::HandshakeAck {
                        ok: false,
                        error: Some(reason.clone()),
                    },
                )
                .await
                .ok();
                return Err(Error::load_failed(format!("{label}: {reason}")));
            }
            other => {
                return Err(Error::load_failed(format!(
                    "{label}: expected handshake, got {other:?}"
                )));
            }
        }

        protocol::write_frame(&mut conn, &Frame::HandshakeAck { ok: true, error: None }).await?;

        let (peer, peer_task) = RpcPeer::spawn(conn, Arc::new(RejectAll));

        let value = timed(
            &peer,
            &label,
            "registration",
            options.startup_timeout,
            protocol::METHOD_REGISTER,
            Value::Null,
        )
        .await
        .map_err(|e| Error::load_failed(format!("{label}: registration fetch: {e}")))?;

        let reply: RegisterReply = serde_json::from_value(value)
            .map_err(|e| Error::load_failed(format!("{label}: malformed registration reply: {e}")))?;
        let registration: Registration = serde_json::from_str(&reply.payload)
            .map_err(|e| Error::load_failed(format!("{label}: malformed registration: {e}")))?;

        Ok((peer, peer_task, registration))
    }
}

#[async_trait]
impl Plugin for RpcPlugin {
    async fn registration(&self) -> Result<Registration> {
        Ok(self.registration.clone())
    }

    async fn init(&self, host: Arc<dyn HostApi>) -> Result<()> {
        let id = self.broker.next_id();
        let listener = self.broker.listen(id)?;
        let service: Arc<dyn RpcService> = Arc::new(HostCallbackService {
            host,
            plugin: self.registration.name.clone(),
        });

        // One child, many concurrent host calls: every accepted connection
        // gets its own peer whose read loop ends when the child exits.
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        let (_peer, _task) = RpcPeer::spawn(conn, Arc::clone(&service));
                    }
                    Err(e) => {
                        tracing::debug!("callback accept loop ended: {e}");
                        break;
                    }
                }
            }
        });
        self.callback_tasks.lock().push(accept_task);

        let config = assemble_config(
            &self.options.host_version,
            &self.registration.name,
            &self.options.install_dir,
            &self.options.work_dir,
        );
        let params = InitParams {
            config,
            host_endpoint_id: id,
        };
        timed(
            &self.peer,
            &self.registration.name,
            "init",
            Duration::from_millis(self.registration.resources.init_timeout_ms),
            protocol::METHOD_INIT,
            serde_json::to_value(params)?,
        )
        .await?;
        Ok(())
    }

    async fn call(&self, ctx: &CallContext, function: &str, args: Value) -> Result<Value> {
        let params = CallParams {
            function: function.to_string(),
            args,
            caller: ctx.caller.clone(),
            depth: ctx.depth,
        };
        timed(
            &self.peer,
            &self.registration.name,
            function,
            self.options.call_timeout,
            protocol::METHOD_CALL,
            serde_json::to_value(params)?,
        )
        .await
    }

    async fn shutdown(&self) -> Result<()> {
        let graceful = timed(
            &self.peer,
            &self.registration.name,
            "shutdown",
            Duration::from_millis(self.registration.resources.shutdown_timeout_ms),
            protocol::METHOD_SHUTDOWN,
            Value::Null,
        )
        .await;
        if let Err(e) = graceful {
            tracing::debug!(plugin = %self.registration.name, "graceful shutdown skipped: {e}");
        }

        for task in self.callback_tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(task) = self.peer_task.lock().take() {
            task.abort();
        }

        let child = self.child.lock().take();
        if let Some(mut child) = child {
            child.kill().await.ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_assembly_fixed_keys() {
        let config = assemble_config(
            "0.1.0",
            "stats",
            Path::new("/plugins/stats"),
            Path::new("/work/stats"),
        );
        assert_eq!(config["host_version"], "0.1.0");
        assert_eq!(config["plugin_name"], "stats");
        assert_eq!(config["plugin_dir"], "/plugins/stats");
        assert_eq!(config["work_dir"], "/work/stats");
    }

    #[test]
    fn config_assembly_env_passthrough() {
        // SAFETY: test-local environment mutation.
        unsafe {
            std::env::set_var("TRELLIS_PLUGIN_MY_MAILER_API_URL", "https://mail.test");
            std::env::set_var("TRELLIS_PLUGIN_OTHER_KEY", "nope");
        }
        let config = assemble_config(
            "0.1.0",
            "my-mailer",
            Path::new("/plugins/my-mailer"),
            Path::new("/work/my-mailer"),
        );
        assert_eq!(config["api_url"], "https://mail.test");
        assert!(!config.contains_key("key"));
        unsafe {
            std::env::remove_var("TRELLIS_PLUGIN_MY_MAILER_API_URL");
            std::env::remove_var("TRELLIS_PLUGIN_OTHER_KEY");
        }
    }

    #[cfg(unix)]
    #[test]
    fn work_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt as _;
        let dir = std::env::temp_dir().join(format!("trellis-workdir-{}", std::process::id()));
        ensure_work_dir(&dir).unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        std::fs::remove_dir_all(&dir).ok();
    }
}

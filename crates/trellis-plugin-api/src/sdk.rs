//! Plugin-author SDK for out-of-process plugins.
//!
//! A plugin executable implements [`PluginHandler`] and hands it to
//! [`serve`], which performs the handshake, answers the host's `Plugin.*`
//! methods, and wires up a [`HostClient`] over the callback endpoint whose
//! broker id arrives in `Plugin.Init`. When the launch environment lacks the
//! magic cookie the executable was started by hand; `serve` refuses so the
//! process exits before speaking to anything.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use trellis_core::{Error, Result};

use crate::host::{CallContext, HostApi, HttpResponse, LogLevel, Row};
use crate::registration::Registration;
use crate::rpc::peer::{RejectAll, RpcPeer, RpcService};
use crate::rpc::protocol::{
    self, CallParams, Frame, HostCallParams, InitParams, RegisterReply, host_methods,
};
use crate::rpc::transport::{self, Conn};

/// What a plugin author implements.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    /// The capability declaration published to the host.
    fn registration(&self) -> Registration;

    /// Called once before any function is invoked.
    async fn init(&self, config: HashMap<String, String>, host: Arc<HostClient>) -> Result<()>;

    /// Invoke a named function.
    async fn call(&self, ctx: &CallContext, function: &str, args: Value) -> Result<Value>;

    /// Called once before the process is asked to exit.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: PluginHandler + ?Sized> PluginHandler for Arc<T> {
    fn registration(&self) -> Registration {
        self.as_ref().registration()
    }

    async fn init(&self, config: HashMap<String, String>, host: Arc<HostClient>) -> Result<()> {
        self.as_ref().init(config, host).await
    }

    async fn call(&self, ctx: &CallContext, function: &str, args: Value) -> Result<Value> {
        self.as_ref().call(ctx, function, args).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.as_ref().shutdown().await
    }
}

/// Serve a plugin over the environment the host prepared.
///
/// Blocks until the host sends `Plugin.Shutdown` or the control connection
/// drops.
///
/// # Errors
///
/// Fails when the magic cookie is absent or wrong (the process was not
/// launched by a host), or on transport errors.
pub async fn serve<H: PluginHandler + 'static>(handler: H) -> Result<()> {
    let cookie = std::env::var(protocol::ENV_MAGIC_COOKIE).unwrap_or_default();
    if cookie != protocol::MAGIC_COOKIE_VALUE {
        return Err(Error::bad_input(
            "not launched by a plugin host; refusing to serve",
        ));
    }
    let broker_dir = std::env::var(protocol::ENV_BROKER_DIR)
        .map(PathBuf::from)
        .map_err(|_| Error::bad_input("broker directory not set in environment"))?;

    let conn = transport::dial(&broker_dir, protocol::CONTROL_ENDPOINT_ID).await?;
    run_connection(conn, broker_dir, handler).await
}

/// Serve a plugin over an already-established control connection.
///
/// [`serve`] wraps this with environment discovery; embedders and tests that
/// hold both ends of the transport call it directly.
///
/// # Errors
///
/// Fails on handshake rejection or transport errors.
pub async fn run_connection<H: PluginHandler + 'static>(
    mut conn: Conn,
    broker_dir: PathBuf,
    handler: H,
) -> Result<()> {
    protocol::write_frame(
        &mut conn,
        &Frame::Handshake {
            protocol_version: protocol::PROTOCOL_VERSION,
            cookie: protocol::MAGIC_COOKIE_VALUE.to_string(),
        },
    )
    .await?;

    match protocol::read_frame(&mut conn).await? {
        Some(Frame::HandshakeAck { ok: true, .. }) => {}
        Some(Frame::HandshakeAck { ok: false, error }) => {
            return Err(Error::transport_failed(format!(
                "host rejected handshake: {}",
                error.unwrap_or_else(|| "unspecified".to_string())
            )));
        }
        other => {
            return Err(Error::transport_failed(format!(
                "unexpected handshake reply: {other:?}"
            )));
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let registration = handler.registration();
    let service = Arc::new(PluginService {
        handler: Arc::new(handler),
        registration,
        broker_dir,
        host: Mutex::new(None),
        shutdown: Mutex::new(Some(shutdown_tx)),
    });

    let (_peer, join) = RpcPeer::spawn(conn, service);

    tokio::select! {
        _ = shutdown_rx => Ok(()),
        _ = join => Err(Error::transport_failed("control connection closed")),
    }
}

struct PluginService {
    handler: Arc<dyn PluginHandler>,
    registration: Registration,
    broker_dir: PathBuf,
    host: Mutex<Option<Arc<HostClient>>>,
    shutdown: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

#[async_trait]
impl RpcService for PluginService {
    async fn handle(&self, method: &str, payload: Value) -> Result<Value> {
        match method {
            protocol::METHOD_REGISTER => {
                let reply = RegisterReply {
                    payload: serde_json::to_string(&self.registration)?,
                };
                Ok(serde_json::to_value(reply)?)
            }
            protocol::METHOD_INIT => {
                let params: InitParams = serde_json::from_value(payload)
                    .map_err(|e| Error::bad_input(format!("malformed init params: {e}")))?;
                let conn = transport::dial(&self.broker_dir, params.host_endpoint_id).await?;
                let (peer, _join) = RpcPeer::spawn(conn, Arc::new(RejectAll));
                let host = Arc::new(HostClient {
                    peer,
                    plugin: self.registration.name.clone(),
                });
                *self.host.lock() = Some(Arc::clone(&host));
                self.handler.init(params.config, host).await?;
                Ok(Value::Null)
            }
            protocol::METHOD_CALL => {
                let params: CallParams = serde_json::from_value(payload)
                    .map_err(|e| Error::bad_input(format!("malformed call params: {e}")))?;
                let ctx = CallContext {
                    caller: params.caller,
                    depth: params.depth,
                };
                self.handler.call(&ctx, &params.function, params.args).await
            }
            protocol::METHOD_SHUTDOWN => {
                let result = self.handler.shutdown().await;
                if let Some(tx) = self.shutdown.lock().take() {
                    // Let the reply reach the wire before the serve loop exits.
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        tx.send(()).ok();
                    });
                }
                result.map(|()| Value::Null)
            }
            other => Err(Error::bad_input(format!("unknown plugin method: {other}"))),
        }
    }
}

/// Host capabilities, reached over the callback channel.
///
/// Implements [`HostApi`] by wrapping every call in `HostAPI.Call`; the host
/// side unwraps it into the sandboxed facade of this plugin.
pub struct HostClient {
    peer: Arc<RpcPeer>,
    plugin: String,
}

impl HostClient {
    async fn host_call(&self, ctx: &CallContext, method: &str, args: Value) -> Result<Value> {
        let params = HostCallParams {
            method: method.to_string(),
            args,
            caller: self.plugin.clone(),
            depth: ctx.depth,
        };
        self.peer
            .call(protocol::METHOD_HOST_CALL, serde_json::to_value(params)?)
            .await
    }
}

#[async_trait]
impl HostApi for HostClient {
    async fn db_query(&self, ctx: &CallContext, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        let args = serde_json::to_value(protocol::DbArgs {
            query: query.to_string(),
            args: args.to_vec(),
        })?;
        let value = self.host_call(ctx, host_methods::DB_QUERY, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn db_exec(&self, ctx: &CallContext, query: &str, args: &[Value]) -> Result<u64> {
        let args = serde_json::to_value(protocol::DbArgs {
            query: query.to_string(),
            args: args.to_vec(),
        })?;
        let value = self.host_call(ctx, host_methods::DB_EXEC, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn cache_get(&self, ctx: &CallContext, key: &str) -> Result<Option<Vec<u8>>> {
        let args = serde_json::to_value(protocol::CacheKeyArgs {
            key: key.to_string(),
        })?;
        let value = self.host_call(ctx, host_methods::CACHE_GET, args).await?;
        let reply: protocol::CacheGetReply = serde_json::from_value(value)?;
        Ok(if reply.found { reply.value } else { None })
    }

    async fn cache_set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<()> {
        let args = serde_json::to_value(protocol::CacheSetArgs {
            key: key.to_string(),
            value,
            ttl_secs,
        })?;
        self.host_call(ctx, host_methods::CACHE_SET, args).await?;
        Ok(())
    }

    async fn cache_delete(&self, ctx: &CallContext, key: &str) -> Result<()> {
        let args = serde_json::to_value(protocol::CacheKeyArgs {
            key: key.to_string(),
        })?;
        self.host_call(ctx, host_methods::CACHE_DELETE, args).await?;
        Ok(())
    }

    async fn http_request(
        &self,
        ctx: &CallContext,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        let args = serde_json::to_value(protocol::HttpRequestArgs {
            method: method.to_string(),
            url: url.to_string(),
            headers: headers.clone(),
            body,
        })?;
        let value = self.host_call(ctx, host_methods::HTTP_REQUEST, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn send_email(
        &self,
        ctx: &CallContext,
        to: &[String],
        subject: &str,
        body: &str,
        html: bool,
    ) -> Result<()> {
        let args = serde_json::to_value(protocol::SendEmailArgs {
            to: to.to_vec(),
            subject: subject.to_string(),
            body: body.to_string(),
            html,
        })?;
        self.host_call(ctx, host_methods::SEND_EMAIL, args).await?;
        Ok(())
    }

    fn log(&self, level: LogLevel, message: &str, fields: BTreeMap<String, Value>) {
        let params = protocol::LogArgs {
            level: level.to_string(),
            message: message.to_string(),
            fields,
        };
        let peer = Arc::clone(&self.peer);
        let plugin = self.plugin.clone();
        // Fire and forget; logging never blocks the caller.
        tokio::spawn(async move {
            let call = HostCallParams {
                method: host_methods::LOG.to_string(),
                args: serde_json::to_value(params).unwrap_or(Value::Null),
                caller: plugin,
                depth: 0,
            };
            if let Ok(payload) = serde_json::to_value(call) {
                peer.call(protocol::METHOD_HOST_CALL, payload).await.ok();
            }
        });
    }

    async fn config_get(&self, ctx: &CallContext, key: &str) -> Result<Option<String>> {
        let args = serde_json::to_value(protocol::ConfigGetArgs {
            key: key.to_string(),
        })?;
        let value = self.host_call(ctx, host_methods::CONFIG_GET, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn translate(&self, key: &str, args: &[Value]) -> String {
        let params = serde_json::to_value(protocol::TranslateArgs {
            key: key.to_string(),
            args: args.to_vec(),
        })
        .unwrap_or(Value::Null);
        let ctx = CallContext::root();
        match self.host_call(&ctx, host_methods::TRANSLATE, params).await {
            Ok(Value::String(s)) => s,
            // Untranslatable keys fall back to the key itself.
            _ => key.to_string(),
        }
    }

    async fn call_plugin(
        &self,
        ctx: &CallContext,
        name: &str,
        function: &str,
        args: Value,
    ) -> Result<Value> {
        let args = serde_json::to_value(protocol::CallPluginArgs {
            name: name.to_string(),
            function: function.to_string(),
            args,
        })?;
        self.host_call(ctx, host_methods::CALL_PLUGIN, args).await
    }

    async fn publish_event(&self, ctx: &CallContext, event_type: &str, data: Value) -> Result<()> {
        let args = serde_json::to_value(protocol::PublishEventArgs {
            event_type: event_type.to_string(),
            data,
        })?;
        self.host_call(ctx, host_methods::PUBLISH_EVENT, args).await?;
        Ok(())
    }
}

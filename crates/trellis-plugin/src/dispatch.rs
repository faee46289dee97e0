//! Host-API method dispatch.
//!
//! One table maps the wire-level method names onto the sandboxed
//! [`HostApi`] of the calling plugin, decoding and re-encoding structured
//! values as needed. Both the RPC callback server and the WASM `host_call`
//! import route through here, so the two transports cannot drift apart.

use serde_json::Value;
use trellis_core::{Error, Result};
use trellis_plugin_api::host::{CallContext, HostApi, LogLevel};
use trellis_plugin_api::rpc::protocol::{
    CacheGetReply, CacheKeyArgs, CacheSetArgs, CallPluginArgs, ConfigGetArgs, DbArgs,
    HttpRequestArgs, LogArgs, PublishEventArgs, SendEmailArgs, TranslateArgs, host_methods,
};

fn decode<T: serde::de::DeserializeOwned>(method: &str, args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| Error::bad_input(format!("malformed arguments for {method}: {e}")))
}

/// Execute one host-API call against `host`.
///
/// # Errors
///
/// Fails on unknown method names, malformed arguments, and whatever the
/// sandboxed call itself returns.
pub async fn dispatch_host_call(
    host: &dyn HostApi,
    ctx: &CallContext,
    method: &str,
    args: Value,
) -> Result<Value> {
    match method {
        host_methods::DB_QUERY => {
            let params: DbArgs = decode(method, args)?;
            let rows = host.db_query(ctx, &params.query, &params.args).await?;
            Ok(serde_json::to_value(rows)?)
        }
        host_methods::DB_EXEC => {
            let params: DbArgs = decode(method, args)?;
            let affected = host.db_exec(ctx, &params.query, &params.args).await?;
            Ok(Value::from(affected))
        }
        host_methods::CACHE_GET => {
            let params: CacheKeyArgs = decode(method, args)?;
            let value = host.cache_get(ctx, &params.key).await?;
            Ok(serde_json::to_value(CacheGetReply {
                found: value.is_some(),
                value,
            })?)
        }
        host_methods::CACHE_SET => {
            let params: CacheSetArgs = decode(method, args)?;
            host.cache_set(ctx, &params.key, params.value, params.ttl_secs)
                .await?;
            Ok(Value::Null)
        }
        host_methods::CACHE_DELETE => {
            let params: CacheKeyArgs = decode(method, args)?;
            host.cache_delete(ctx, &params.key).await?;
            Ok(Value::Null)
        }
        host_methods::HTTP_REQUEST => {
            let params: HttpRequestArgs = decode(method, args)?;
            let response = host
                .http_request(
                    ctx,
                    &params.method,
                    &params.url,
                    &params.headers,
                    params.body,
                )
                .await?;
            Ok(serde_json::to_value(response)?)
        }
        host_methods::SEND_EMAIL => {
            let params: SendEmailArgs = decode(method, args)?;
            host.send_email(ctx, &params.to, &params.subject, &params.body, params.html)
                .await?;
            Ok(Value::Null)
        }
        host_methods::LOG => {
            let params: LogArgs = decode(method, args)?;
            host.log(
                LogLevel::parse_lenient(&params.level),
                &params.message,
                params.fields,
            );
            Ok(Value::Null)
        }
        host_methods::CONFIG_GET => {
            let params: ConfigGetArgs = decode(method, args)?;
            let value = host.config_get(ctx, &params.key).await?;
            Ok(serde_json::to_value(value)?)
        }
        host_methods::TRANSLATE => {
            let params: TranslateArgs = decode(method, args)?;
            Ok(Value::String(host.translate(&params.key, &params.args).await))
        }
        host_methods::CALL_PLUGIN => {
            let params: CallPluginArgs = decode(method, args)?;
            host.call_plugin(ctx, &params.name, &params.function, params.args)
                .await
        }
        host_methods::PUBLISH_EVENT => {
            let params: PublishEventArgs = decode(method, args)?;
            host.publish_event(ctx, &params.event_type, params.data).await?;
            Ok(Value::Null)
        }
        other => Err(Error::bad_input(format!("unknown host API method: {other}"))),
    }
}

//! Wire protocol for out-of-process plugins.
//!
//! Frames are length-prefixed JSON: a big-endian `u32` byte count followed
//! by one serialized [`Frame`]. Every structured payload in the system is
//! self-describing text, so the envelope is too. The host invokes
//! `Plugin.*` methods on the child; the child invokes `HostAPI.Call` on the
//! host over the callback channel it dialled with the broker id received at
//! init.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use trellis_core::{Error, Result};

/// Protocol version spoken by both sides of the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the magic cookie into the child.
pub const ENV_MAGIC_COOKIE: &str = "TRELLIS_MAGIC_COOKIE";

/// Cookie value the child must echo in its handshake frame. A mismatch
/// means the parent launched an unrelated executable; the session ends.
pub const MAGIC_COOKIE_VALUE: &str = "9d2f6d1e4c8b41aa8e53ab3f0c6c1d27";

/// Environment variable carrying the broker directory into the child.
pub const ENV_BROKER_DIR: &str = "TRELLIS_BROKER_DIR";

/// Broker id of the control channel the child dials at startup.
pub const CONTROL_ENDPOINT_ID: u64 = 0;

/// Host-invoked method: fetch the registration payload.
pub const METHOD_REGISTER: &str = "Plugin.GKRegister";
/// Host-invoked method: initialize with config and the callback endpoint id.
pub const METHOD_INIT: &str = "Plugin.Init";
/// Host-invoked method: invoke a plugin function.
pub const METHOD_CALL: &str = "Plugin.Call";
/// Host-invoked method: graceful shutdown.
pub const METHOD_SHUTDOWN: &str = "Plugin.Shutdown";
/// Child-invoked method on the callback channel.
pub const METHOD_HOST_CALL: &str = "HostAPI.Call";

/// Inner host-API method names carried in [`HostCallParams::method`].
pub mod host_methods {
    /// `db_query`.
    pub const DB_QUERY: &str = "db_query";
    /// `db_exec`.
    pub const DB_EXEC: &str = "db_exec";
    /// `cache_get`.
    pub const CACHE_GET: &str = "cache_get";
    /// `cache_set`.
    pub const CACHE_SET: &str = "cache_set";
    /// `cache_delete`.
    pub const CACHE_DELETE: &str = "cache_delete";
    /// `http_request`.
    pub const HTTP_REQUEST: &str = "http_request";
    /// `send_email`.
    pub const SEND_EMAIL: &str = "send_email";
    /// `log`.
    pub const LOG: &str = "log";
    /// `config_get`.
    pub const CONFIG_GET: &str = "config_get";
    /// `translate`.
    pub const TRANSLATE: &str = "translate";
    /// `call_plugin`.
    pub const CALL_PLUGIN: &str = "call_plugin";
    /// `publish_event`.
    pub const PUBLISH_EVENT: &str = "publish_event";
}

/// Upper bound on a single frame, to keep a confused peer from ballooning
/// host memory.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// One message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// First frame on a connection, child to host.
    Handshake {
        /// Must equal [`PROTOCOL_VERSION`].
        protocol_version: u32,
        /// Must equal [`MAGIC_COOKIE_VALUE`].
        cookie: String,
    },

    /// Host's reply to the handshake.
    HandshakeAck {
        /// Whether the session proceeds.
        ok: bool,
        /// Reason when it does not.
        #[serde(default)]
        error: Option<String>,
    },

    /// A method invocation; either side may send one.
    Request {
        /// Correlates the eventual response.
        id: u64,
        /// Method name, e.g. `Plugin.Call` or `HostAPI.Call`.
        method: String,
        /// Method parameters.
        #[serde(default)]
        payload: Value,
    },

    /// Reply to a request with the same `id`.
    Response {
        /// Id of the request being answered.
        id: u64,
        /// Successful result.
        #[serde(default)]
        result: Option<Value>,
        /// Failure description; set instead of `result`.
        #[serde(default)]
        error: Option<String>,
    },
}

/// Parameters of `Plugin.Init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitParams {
    /// Per-plugin configuration assembled by the host.
    pub config: HashMap<String, String>,

    /// Broker id of the host-served callback endpoint.
    pub host_endpoint_id: u64,
}

/// Parameters of `Plugin.Call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallParams {
    /// Function to invoke.
    pub function: String,

    /// Encoded arguments.
    #[serde(default)]
    pub args: Value,

    /// Plugin that issued the call, when it came from a plugin.
    #[serde(default)]
    pub caller: Option<String>,

    /// Plugin-to-plugin hops already taken.
    #[serde(default)]
    pub depth: u8,
}

/// Result of `Plugin.GKRegister`: the registration as an encoded payload,
/// decoded host-side. Shipping it as text keeps the host and a plugin built
/// against a different API revision from disagreeing on field layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReply {
    /// JSON text of the registration.
    pub payload: String,
}

/// Parameters of `HostAPI.Call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostCallParams {
    /// Inner host-API method, one of [`host_methods`].
    pub method: String,

    /// Method arguments.
    #[serde(default)]
    pub args: Value,

    /// Plugin issuing the call, as the child reports it. The host binds the
    /// channel to a plugin at init and trusts that binding, not this field.
    #[serde(default)]
    pub caller: String,

    /// Plugin-to-plugin hops already taken.
    #[serde(default)]
    pub depth: u8,
}

/// Arguments of `db_query` / `db_exec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbArgs {
    /// Query text, optionally `@name:`-prefixed.
    pub query: String,
    /// Bind parameters.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Arguments of `cache_get` / `cache_delete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheKeyArgs {
    /// Cache key, before namespacing.
    pub key: String,
}

/// Arguments of `cache_set`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSetArgs {
    /// Cache key, before namespacing.
    pub key: String,
    /// Value bytes.
    pub value: Vec<u8>,
    /// Time to live in seconds; zero means no expiry.
    #[serde(default)]
    pub ttl_secs: u64,
}

/// Reply of `cache_get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheGetReply {
    /// Whether the key existed.
    pub found: bool,
    /// Value bytes when found.
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

/// Arguments of `http_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestArgs {
    /// HTTP method.
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Request body.
    #[serde(default)]
    pub body: Option<Vec<u8>>,
}

/// Arguments of `send_email`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmailArgs {
    /// Recipient addresses.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Message body.
    pub body: String,
    /// Whether the body is HTML.
    #[serde(default)]
    pub html: bool,
}

/// Arguments of `log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogArgs {
    /// Level name; unknown levels are treated as `info`.
    pub level: String,
    /// Message text.
    pub message: String,
    /// Structured fields.
    #[serde(default)]
    pub fields: std::collections::BTreeMap<String, Value>,
}

/// Arguments of `config_get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigGetArgs {
    /// Configuration key.
    pub key: String,
}

/// Arguments of `translate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateArgs {
    /// Message key.
    pub key: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Arguments of `call_plugin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallPluginArgs {
    /// Target plugin name.
    pub name: String,
    /// Function to invoke.
    pub function: String,
    /// Encoded arguments.
    #[serde(default)]
    pub args: Value,
}

/// Arguments of `publish_event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEventArgs {
    /// Event type.
    pub event_type: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

/// Write one frame to the stream.
///
/// # Errors
///
/// Fails on serialization or IO errors, or when the frame exceeds
/// [`MAX_FRAME_BYTES`].
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    let data = serde_json::to_vec(frame)?;
    let len = u32::try_from(data.len())
        .map_err(|_| Error::bad_input("frame exceeds u32 length"))?;
    if len > MAX_FRAME_BYTES {
        return Err(Error::bad_input(format!("frame of {len} bytes exceeds limit")));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from the stream.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
///
/// # Errors
///
/// Fails on IO errors, oversized frames, or malformed JSON.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let mut len_buf = [0_u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(Error::bad_input(format!("frame of {len} bytes exceeds limit")));
    }
    let mut data = vec![0_u8; len as usize];
    reader.read_exact(&mut data).await?;
    let frame = serde_json::from_slice(&data)?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let frame = Frame::Request {
            id: 7,
            method: METHOD_CALL.to_string(),
            payload: serde_json::to_value(CallParams {
                function: "ping".to_string(),
                args: Value::Null,
                caller: Some("stats".to_string()),
                depth: 2,
            })
            .unwrap(),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap().unwrap();
        match decoded {
            Frame::Request { id, method, payload } => {
                assert_eq!(id, 7);
                assert_eq!(method, METHOD_CALL);
                let params: CallParams = serde_json::from_value(payload).unwrap();
                assert_eq!(params.function, "ping");
                assert_eq!(params.depth, 2);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let frame = Frame::HandshakeAck { ok: true, error: None };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[test]
    fn register_reply_carries_text() {
        let reply = RegisterReply {
            payload: r#"{"name":"stats","version":"1.0.0"}"#.to_string(),
        };
        let reg: crate::registration::Registration =
            serde_json::from_str(&reply.payload).unwrap();
        assert_eq!(reg.name, "stats");
    }
}

//! Duplex RPC peer.
//!
//! One connection, both directions: either side can issue requests while
//! serving the other's. Responses are routed back to their waiters by frame
//! id; replies that arrive after their waiter gave up (a tripped deadline)
//! are discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use trellis_core::{Error, Result};

use super::protocol::{Frame, read_frame, write_frame};
use super::transport::Conn;

/// Handler for requests arriving from the remote side.
#[async_trait]
pub trait RpcService: Send + Sync {
    /// Execute `method` with `payload`, producing the response value.
    async fn handle(&self, method: &str, payload: Value) -> Result<Value>;
}

/// A service that accepts nothing; for connections used in one direction.
pub struct RejectAll;

#[async_trait]
impl RpcService for RejectAll {
    async fn handle(&self, method: &str, _payload: Value) -> Result<Value> {
        Err(Error::bad_input(format!("unexpected inbound method: {method}")))
    }
}

type Pending = Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>;

/// One side of an established RPC connection.
pub struct RpcPeer {
    writer: tokio::sync::Mutex<WriteHalf<Conn>>,
    pending: Pending,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl RpcPeer {
    /// Take ownership of `conn` and start the read loop, dispatching inbound
    /// requests to `service`. The returned handle finishes when the
    /// connection closes; aborting it tears the peer down.
    pub fn spawn(conn: Conn, service: Arc<dyn RpcService>) -> (Arc<Self>, JoinHandle<()>) {
        let (reader, writer) = tokio::io::split(conn);
        let peer = Arc::new(Self {
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let handle = tokio::spawn(Self::read_loop(Arc::clone(&peer), reader, service));
        (peer, handle)
    }

    /// Issue a request and wait for its response.
    ///
    /// # Errors
    ///
    /// Fails when the connection is closed, the write fails, or the remote
    /// answers with an error string (surfaced as a plugin error).
    pub async fn call(&self, method: &str, payload: Value) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::transport_failed("connection closed"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = Frame::Request {
            id,
            method: method.to_string(),
            payload,
        };
        if let Err(e) = self.write(&frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::transport_failed("connection closed while waiting")),
        }
    }

    /// Whether the connection has been observed closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn write(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await
    }

    async fn read_loop(peer: Arc<Self>, mut reader: ReadHalf<Conn>, service: Arc<dyn RpcService>) {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(Frame::Request { id, method, payload })) => {
                    let peer = Arc::clone(&peer);
                    let service = Arc::clone(&service);
                    tokio::spawn(async move {
                        let response = match service.handle(&method, payload).await {
                            Ok(result) => Frame::Response {
                                id,
                                result: Some(result),
                                error: None,
                            },
                            Err(e) => Frame::Response {
                                id,
                                result: None,
                                error: Some(e.to_string()),
                            },
                        };
                        if let Err(e) = peer.write(&response).await {
                            tracing::debug!("dropping response for request {id}: {e}");
                        }
                    });
                }
                Ok(Some(Frame::Response { id, result, error })) => {
                    let waiter = peer.pending.lock().remove(&id);
                    if let Some(tx) = waiter {
                        let outcome = match error {
                            Some(msg) => Err(Error::plugin(msg)),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        tx.send(outcome).ok();
                    }
                    // No waiter: the caller gave up on this id; discard.
                }
                Ok(Some(frame)) => {
                    tracing::warn!("unexpected frame mid-session: {frame:?}");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("rpc read loop ended: {e}");
                    break;
                }
            }
        }

        peer.closed.store(true, Ordering::Release);
        let waiters: Vec<_> = peer.pending.lock().drain().collect();
        for (_, tx) in waiters {
            tx.send(Err(Error::transport_failed("connection closed"))).ok();
        }
    }
}

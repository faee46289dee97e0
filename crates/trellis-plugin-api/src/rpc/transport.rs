//! Stream transport for the RPC channels.
//!
//! Endpoints are derived from a broker directory and an integer id: on Unix
//! each id maps to a socket path under the directory; elsewhere the listener
//! binds a loopback TCP port and records it in a portfile under the same
//! name, so dialling stays id-based on every platform.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use trellis_core::{Error, Result};

/// A bidirectional byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// An established connection.
pub type Conn = Box<dyn Stream>;

#[cfg(unix)]
fn socket_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("ep-{id}.sock"))
}

#[cfg(not(unix))]
fn portfile_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("ep-{id}.port"))
}

/// A bound endpoint accepting connections for one broker id.
pub struct BrokerListener {
    #[cfg(unix)]
    inner: tokio::net::UnixListener,
    #[cfg(unix)]
    path: PathBuf,

    #[cfg(not(unix))]
    inner: tokio::net::TcpListener,
    #[cfg(not(unix))]
    portfile: PathBuf,
}

impl BrokerListener {
    /// Bind the endpoint for `id` under `dir`.
    ///
    /// # Errors
    ///
    /// Fails when the directory is missing or the bind is refused.
    pub fn bind(dir: &Path, id: u64) -> Result<Self> {
        #[cfg(unix)]
        {
            let path = socket_path(dir, id);
            // A stale socket from a crashed run blocks the bind.
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let inner = tokio::net::UnixListener::bind(&path)
                .map_err(|e| Error::transport_failed(format!("bind {}: {e}", path.display())))?;
            Ok(Self { inner, path })
        }

        #[cfg(not(unix))]
        {
            let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
                .map_err(|e| Error::transport_failed(format!("bind loopback: {e}")))?;
            listener.set_nonblocking(true)?;
            let addr = listener.local_addr()?;
            let portfile = portfile_path(dir, id);
            std::fs::write(&portfile, addr.to_string())?;
            let inner = tokio::net::TcpListener::from_std(listener)
                .map_err(|e| Error::transport_failed(format!("register listener: {e}")))?;
            Ok(Self { inner, portfile })
        }
    }

    /// Accept one connection.
    ///
    /// # Errors
    ///
    /// Fails when the listener has been torn down.
    pub async fn accept(&self) -> Result<Conn> {
        #[cfg(unix)]
        {
            let (stream, _) = self
                .inner
                .accept()
                .await
                .map_err(|e| Error::transport_failed(format!("accept: {e}")))?;
            Ok(Box::new(stream))
        }

        #[cfg(not(unix))]
        {
            let (stream, _) = self
                .inner
                .accept()
                .await
                .map_err(|e| Error::transport_failed(format!("accept: {e}")))?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream))
        }
    }
}

impl Drop for BrokerListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            std::fs::remove_file(&self.path).ok();
        }
        #[cfg(not(unix))]
        {
            std::fs::remove_file(&self.portfile).ok();
        }
    }
}

/// Dial the endpoint for `id` under `dir`.
///
/// # Errors
///
/// Fails when nothing is listening on the endpoint.
pub async fn dial(dir: &Path, id: u64) -> Result<Conn> {
    #[cfg(unix)]
    {
        let path = socket_path(dir, id);
        let stream = tokio::net::UnixStream::connect(&path)
            .await
            .map_err(|e| Error::transport_failed(format!("dial {}: {e}", path.display())))?;
        Ok(Box::new(stream))
    }

    #[cfg(not(unix))]
    {
        let portfile = portfile_path(dir, id);
        let addr = std::fs::read_to_string(&portfile)
            .map_err(|e| Error::transport_failed(format!("read {}: {e}", portfile.display())))?;
        let stream = tokio::net::TcpStream::connect(addr.trim())
            .await
            .map_err(|e| Error::transport_failed(format!("dial {addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "trellis-transport-{tag}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn listener_accepts_dialled_connection() {
        let dir = scratch_dir("accept");
        let listener = BrokerListener::bind(&dir, 3).unwrap();

        let dialler = tokio::spawn({
            let dir = dir.clone();
            async move {
                let mut conn = dial(&dir, 3).await.unwrap();
                conn.write_all(b"hello").await.unwrap();
            }
        });

        let mut conn = listener.accept().await.unwrap();
        let mut buf = [0_u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        dialler.await.unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn dialling_an_unbound_id_fails() {
        let dir = scratch_dir("unbound");
        assert!(dial(&dir, 99).await.is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rebinding_replaces_a_stale_socket() {
        let dir = scratch_dir("stale");
        drop(BrokerListener::bind(&dir, 1).unwrap());
        // Simulate a crash leaving the file behind.
        std::fs::write(dir.join("ep-1.sock"), b"").unwrap();
        assert!(BrokerListener::bind(&dir, 1).is_ok());
        std::fs::remove_dir_all(&dir).ok();
    }
}

//! Per-child endpoint allocation.
//!
//! Each RPC plugin instance owns one broker: a private directory plus an
//! id counter. Id 0 is the control channel the child dials at startup;
//! every further id names a host-served callback endpoint handed to the
//! child at init. The child derives dial targets from the directory and
//! the id alone, so the host never has to reach into the child.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use trellis_core::Result;
use trellis_plugin_api::rpc::transport::{self, BrokerListener, Conn};

/// Endpoint allocator for one plugin child.
pub struct Broker {
    dir: PathBuf,
    next: AtomicU64,
}

impl Broker {
    /// Create a broker rooted at `dir`, creating the directory owner-only.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created.
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            dir,
            next: AtomicU64::new(1),
        })
    }

    /// The broker directory, shared with the child via its environment.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate a fresh endpoint id.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Bind the endpoint for `id`.
    ///
    /// # Errors
    ///
    /// Fails when the bind is refused.
    pub fn listen(&self, id: u64) -> Result<BrokerListener> {
        BrokerListener::bind(&self.dir, id)
    }

    /// Dial the endpoint for `id`.
    ///
    /// # Errors
    ///
    /// Fails when nothing is listening.
    pub async fn dial(&self, id: u64) -> Result<Conn> {
        transport::dial(&self.dir, id).await
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_skip_the_control_channel() {
        let dir = std::env::temp_dir().join(format!("trellis-broker-{}", std::process::id()));
        let broker = Broker::new(dir).unwrap();
        let first = broker.next_id();
        let second = broker.next_id();
        assert!(first >= 1);
        assert_ne!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn broker_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt as _;
        let dir = std::env::temp_dir().join(format!("trellis-broker-perm-{}", std::process::id()));
        let broker = Broker::new(dir.clone()).unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        drop(broker);
        assert!(!dir.exists());
    }
}

//! OS-level restriction of plugin child processes.
//!
//! Linux only; elsewhere the restriction step degrades to the environment
//! scrub plus a warning. The real isolation story belongs to the
//! deployment (containers, systemd slices); this is defense in depth.

use std::path::Path;

use tokio::process::Command;

/// Marker variable cooperating plugins check before opening sockets.
pub const ENV_NO_NETWORK: &str = "TRELLIS_NO_NETWORK";

/// Set to disable namespace creation, as test harnesses must.
pub const ENV_TEST_HARNESS: &str = "TRELLIS_TEST_HARNESS";

const CHILD_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How far to take process restriction for one child.
#[derive(Debug, Clone)]
pub struct RestrictionOptions {
    /// Attempt new mount and PID namespaces when user namespaces are
    /// available.
    pub namespaces: bool,
}

impl Default for RestrictionOptions {
    fn default() -> Self {
        Self { namespaces: true }
    }
}

/// Whether unprivileged namespace creation is worth attempting.
#[must_use]
pub fn namespaces_available() -> bool {
    if std::env::var_os(ENV_TEST_HARNESS).is_some() {
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        Path::new("/proc/self/ns/user").exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Scrub and rebuild the child environment and, on Linux, arrange
/// die-with-parent and namespace creation before exec.
///
/// The child sees a minimal PATH, HOME and TMPDIR pointing at its work
/// directory, the host's TZ when set, and [`ENV_NO_NETWORK`] when the
/// plugin was not granted outbound HTTP.
pub fn apply(
    command: &mut Command,
    work_dir: &Path,
    http_granted: bool,
    options: &RestrictionOptions,
) {
    command.env_clear();
    command.env("PATH", CHILD_PATH);
    command.env("HOME", work_dir);
    command.env("TMPDIR", work_dir);
    if let Ok(tz) = std::env::var("TZ") {
        command.env("TZ", tz);
    }
    if !http_granted {
        command.env(ENV_NO_NETWORK, "1");
    }

    #[cfg(target_os = "linux")]
    {
        use nix::sched::{CloneFlags, unshare};
        use nix::sys::prctl::set_pdeathsig;
        use nix::sys::signal::Signal;

        let namespaces = options.namespaces && namespaces_available();
        // SAFETY: the closure runs between fork and exec and only performs
        // async-signal-safe syscalls.
        unsafe {
            command.pre_exec(move || {
                set_pdeathsig(Signal::SIGKILL).ok();
                if namespaces {
                    // Best effort; the exec proceeds either way.
                    unshare(
                        CloneFlags::CLONE_NEWUSER
                            | CloneFlags::CLONE_NEWNS
                            | CloneFlags::CLONE_NEWPID,
                    )
                    .ok();
                }
                Ok(())
            });
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = options;
        tracing::warn!(
            "process restriction is unavailable on this platform; child runs with the scrubbed environment only"
        );
    }
}

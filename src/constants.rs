//! Constants for the launcher core.
//!
//! All limits, timeouts, and protocol strings are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Sandbox Helper
// =============================================================================

/// Candidate paths for the unprivileged sandbox helper binary.
pub const HELPER_PATHS: &[&str] = &[
    "/usr/bin/bwrap",
    "/usr/lib/flatpak/flatpak-bwrap",
];

/// Minimum acceptable helper version, as (major, minor, patch).
///
/// Older helpers are ptrace-able while holding elevated privileges
/// (CVE-2016-8659), so launch is refused outright below this.
pub const HELPER_MIN_VERSION: (u32, u32, u32) = (0, 1, 3);

/// File descriptor in the child that receives the directive stream.
pub const HELPER_ARGS_FD: i32 = 3;

/// Hostname set inside the browser sandbox UTS namespace.
pub const SANDBOX_HOSTNAME: &str = "amnesia";

/// Home directory presented inside the sandbox.
pub const SANDBOX_HOME: &str = "/home/amnesia";

// =============================================================================
// Seccomp
// =============================================================================

/// Maximum number of BPF instructions the kernel accepts in one filter.
pub const BPF_MAX_INSNS: usize = 0xffff;

/// Errno returned for filtered syscalls under a whitelist default action.
pub const DEFAULT_DENY_ERRNO: u16 = 38; // ENOSYS

// =============================================================================
// Surrogates
// =============================================================================

/// Socket name of the control-port surrogate in the runtime directory.
pub const CONTROL_SOCKET: &str = "control";

/// Socket name of the SOCKS surrogate in the runtime directory.
pub const SOCKS_SOCKET: &str = "socks";

/// Prefix of every SOCKS isolation tag.
pub const ISOLATION_TAG_PREFIX: &str = "sandboxed-tor-browser:";

/// Tor version string reported by the control-port surrogate.
///
/// Entirely synthetic; the browser only checks that it parses.
pub const SURROGATE_TOR_VERSION: &str = "0.2.8.7";

/// SOCKS listener address reported by the control-port surrogate.
pub const SURROGATE_SOCKS_ADDR: &str = "127.0.0.1:9150";

/// Maximum RFC 1929 password length after the isolation tag is appended.
pub const MAX_SOCKS_PASSWD_LEN: usize = 255;

// =============================================================================
// Tor Supervision
// =============================================================================

/// How long to wait for tor to write its `control_port` file.
pub const CONTROL_PORT_WAIT: Duration = Duration::from_secs(10);

/// Ceiling on the tor network bootstrap.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval of the bootstrap progress ticker.
pub const BOOTSTRAP_TICK: Duration = Duration::from_secs(1);

/// Every this many ticks, poll `GETINFO status/bootstrap-phase` in case
/// event delivery has stalled.
pub const BOOTSTRAP_POLL_TICKS: u32 = 10;

/// Capacity of the asynchronous control-event channel.
pub const CTRL_EVENT_CAPACITY: usize = 16;

/// Username presented by the supervisor's own SOCKS dialer.
pub const DIALER_USERNAME: &str = "sandboxed-tor-browser";

// =============================================================================
// Update Pipeline
// =============================================================================

/// Maximum accepted size of an update metadata document.
pub const MAX_METADATA_SIZE: usize = 1024 * 1024;

/// Maximum accepted size of a MAR patch file (128 MiB).
pub const MAX_MAR_SIZE: usize = 128 * 1024 * 1024;

/// Timeout for a single metadata fetch.
pub const METADATA_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Content of `update.status` after a successful apply.
pub const UPDATE_STATUS_SUCCEEDED: &str = "succeeded";

// =============================================================================
// Runtime Files
// =============================================================================

/// Application subdirectory of `$XDG_RUNTIME_DIR`.
pub const APP_RUNTIME_SUBDIR: &str = "orbox";

/// Exclusive-create lock file guarding the runtime directory.
pub const LOCK_FILE: &str = "lock";

/// File tor writes into its data directory once the control port is up.
pub const CONTROL_PORT_FILE: &str = "control_port";

/// AF_LOCAL control socket tor exports in its data directory.
pub const TOR_CONTROL_SOCKET: &str = "control";

/// AF_LOCAL SOCKS socket tor exports in its data directory.
pub const TOR_SOCKS_SOCKET: &str = "socks";

//! Tor supervision.
//!
//! A [`Tor`] either attaches to a system tor over its control port or
//! spawns a sandboxed tor and walks it through bootstrap. Either way it
//! owns the two AF_LOCAL surrogates the browser talks to, hands out
//! stream-isolated dialers, and tears everything down in the right order
//! on shutdown.

pub mod control;
mod ctrl_surrogate;
mod socks_surrogate;
pub mod torrc;

pub use ctrl_surrogate::CtrlSurrogate;
pub use socks_surrogate::{IsolationTag, SocksSurrogate};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::constants::{
    BOOTSTRAP_POLL_TICKS, BOOTSTRAP_TICK, BOOTSTRAP_TIMEOUT, CONTROL_PORT_FILE,
    CONTROL_PORT_WAIT, DIALER_USERNAME, TOR_CONTROL_SOCKET, TOR_SOCKS_SOCKET,
};
use crate::error::{Error, Result};
use crate::progress::{CancelToken, Progress};
use crate::sandbox::{Helper, SandboxSpec, SandboxedChild, UnshareOpts};
use crate::seccomp;
use crate::socks::{self, Address, AuthInfo, Endpoint, Stream};
use crate::tor::control::{ControlConn, ControlReply};
use crate::tor::torrc::ComposedTorrc;

/// Sandbox-side directory the tor bundle is mounted at.
const TOR_SANDBOX_DIR: &str = "/home/amnesia/tor";

/// Sandbox-side path of the injected torrc.
const TORRC_SANDBOX_PATH: &str = "/home/amnesia/torrc";

// =============================================================================
// Launch Configuration
// =============================================================================

/// Host-side inputs for spawning a sandboxed tor.
#[derive(Debug, Clone)]
pub struct TorLaunchConfig {
    /// Host directory holding the tor binary and pluggable transports.
    pub tor_dir: PathBuf,
    /// Host directory tor may write (DataDirectory, sockets).
    pub data_dir: PathBuf,
    /// Whether the torrc enables bridges; selects the seccomp profile.
    pub use_bridges: bool,
}

// =============================================================================
// Dialer
// =============================================================================

/// Something that can open streams through tor.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens a stream to `host:port` through tor.
    async fn dial(&self, host: &str, port: u16) -> Result<Stream>;
}

/// SOCKS5 dialer with the launcher's own stream isolation credentials,
/// distinct from the browser's per-request tags.
#[derive(Debug, Clone)]
pub struct TorDialer {
    endpoint: Endpoint,
    auth: AuthInfo,
}

#[async_trait]
impl Dialer for TorDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<Stream> {
        let addr = Address::Domain(host.to_string(), port);
        socks::connect(&self.endpoint, &addr, Some(&self.auth)).await
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct TorInner {
    ctrl: Option<ControlConn>,
    child: Option<SandboxedChild>,
    cached_socks: Option<Endpoint>,
}

/// A supervised tor instance, system or sandboxed.
pub struct Tor {
    is_system: bool,
    inner: Arc<Mutex<TorInner>>,
    tag: IsolationTag,
    socks_surrogate: Option<SocksSurrogate>,
    ctrl_surrogate: Option<CtrlSurrogate>,
}

impl Tor {
    /// Attaches to a system tor at `control_endpoint` and launches the
    /// surrogates under `runtime_dir`.
    ///
    /// System tors authenticate with an empty password (NULL auth or an
    /// open cookie path is the operator's choice, not ours).
    ///
    /// # Errors
    ///
    /// Dial or authentication failures, surrogate binding failures.
    pub async fn attach_system(control_endpoint: &Endpoint, runtime_dir: &Path) -> Result<Self> {
        let (mut ctrl, _events) = ControlConn::connect(control_endpoint).await?;
        ctrl.authenticate("").await?;

        let socks_endpoint = ctrl.socks_endpoint().await?;
        info!(%socks_endpoint, "attached to system tor");

        let inner = Arc::new(Mutex::new(TorInner {
            ctrl: Some(ctrl),
            child: None,
            cached_socks: Some(socks_endpoint.clone()),
        }));

        Self::assemble(true, inner, socks_endpoint, runtime_dir, false)
    }

    /// Spawns a sandboxed tor, bootstraps it, and launches the surrogates.
    ///
    /// The tor sandbox keeps the host network namespace (tor is the one
    /// process that legitimately talks to the outside) but unshares
    /// everything else and runs under the tor seccomp whitelist.
    ///
    /// # Errors
    ///
    /// Sandbox launch failures, control-port timeouts, authentication
    /// failures, bootstrap timeout or crash, cancellation.
    pub async fn spawn_sandboxed(
        helper: &Helper,
        launch: &TorLaunchConfig,
        torrc: ComposedTorrc,
        runtime_dir: &Path,
        progress: &Progress,
        cancel: &mut CancelToken,
    ) -> Result<Self> {
        let mut spec = SandboxSpec::new(format!("{TOR_SANDBOX_DIR}/tor"));
        spec.child_args(["-f", TORRC_SANDBOX_PATH]);

        let mut unshare = UnshareOpts::all();
        unshare.net = false;
        spec.unshare(unshare);

        spec.ro_bind(&launch.tor_dir, TOR_SANDBOX_DIR, false)?;
        spec.bind(&launch.data_dir, &format!("{TOR_SANDBOX_DIR}/data"), false)?;
        spec.file(TORRC_SANDBOX_PATH, torrc.contents);
        spec.stdio(Stdio::null(), Stdio::null(), Stdio::null());

        let use_bridges = launch.use_bridges;
        spec.seccomp(Box::new(move |fd| {
            let env = seccomp::SeccompEnvironment::default();
            let profile = seccomp::tor_profile(&env, use_bridges)?;
            let mut fd = fd;
            profile.compile(&mut fd)
        }));

        progress.update("Starting the Tor process.");
        let mut child = helper.spawn(spec).await?;

        // Wait for tor to write its control_port file.
        let control_port_path = launch.data_dir.join(CONTROL_PORT_FILE);
        match wait_for_file(&control_port_path, cancel).await {
            Ok(contents) => {
                debug!(contents = %String::from_utf8_lossy(&contents).trim(), "control port is up");
            }
            Err(e) => {
                child.kill();
                let _ = child.wait().await;
                return Err(e);
            }
        }

        progress.update("Connecting to the Tor Control Port.");
        let control_endpoint = Endpoint::Unix(launch.data_dir.join(TOR_CONTROL_SOCKET));
        let bootstrap = async {
            let (mut ctrl, mut events) = ControlConn::connect(&control_endpoint).await?;
            ctrl.authenticate(&torrc.control_password).await?;

            // Tie tor's lifetime to this control connection; no turd
            // processes when the launcher goes away.
            ctrl.request("TAKEOWNERSHIP").await?;
            ctrl.request("SETEVENTS STATUS_CLIENT").await?;

            progress.update("Connecting to the Tor network.");
            ctrl.request("RESETCONF DisableNetwork").await?;

            wait_for_bootstrap(&mut ctrl, &mut events, &child, progress, cancel).await?;

            // Squelch and drain; nobody consumes events after this.
            ctrl.request("SETEVENTS").await?;
            while events.try_recv().is_ok() {}
            Ok::<ControlConn, Error>(ctrl)
        };

        let ctrl = match bootstrap.await {
            Ok(ctrl) => ctrl,
            Err(e) => {
                child.kill();
                let _ = child.wait().await;
                return Err(e);
            }
        };

        let socks_endpoint = Endpoint::Unix(launch.data_dir.join(TOR_SOCKS_SOCKET));
        let inner = Arc::new(Mutex::new(TorInner {
            ctrl: Some(ctrl),
            child: Some(child),
            cached_socks: Some(socks_endpoint.clone()),
        }));

        Self::assemble(false, inner, socks_endpoint, runtime_dir, false)
    }

    fn assemble(
        is_system: bool,
        inner: Arc<Mutex<TorInner>>,
        socks_endpoint: Endpoint,
        runtime_dir: &Path,
        forward_newnym: bool,
    ) -> Result<Self> {
        let tag = IsolationTag::new();

        let socks_surrogate =
            SocksSurrogate::launch(runtime_dir, socks_endpoint, tag.clone())?;

        // The control surrogate reaches back only through this channel,
        // and the forward task only holds a weak reference; no cycle.
        let newnym_tx = if forward_newnym {
            let (tx, rx) = mpsc::channel(1);
            spawn_newnym_forwarder(Arc::downgrade(&inner), rx);
            Some(tx)
        } else {
            None
        };

        let ctrl_surrogate = match CtrlSurrogate::launch(runtime_dir, tag.clone(), newnym_tx) {
            Ok(s) => s,
            Err(e) => {
                socks_surrogate.close();
                return Err(e);
            }
        };

        Ok(Self {
            is_system,
            inner,
            tag,
            socks_surrogate: Some(socks_surrogate),
            ctrl_surrogate: Some(ctrl_surrogate),
        })
    }

    /// True if this wraps an OS-managed tor instance.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.is_system
    }

    /// Path of the SOCKS surrogate socket.
    ///
    /// # Panics
    ///
    /// Never before shutdown; surrogates exist for the supervisor's whole
    /// useful life.
    #[must_use]
    pub fn socks_surrogate_path(&self) -> PathBuf {
        self.socks_surrogate
            .as_ref()
            .map(|s| s.socket_path().to_path_buf())
            .unwrap_or_default()
    }

    /// Path of the control surrogate socket.
    #[must_use]
    pub fn ctrl_surrogate_path(&self) -> PathBuf {
        self.ctrl_surrogate
            .as_ref()
            .map(|s| s.socket_path().to_path_buf())
            .unwrap_or_default()
    }

    /// A dialer through tor's SOCKS port with the launcher's own
    /// isolation credentials.
    ///
    /// # Errors
    ///
    /// `TorNotRunning` after shutdown.
    pub async fn dialer(&self) -> Result<TorDialer> {
        let mut inner = self.inner.lock().await;
        if inner.ctrl.is_none() {
            return Err(Error::TorNotRunning);
        }

        let endpoint = match &inner.cached_socks {
            Some(ep) => ep.clone(),
            None => {
                let ctrl = inner.ctrl.as_mut().ok_or(Error::TorNotRunning)?;
                let ep = ctrl.socks_endpoint().await?;
                inner.cached_socks = Some(ep.clone());
                ep
            }
        };

        Ok(TorDialer {
            endpoint,
            auth: AuthInfo {
                uname: DIALER_USERNAME.as_bytes().to_vec(),
                passwd: format!("isolation:{}", std::process::id()).into_bytes(),
            },
        })
    }

    /// Sends `SIGNAL NEWNYM` to the real tor.
    ///
    /// # Errors
    ///
    /// `TorNotRunning` or control failures.
    pub async fn newnym(&self) -> Result<()> {
        signal_newnym(&self.inner).await
    }

    /// Issues a `GETINFO` and returns the reply.
    ///
    /// # Errors
    ///
    /// `TorNotRunning` or control failures.
    pub async fn getinfo(&self, key: &str) -> Result<ControlReply> {
        let mut inner = self.inner.lock().await;
        let ctrl = inner.ctrl.as_mut().ok_or(Error::TorNotRunning)?;
        ctrl.request(&format!("GETINFO {key}")).await
    }

    /// Shuts everything down.
    ///
    /// A sandboxed tor gets `SIGNAL HALT`, the control connection close,
    /// and a SIGTERM for good measure; a system tor only has its control
    /// connection closed. Surrogates are closed in both cases.
    pub async fn shutdown(&mut self) {
        let mut inner = self.inner.lock().await;

        if let Some(mut ctrl) = inner.ctrl.take() {
            if !self.is_system {
                let _ = ctrl.request("SIGNAL HALT").await;
            }
            ctrl.close();
        }

        if let Some(mut child) = inner.child.take() {
            child.signal(libc::SIGTERM);
            let _ = child.wait().await;
        }
        inner.cached_socks = None;
        drop(inner);

        if let Some(s) = self.ctrl_surrogate.take() {
            s.close();
        }
        if let Some(s) = self.socks_surrogate.take() {
            s.close();
        }
    }

    /// The shared isolation tag, for tests and diagnostics.
    #[must_use]
    pub fn isolation_tag(&self) -> &IsolationTag {
        &self.tag
    }
}

async fn signal_newnym(inner: &Arc<Mutex<TorInner>>) -> Result<()> {
    let mut guard = inner.lock().await;
    let ctrl = guard.ctrl.as_mut().ok_or(Error::TorNotRunning)?;
    ctrl.request("SIGNAL NEWNYM").await?;
    Ok(())
}

fn spawn_newnym_forwarder(inner: Weak<Mutex<TorInner>>, mut rx: mpsc::Receiver<()>) {
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if let Err(e) = signal_newnym(&inner).await {
                warn!(error = %e, "failed to forward NEWNYM");
            }
        }
    });
}

// =============================================================================
// Bootstrap
// =============================================================================

/// Polls for a file tor writes at startup, at 1 Hz with a hard deadline,
/// racing the cancel signal.
async fn wait_for_file(path: &Path, cancel: &mut CancelToken) -> Result<Vec<u8>> {
    let mut ticker = tokio::time::interval(BOOTSTRAP_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // First tick fires immediately; burn it.
    let ticks = CONTROL_PORT_WAIT.as_secs();

    for _ in 0..=ticks {
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }
        match std::fs::read(path) {
            Ok(contents) => return Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.canceled() => return Err(Error::Canceled),
        }
    }
    Err(Error::Timeout {
        operation: format!("waiting for {}", path.display()),
        duration: CONTROL_PORT_WAIT,
    })
}

/// Runs the bootstrap wait loop: events preferred, ticker as watchdog.
///
/// Every tick the tor process is probed with `kill(pid, 0)`; every
/// [`BOOTSTRAP_POLL_TICKS`] ticks a `GETINFO status/bootstrap-phase` is
/// issued in case event delivery stalled.
async fn wait_for_bootstrap(
    ctrl: &mut ControlConn,
    events: &mut mpsc::Receiver<ControlReply>,
    child: &SandboxedChild,
    progress: &Progress,
    cancel: &mut CancelToken,
) -> Result<()> {
    const EVENT_PREFIX: &str = "STATUS_CLIENT ";
    const STATUS_PREFIX: &str = "status/bootstrap-phase=";

    let mut ticker = tokio::time::interval(BOOTSTRAP_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // First tick fires immediately; burn it.

    let max_ticks = BOOTSTRAP_TIMEOUT.as_secs() as u32;
    let mut ticks: u32 = 0;

    while ticks < max_ticks {
        tokio::select! {
            ev = events.recv() => {
                let Some(ev) = ev else {
                    return Err(Error::TorNotRunning);
                };
                let Some(line) = ev.first().strip_prefix(EVENT_PREFIX) else {
                    continue;
                };
                if handle_bootstrap_event(progress, line) {
                    return Ok(());
                }
            }
            _ = cancel.canceled() => return Err(Error::Canceled),
            _ = ticker.tick() => {
                // kill(pid, 0) catches a tor that fell over without a
                // whimper; waitpid would be tidier but this is only a
                // crash detector.
                let gone = match child.id() {
                    Some(pid) => {
                        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
                        rc != 0
                            && std::io::Error::last_os_error().raw_os_error()
                                == Some(libc::ESRCH)
                    }
                    None => true,
                };
                if gone {
                    return Err(Error::Protocol(
                        "tor process appears to have crashed".into(),
                    ));
                }

                ticks += 1;
                if ticks % BOOTSTRAP_POLL_TICKS != 0 {
                    continue;
                }

                let reply = ctrl.request("GETINFO status/bootstrap-phase").await?;
                let line = reply.first();
                let line = line.strip_prefix(STATUS_PREFIX).unwrap_or(line);
                if handle_bootstrap_event(progress, line) {
                    return Ok(());
                }
            }
        }
    }

    Err(Error::Timeout {
        operation: "tor network bootstrap".into(),
        duration: BOOTSTRAP_TIMEOUT,
    })
}

/// Parses one `NOTICE BOOTSTRAP PROGRESS=… SUMMARY="…"` line, publishing
/// progress and returning completion.
fn handle_bootstrap_event(progress: &Progress, line: &str) -> bool {
    const BOOTSTRAP_PREFIX: &str = "NOTICE BOOTSTRAP ";
    let Some(rest) = line.strip_prefix(BOOTSTRAP_PREFIX) else {
        return false;
    };

    let mut pct = "";
    let mut summary = "";
    for field in split_quoted(rest) {
        if let Some(v) = field.strip_prefix("PROGRESS=") {
            pct = v;
        } else if let Some(v) = field.strip_prefix("SUMMARY=") {
            summary = v.trim_matches('"');
        }
    }

    if !pct.is_empty() && !summary.is_empty() {
        progress.update(format!("Bootstrap: {summary}"));
        return pct == "100";
    }
    false
}

/// Whitespace split that keeps double-quoted runs intact.
fn split_quoted(s: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut start = None;
    let mut quoted = false;

    for (i, c) in s.char_indices() {
        match c {
            '"' => {
                quoted = !quoted;
                if start.is_none() {
                    start = Some(i);
                }
            }
            c if c.is_whitespace() && !quoted => {
                if let Some(st) = start.take() {
                    fields.push(&s[st..i]);
                }
            }
            _ => {
                if start.is_none() {
                    start = Some(i);
                }
            }
        }
    }
    if let Some(st) = start {
        fields.push(&s[st..]);
    }
    fields
}

// =============================================================================
// Tests
// =============================================================================

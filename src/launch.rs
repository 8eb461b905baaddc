//! Browser launch path.
//!
//! Assembles the sandbox for the browser itself: the bundle mounted
//! read-only with writable islands for the profile and downloads, X11 and
//! (optionally) PulseAudio proxied in, the two tor surrogates bound into
//! the runtime directory, and the AF_LOCAL compatibility stub preloaded
//! so the browser's TCP-expecting tor client code lands on our sockets.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::LauncherEnv;
use crate::constants::{CONTROL_SOCKET, SANDBOX_HOME, SOCKS_SOCKET};
use crate::error::{Error, Result};
use crate::progress::{CancelToken, Progress};
use crate::sandbox::{x11, Helper, SandboxSpec, SandboxedChild};
use crate::seccomp;
use crate::tor::torrc::{self, TorrcConfig};
use crate::tor::{Tor, TorLaunchConfig};
use crate::update::TorLauncher;

/// Sandbox-side bundle root.
const BUNDLE_SANDBOX_DIR: &str = "/home/amnesia/sandboxed-tor-browser";

/// Sandbox-side path the preload stub is injected at.
const STUB_SANDBOX_PATH: &str = "/tmp/tbb_stub.so";

/// Profile directory relative to the browser home.
const PROFILE_SUBDIR: &str = "TorBrowser/Data/Browser/profile.default";

/// Caches directory relative to the browser home.
const CACHES_SUBDIR: &str = "TorBrowser/Data/Browser/Caches";

/// GTK 2 theme tweaks injected into the sandbox home.
const GTKRC: &[u8] = include_bytes!("../assets/gtkrc-2.0");

// =============================================================================
// Launch Configuration
// =============================================================================

/// Host-side inputs for launching the browser.
#[derive(Debug, Clone)]
pub struct BrowserLaunchConfig {
    /// Host directory holding the installed bundle (`tor-browser/`).
    pub user_data_dir: PathBuf,
    /// Host path of the AF_LOCAL preload stub shipped with the launcher.
    pub preload_stub: PathBuf,
    /// Overrides the sandboxed Downloads directory.
    pub downloads_dir: Option<PathBuf>,
    /// Overrides the sandboxed Desktop directory.
    pub desktop_dir: Option<PathBuf>,
    /// Leave the extensions directory writable.
    pub volatile_extensions_dir: bool,
    /// Proxy PulseAudio into the sandbox.
    pub enable_pulse_audio: bool,
}

/// Launches the sandboxed browser against a running supervisor.
///
/// The returned child is the caller's to `wait()` on; tor and the
/// surrogates stay up independently.
///
/// # Errors
///
/// Missing bundle pieces, X11 failures, sandbox launch failures.
pub async fn run_browser(
    helper: &Helper,
    env: &LauncherEnv,
    cfg: &BrowserLaunchConfig,
    tor: &Tor,
) -> Result<SandboxedChild> {
    let browser_home = format!("{BUNDLE_SANDBOX_DIR}/tor-browser/Browser");
    let profile_dir = format!("{browser_home}/{PROFILE_SUBDIR}");
    let caches_dir = format!("{browser_home}/{CACHES_SUBDIR}");
    let downloads_dir = format!("{browser_home}/Downloads");
    let desktop_dir = format!("{browser_home}/Desktop");

    let real_browser_home = cfg.user_data_dir.join("tor-browser/Browser");
    let real_profile_dir = real_browser_home.join(PROFILE_SUBDIR);
    let real_caches_dir = real_browser_home.join(CACHES_SUBDIR);

    // Mountpoints must exist before the helper binds over them.
    let real_desktop_dir = match &cfg.desktop_dir {
        Some(dir) => dir.clone(),
        None => {
            let dir = real_browser_home.join("Desktop");
            std::fs::create_dir_all(&dir)?;
            dir
        }
    };
    let real_downloads_dir = match &cfg.downloads_dir {
        Some(dir) => dir.clone(),
        None => {
            let dir = real_browser_home.join("Downloads");
            std::fs::create_dir_all(&dir)?;
            dir
        }
    };

    let mut spec = SandboxSpec::new(format!("{browser_home}/firefox"));
    spec.child_args(["--class", "Tor Browser", "-profile", &profile_dir]);
    spec.fake_dbus(true);
    spec.seccomp(Box::new(|fd| {
        let env = seccomp::SeccompEnvironment::default();
        let profile = seccomp::browser_profile(&env)?;
        let mut fd = fd;
        profile.compile(&mut fd)
    }));

    // X11, themes, and audio.
    let display = env.display.as_deref().ok_or(Error::MissingEnv("DISPLAY"))?;
    let x_display = x11::X11Display::resolve(display, env.xauthority.as_deref())?;
    x_display.apply_to(&mut spec)?;

    spec.ro_bind("/usr/share/themes", "/usr/share/themes", true)?;
    spec.ro_bind("/usr/share/icons", "/usr/share/icons", true)?;
    spec.ro_bind("/usr/share/mime", "/usr/share/mime", true)?;
    spec.ro_bind("/usr/share/fonts", "/usr/share/fonts", true)?;
    let gtkrc_path = format!("{SANDBOX_HOME}/.gtkrc-2.0");
    spec.setenv("GTK2_RC_FILES", &gtkrc_path);
    spec.file(&gtkrc_path, GTKRC.to_vec());

    if cfg.enable_pulse_audio {
        if let Some(server) = &env.pulse_server {
            if let Err(e) =
                x11::enable_pulse_audio(&mut spec, server, env.pulse_cookie.as_deref())
            {
                warn!(error = %e, "failed to proxy PulseAudio, continuing without");
            }
        }
    }

    // Filesystem: read-only bundle, writable profile/caches/downloads.
    spec.ro_bind(&cfg.user_data_dir, BUNDLE_SANDBOX_DIR, false)?;
    spec.bind(&real_profile_dir, &profile_dir, false)?;
    spec.bind(&real_desktop_dir, &desktop_dir, false)?;
    spec.bind(&real_downloads_dir, &downloads_dir, false)?;
    spec.bind(&real_caches_dir, &caches_dir, false)?;
    if !cfg.volatile_extensions_dir {
        spec.ro_bind(
            real_profile_dir.join("extensions"),
            &format!("{profile_dir}/extensions"),
            true,
        )?;
    }
    spec.chdir(&browser_home);

    // GNOME chokes on a read-only $HOME, so the usual directories are
    // symlinked into the writable islands instead of remapping $HOME.
    spec.symlink(&desktop_dir, &format!("{SANDBOX_HOME}/Desktop"));
    spec.symlink(&downloads_dir, &format!("{SANDBOX_HOME}/Downloads"));

    // Environment the bundle's own launcher script would have set.
    spec.setenv(
        "LD_LIBRARY_PATH",
        &format!("{browser_home}/TorBrowser/Tor"),
    );
    spec.setenv(
        "FONTCONFIG_PATH",
        &format!("{browser_home}/TorBrowser/Data/fontconfig"),
    );
    spec.setenv("FONTCONFIG_FILE", "fonts.conf");
    spec.setenv("ASAN_OPTIONS", "detect_leaks=0");

    // The browser believes a system tor is handling everything.
    spec.setenv("TOR_SOCKS_PORT", "9150");
    spec.setenv("TOR_CONTROL_PORT", "9151");
    spec.setenv("TOR_SKIP_LAUNCH", "1");
    spec.setenv("TOR_NO_DISPLAY_NETWORK_SETTINGS", "1");

    // Surrogate sockets, and the stub that reroutes the browser's tor
    // traffic onto them.
    let ctrl_path = format!("{}/{CONTROL_SOCKET}", spec.runtime_dir);
    let socks_path = format!("{}/{SOCKS_SOCKET}", spec.runtime_dir);
    spec.bind(tor.ctrl_surrogate_path(), &ctrl_path, false)?;
    spec.bind(tor.socks_surrogate_path(), &socks_path, false)?;
    spec.setenv("LD_PRELOAD", STUB_SANDBOX_PATH);
    spec.setenv("TOR_STUB_CONTROL_SOCKET", &ctrl_path);
    spec.setenv("TOR_STUB_SOCKS_SOCKET", &socks_path);
    let stub = std::fs::read(&cfg.preload_stub)
        .map_err(|_| Error::BindSourceMissing(cfg.preload_stub.clone()))?;
    spec.file(STUB_SANDBOX_PATH, stub);

    info!("launching sandboxed browser");
    helper.spawn(spec).await
}

// =============================================================================
// Tor Relauncher
// =============================================================================

/// [`TorLauncher`] implementation for the update pipeline: recomposes the
/// torrc (fresh control password and all) and spawns a new sandboxed tor.
pub struct SandboxedTorLauncher {
    helper: Helper,
    launch: TorLaunchConfig,
    torrc: TorrcConfig,
    runtime_dir: PathBuf,
}

impl SandboxedTorLauncher {
    /// Builds a relauncher around the same inputs the original launch
    /// used.
    #[must_use]
    pub fn new(
        helper: Helper,
        launch: TorLaunchConfig,
        torrc: TorrcConfig,
        runtime_dir: &Path,
    ) -> Self {
        Self {
            helper,
            launch,
            torrc,
            runtime_dir: runtime_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl TorLauncher for SandboxedTorLauncher {
    async fn launch(&self, progress: &Progress, cancel: &mut CancelToken) -> Result<Tor> {
        let composed = torrc::compose(&self.torrc)?;
        Tor::spawn_sandboxed(
            &self.helper,
            &self.launch,
            composed,
            &self.runtime_dir,
            progress,
            cancel,
        )
        .await
    }
}

//! Launcher environment inputs.
//!
//! The core consumes a handful of environment variables and a runtime
//! directory; everything else (persistent configuration, XDG data paths)
//! belongs to collaborators outside this crate.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::constants::{APP_RUNTIME_SUBDIR, LOCK_FILE};
use crate::error::{Error, Result};
use crate::socks::Endpoint;

// =============================================================================
// Environment
// =============================================================================

/// Environment-derived launcher inputs.
#[derive(Debug, Clone)]
pub struct LauncherEnv {
    /// `$XDG_RUNTIME_DIR/orbox`, where sockets and the lock live.
    pub runtime_dir: PathBuf,
    /// Control endpoint of a system tor, when `TOR_CONTROL_PORT` selects
    /// attach mode.
    pub system_tor: Option<Endpoint>,
    /// `DISPLAY`, required to launch the browser.
    pub display: Option<String>,
    /// `XAUTHORITY`.
    pub xauthority: Option<PathBuf>,
    /// `PULSE_SERVER`.
    pub pulse_server: Option<String>,
    /// `PULSE_COOKIE`.
    pub pulse_cookie: Option<PathBuf>,
}

impl LauncherEnv {
    /// Reads the process environment.
    ///
    /// # Errors
    ///
    /// Unsupported platforms, a missing `XDG_RUNTIME_DIR`, or a
    /// malformed `TOR_CONTROL_PORT`.
    pub fn from_env() -> Result<Self> {
        if !cfg!(target_os = "linux") {
            return Err(Error::UnsupportedPlatform(
                std::env::consts::OS.to_string(),
            ));
        }
        if !cfg!(any(target_arch = "x86_64", target_arch = "x86")) {
            return Err(Error::UnsupportedPlatform(
                std::env::consts::ARCH.to_string(),
            ));
        }

        let xdg_runtime = std::env::var_os("XDG_RUNTIME_DIR")
            .filter(|v| !v.is_empty())
            .ok_or(Error::MissingEnv("XDG_RUNTIME_DIR"))?;
        let runtime_dir = PathBuf::from(xdg_runtime).join(APP_RUNTIME_SUBDIR);

        let system_tor = match std::env::var("TOR_CONTROL_PORT") {
            Ok(v) if !v.is_empty() => Some(parse_control_port(&v)?),
            _ => None,
        };

        Ok(Self {
            runtime_dir,
            system_tor,
            display: std::env::var("DISPLAY").ok().filter(|v| !v.is_empty()),
            xauthority: std::env::var_os("XAUTHORITY").map(PathBuf::from),
            pulse_server: std::env::var("PULSE_SERVER").ok().filter(|v| !v.is_empty()),
            pulse_cookie: std::env::var_os("PULSE_COOKIE").map(PathBuf::from),
        })
    }
}

/// Parses `TOR_CONTROL_PORT`: `unix:/path`, `host:port`, or a bare port
/// on localhost.
fn parse_control_port(value: &str) -> Result<Endpoint> {
    if let Some(path) = value.strip_prefix("unix:") {
        if !path.starts_with('/') {
            return Err(Error::InvalidConfig {
                what: "TOR_CONTROL_PORT".into(),
                reason: format!("'{value}' is not an absolute socket path"),
            });
        }
        return Ok(Endpoint::Unix(path.into()));
    }
    if value.parse::<u16>().is_ok() {
        return Ok(Endpoint::Tcp(format!("127.0.0.1:{value}")));
    }
    if value.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        return Ok(Endpoint::Tcp(value.to_string()));
    }
    Err(Error::InvalidConfig {
        what: "TOR_CONTROL_PORT".into(),
        reason: format!("unparseable endpoint '{value}'"),
    })
}

// =============================================================================
// Runtime Directory Lock
// =============================================================================

/// Exclusive-create lock guarding the runtime directory against a second
/// launcher instance. Held for the process lifetime; removed on drop.
#[derive(Debug)]
pub struct RuntimeLock {
    path: PathBuf,
}

impl RuntimeLock {
    /// Creates the runtime directory (mode 0700) and takes the lock.
    ///
    /// # Errors
    ///
    /// An already-present lock file, or directory creation failures.
    pub fn acquire(runtime_dir: &Path) -> Result<Self> {
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(0o700);
        builder.create(runtime_dir)?;

        let path = runtime_dir.join(LOCK_FILE);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::InvalidConfig {
                        what: "runtime directory".into(),
                        reason: "another instance appears to be running".into(),
                    }
                } else {
                    e.into()
                }
            })?;
        Ok(Self { path })
    }
}

impl Drop for RuntimeLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_port_unix() {
        let ep = parse_control_port("unix:/run/tor/control").unwrap();
        assert!(matches!(ep, Endpoint::Unix(p) if p == Path::new("/run/tor/control")));
    }

    #[test]
    fn test_parse_control_port_bare_port() {
        let ep = parse_control_port("9051").unwrap();
        assert!(matches!(ep, Endpoint::Tcp(a) if a == "127.0.0.1:9051"));
    }

    #[test]
    fn test_parse_control_port_host_port() {
        let ep = parse_control_port("127.0.0.1:9151").unwrap();
        assert!(matches!(ep, Endpoint::Tcp(a) if a == "127.0.0.1:9151"));
    }

    #[test]
    fn test_parse_control_port_garbage() {
        assert!(parse_control_port("unix:relative/path").is_err());
        assert!(parse_control_port("no ports here").is_err());
    }

    #[test]
    fn test_runtime_lock_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = dir.path().join("orbox");

        let lock = RuntimeLock::acquire(&runtime).unwrap();
        let second = RuntimeLock::acquire(&runtime);
        assert!(second.is_err(), "second acquire must fail");

        drop(lock);
        let third = RuntimeLock::acquire(&runtime);
        assert!(third.is_ok(), "lock must be released on drop");
    }
}

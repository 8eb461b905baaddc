//! X11 and PulseAudio plumbing for the browser sandbox.
//!
//! Only local (AF_LOCAL) X servers are supported: the display socket is
//! bind-mounted into the sandbox and a fresh single-entry `.Xauthority` is
//! synthesized for the sandbox hostname, so the host's cookie file never
//! crosses the boundary whole.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::constants::{SANDBOX_HOME, SANDBOX_HOSTNAME};
use crate::error::{Error, Result};
use crate::sandbox::spec::SandboxSpec;

const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// Xauthority family for a local named host.
const FAMILY_LOCAL: u16 = 256;

const AUTH_METHOD: &str = "MIT-MAGIC-COOKIE-1";

// =============================================================================
// Display
// =============================================================================

/// A resolved local X11 display.
#[derive(Debug)]
pub struct X11Display {
    /// Display number on the host.
    number: u32,
    /// Host path of the display's AF_LOCAL socket.
    socket: PathBuf,
    /// Cookie extracted from the host Xauthority, if any.
    cookie: Option<Vec<u8>>,
}

impl X11Display {
    /// Resolves `DISPLAY`/`XAUTHORITY` into a bindable display.
    ///
    /// # Errors
    ///
    /// Rejects unset, non-local, or unparseable displays and a missing
    /// display socket. A missing or unparseable cookie is tolerated (some
    /// servers run without authentication).
    pub fn resolve(display: &str, xauthority: Option<&Path>) -> Result<Self> {
        let number = parse_display(display).ok_or_else(|| Error::InvalidConfig {
            what: "DISPLAY".into(),
            reason: format!("'{display}' is not a local display"),
        })?;

        let socket = PathBuf::from(format!("{X11_SOCKET_DIR}/X{number}"));
        if !socket.exists() {
            return Err(Error::InvalidConfig {
                what: "DISPLAY".into(),
                reason: format!("no X server socket at {}", socket.display()),
            });
        }

        let cookie = xauthority
            .and_then(|p| std::fs::read(p).ok())
            .and_then(|data| find_cookie(&data, number));
        if cookie.is_none() {
            debug!("no usable X authority cookie, assuming an open server");
        }

        Ok(Self {
            number,
            socket,
            cookie,
        })
    }

    /// Wires the display into a sandbox spec: socket bind, `DISPLAY`, and
    /// a synthesized `.Xauthority` when a cookie is available.
    ///
    /// Inside the sandbox the display is always `:0`.
    pub fn apply_to(&self, spec: &mut SandboxSpec) -> Result<()> {
        spec.bind(&self.socket, &format!("{X11_SOCKET_DIR}/X0"), false)?;
        spec.setenv("DISPLAY", ":0");

        if let Some(cookie) = &self.cookie {
            let xauth_path = format!("{SANDBOX_HOME}/.Xauthority");
            spec.file(&xauth_path, make_xauthority(cookie));
            spec.setenv("XAUTHORITY", &xauth_path);
        }
        Ok(())
    }

    /// Host display number.
    #[must_use]
    pub fn number(&self) -> u32 {
        self.number
    }
}

/// Parses `:N`, `:N.S`, or `unix:N` display strings. Anything with a
/// hostname component is remote and unsupported.
fn parse_display(display: &str) -> Option<u32> {
    let rest = display
        .strip_prefix("unix:")
        .or_else(|| display.strip_prefix(':'))?;
    let number = rest.split('.').next()?;
    number.parse().ok()
}

// =============================================================================
// Xauthority
// =============================================================================

/// Scans an Xauthority file for a MIT-MAGIC-COOKIE-1 entry matching the
/// display number (entries with an empty display match any).
fn find_cookie(data: &[u8], display: u32) -> Option<Vec<u8>> {
    let mut cur = data;
    while !cur.is_empty() {
        let (_family, rest) = read_u16(cur)?;
        let (_address, rest) = read_counted(rest)?;
        let (number, rest) = read_counted(rest)?;
        let (name, rest) = read_counted(rest)?;
        let (cookie, rest) = read_counted(rest)?;
        cur = rest;

        if name != AUTH_METHOD.as_bytes() {
            continue;
        }
        let number = std::str::from_utf8(number).ok()?;
        if number.is_empty() || number.parse() == Ok(display) {
            return Some(cookie.to_vec());
        }
    }
    None
}

/// Serializes a single-entry Xauthority for display `:0` on the sandbox
/// hostname.
fn make_xauthority(cookie: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + cookie.len());
    out.extend_from_slice(&FAMILY_LOCAL.to_be_bytes());
    for field in [
        SANDBOX_HOSTNAME.as_bytes(),
        b"0",
        AUTH_METHOD.as_bytes(),
        cookie,
    ] {
        out.extend_from_slice(&(field.len() as u16).to_be_bytes());
        out.extend_from_slice(field);
    }
    out
}

fn read_u16(data: &[u8]) -> Option<(u16, &[u8])> {
    if data.len() < 2 {
        return None;
    }
    Some((u16::from_be_bytes([data[0], data[1]]), &data[2..]))
}

fn read_counted(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let (len, rest) = read_u16(data)?;
    let len = usize::from(len);
    if rest.len() < len {
        return None;
    }
    Some((&rest[..len], &rest[len..]))
}

// =============================================================================
// PulseAudio
// =============================================================================

/// Wires a local PulseAudio server into the sandbox, if one is configured.
///
/// `PULSE_SERVER` must name an AF_LOCAL socket (`unix:/path` or a bare
/// path); the socket is bound into the sandbox runtime directory and the
/// cookie, when present, is injected alongside.
///
/// # Errors
///
/// Non-local servers and missing sockets; the caller treats failures as
/// non-fatal (the browser just runs without audio).
pub fn enable_pulse_audio(
    spec: &mut SandboxSpec,
    server: &str,
    cookie_path: Option<&Path>,
) -> Result<()> {
    let path = server.strip_prefix("unix:").unwrap_or(server);
    if !path.starts_with('/') {
        return Err(Error::InvalidConfig {
            what: "PULSE_SERVER".into(),
            reason: format!("'{server}' is not a local socket"),
        });
    }
    let host_socket = Path::new(path);
    if !host_socket.exists() {
        return Err(Error::InvalidConfig {
            what: "PULSE_SERVER".into(),
            reason: format!("no PulseAudio socket at {path}"),
        });
    }

    let sandbox_socket = format!("{}/pulse/native", spec.runtime_dir);
    spec.bind(host_socket, &sandbox_socket, false)?;
    spec.setenv("PULSE_SERVER", &format!("unix:{sandbox_socket}"));

    if let Some(cookie_path) = cookie_path {
        if let Ok(cookie) = std::fs::read(cookie_path) {
            let dest = format!("{SANDBOX_HOME}/.config/pulse/cookie");
            spec.file(&dest, cookie);
            spec.setenv("PULSE_COOKIE", &dest);
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

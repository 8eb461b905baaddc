//! Torrc composition for the sandboxed tor instance.
//!
//! Starts from the embedded base template and appends bridge, proxy, and
//! control-password directives according to the launcher configuration.
//! Paths in the template are sandbox-side paths; the torrc itself is
//! injected into the sandbox as a pipe-fed file.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::tor::control;

/// Base torrc template shared by every sandboxed tor.
const TORRC_BASE: &str = include_str!("../../assets/torrc");

/// Sandbox-side path of the pluggable transport proxy.
const TRANSPORT_PLUGIN_PATH: &str = "/home/amnesia/tor/PluggableTransports/obfs4proxy";

// =============================================================================
// Configuration Inputs
// =============================================================================

/// Outbound proxy tor should tunnel through.
#[derive(Debug, Clone)]
pub enum ProxyConfig {
    /// SOCKS 4 proxy, `host:port`.
    Socks4 { addr: String },
    /// SOCKS 5 proxy with optional credentials.
    Socks5 {
        addr: String,
        username: Option<String>,
        password: Option<String>,
    },
    /// HTTP(S) CONNECT proxy with optional credentials.
    Https {
        addr: String,
        username: Option<String>,
        password: Option<String>,
    },
}

/// Bridge selection.
#[derive(Debug, Clone)]
pub enum BridgeConfig {
    /// No bridges; tor may enable its own seccomp sandbox.
    None,
    /// Bridges from the built-in catalog, keyed by transport name.
    Builtin { transport: String },
    /// User-supplied bridge lines, passed through verbatim.
    Custom { lines: Vec<String> },
}

/// Everything torrc composition needs from the caller.
#[derive(Debug, Clone)]
pub struct TorrcConfig {
    pub bridges: BridgeConfig,
    pub proxy: Option<ProxyConfig>,
}

/// A composed torrc plus the plaintext control password that pairs with
/// the hashed one baked into it.
#[derive(Debug)]
pub struct ComposedTorrc {
    pub contents: Vec<u8>,
    pub control_password: String,
}

// =============================================================================
// Bridge Catalog
// =============================================================================

/// The built-in bridge catalog, keyed by transport.
///
/// A pure table; persistence of shuffle order is a UI concern and no such
/// state exists down here, so catalog order is deterministic.
#[must_use]
pub fn builtin_bridges() -> BTreeMap<&'static str, Vec<&'static str>> {
    let mut catalog = BTreeMap::new();
    catalog.insert(
        "obfs4",
        vec![
            "Bridge obfs4 154.35.22.10:41835 8FB9F4319E89E5C6223052AA525A192AFBC85D55 cert=GGGS1TX4R81m3r0HBl79wKy1OtPPNR2CZUIrHjkRg65Vc2VR8fOyo64f9kmT1UAFG7j0HQ iat-mode=0",
            "Bridge obfs4 198.245.60.50:443 752CF7825B3B9EA6A98C83AC41F7099D67007EA5 cert=xpmQtKUqQ/6v5X7ijgYE/f03+l2/EuQ1dexjyUhh16wQlu/cpXUGalmhDIlhuiQPNEKmKw iat-mode=0",
            "Bridge obfs4 192.99.11.54:443 7B126FAB960E5AC6A629C729434FF84FB5074EC2 cert=VW5f8+IBUWpPFxF+rsiVy2wXkyTQG7vEd+rHeN3B3HoxBtYvBj70fdpFmgChDNB67sguCA iat-mode=0",
        ],
    );
    catalog.insert(
        "obfs3",
        vec![
            "Bridge obfs3 109.105.109.165:10527 8DFCD8FB3285E855F5A55EDDA35696C743ABFC4E",
            "Bridge obfs3 109.105.109.147:13764 BBB28DF0F201E706BE564EFE690FE9577DD8386D",
        ],
    );
    catalog.insert(
        "scramblesuit",
        vec![
            "Bridge scramblesuit 216.117.3.62:63174 B9E7141C594AF25699E0079C1F0146F409495296 password=XTCXLG2JAMJKZW2POLBAOWOQETQSMASH",
        ],
    );
    catalog
}

// =============================================================================
// Composition
// =============================================================================

/// Composes a torrc for one sandboxed tor invocation.
///
/// A fresh control password is generated per call; the caller keeps the
/// plaintext for `AUTHENTICATE` and tor gets the hash.
///
/// # Errors
///
/// Unknown builtin transports.
pub fn compose(cfg: &TorrcConfig) -> Result<ComposedTorrc> {
    let mut torrc = String::from(TORRC_BASE);

    match &cfg.bridges {
        BridgeConfig::None => {
            // Tor's own seccomp whitelist only works without managed
            // pluggable transports.
            torrc.push_str("\nSandbox 1\n");
        }
        BridgeConfig::Builtin { transport } => {
            let catalog = builtin_bridges();
            let lines = catalog.get(transport.as_str()).ok_or_else(|| {
                Error::InvalidConfig {
                    what: "bridge transport".into(),
                    reason: format!("no builtin bridges for '{transport}'"),
                }
            })?;
            push_bridge_preamble(&mut torrc);
            for line in lines {
                torrc.push_str(line);
                torrc.push('\n');
            }
        }
        BridgeConfig::Custom { lines } => {
            push_bridge_preamble(&mut torrc);
            for line in lines {
                torrc.push_str(line);
                torrc.push('\n');
            }
        }
    }

    if let Some(proxy) = &cfg.proxy {
        torrc.push('\n');
        match proxy {
            ProxyConfig::Socks4 { addr } => {
                torrc.push_str(&format!("Socks4Proxy {addr}\n"));
            }
            ProxyConfig::Socks5 {
                addr,
                username,
                password,
            } => {
                torrc.push_str(&format!("Socks5Proxy {addr}\n"));
                if let (Some(user), Some(pass)) = (username, password) {
                    torrc.push_str(&format!("Socks5ProxyUsername {user}\n"));
                    torrc.push_str(&format!("Socks5ProxyPassword {pass}\n"));
                }
            }
            ProxyConfig::Https {
                addr,
                username,
                password,
            } => {
                torrc.push_str(&format!("HTTPSProxy {addr}\n"));
                if let (Some(user), Some(pass)) = (username, password) {
                    torrc.push_str(&format!("HTTPSProxyAuthenticator {user}:{pass}\n"));
                }
            }
        }
    }

    let control_password = control::generate_control_password();
    let hashed = control::hash_control_password(&control_password);
    torrc.push_str(&format!("\nHashedControlPassword {hashed}\n"));

    Ok(ComposedTorrc {
        contents: torrc.into_bytes(),
        control_password,
    })
}

fn push_bridge_preamble(torrc: &mut String) {
    torrc.push_str("\nUseBridges 1\n");
    torrc.push_str(&format!(
        "ClientTransportPlugin obfs2,obfs3,obfs4,scramblesuit exec {TRANSPORT_PLUGIN_PATH}\n"
    ));
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn compose_str(cfg: &TorrcConfig) -> (String, String) {
        let composed = compose(cfg).unwrap();
        (
            String::from_utf8(composed.contents).unwrap(),
            composed.control_password,
        )
    }

    #[test]
    fn test_no_bridges_enables_tor_sandbox() {
        let (torrc, _) = compose_str(&TorrcConfig {
            bridges: BridgeConfig::None,
            proxy: None,
        });
        assert!(torrc.contains("\nSandbox 1\n"));
        assert!(!torrc.contains("UseBridges"));
    }

    #[test]
    fn test_builtin_bridges() {
        let (torrc, _) = compose_str(&TorrcConfig {
            bridges: BridgeConfig::Builtin {
                transport: "obfs4".into(),
            },
            proxy: None,
        });
        assert!(torrc.contains("UseBridges 1"));
        assert!(torrc.contains("ClientTransportPlugin"));
        assert!(torrc.contains("Bridge obfs4"));
        assert!(!torrc.contains("Sandbox 1"));
    }

    #[test]
    fn test_unknown_transport_fails() {
        let err = compose(&TorrcConfig {
            bridges: BridgeConfig::Builtin {
                transport: "meek".into(),
            },
            proxy: None,
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_custom_bridges_pass_through() {
        let (torrc, _) = compose_str(&TorrcConfig {
            bridges: BridgeConfig::Custom {
                lines: vec!["Bridge obfs4 127.0.0.1:1 AAAA cert=BBBB iat-mode=0".into()],
            },
            proxy: None,
        });
        assert!(torrc.contains("Bridge obfs4 127.0.0.1:1"));
    }

    #[test]
    fn test_socks5_proxy_with_auth() {
        let (torrc, _) = compose_str(&TorrcConfig {
            bridges: BridgeConfig::None,
            proxy: Some(ProxyConfig::Socks5 {
                addr: "10.0.0.1:1080".into(),
                username: Some("u".into()),
                password: Some("p".into()),
            }),
        });
        assert!(torrc.contains("Socks5Proxy 10.0.0.1:1080"));
        assert!(torrc.contains("Socks5ProxyUsername u"));
        assert!(torrc.contains("Socks5ProxyPassword p"));
    }

    #[test]
    fn test_https_proxy_authenticator() {
        let (torrc, _) = compose_str(&TorrcConfig {
            bridges: BridgeConfig::None,
            proxy: Some(ProxyConfig::Https {
                addr: "10.0.0.1:8080".into(),
                username: Some("u".into()),
                password: Some("p".into()),
            }),
        });
        assert!(torrc.contains("HTTPSProxy 10.0.0.1:8080"));
        assert!(torrc.contains("HTTPSProxyAuthenticator u:p"));
    }

    #[test]
    fn test_fresh_password_per_composition() {
        let cfg = TorrcConfig {
            bridges: BridgeConfig::None,
            proxy: None,
        };
        let (torrc_a, pw_a) = compose_str(&cfg);
        let (_, pw_b) = compose_str(&cfg);
        assert_ne!(pw_a, pw_b);
        assert!(torrc_a.contains("HashedControlPassword 16:"));
    }
}

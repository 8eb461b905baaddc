//! # orbox
//!
//! **Sandboxed Tor Browser launcher core**
//!
//! This crate is the sandboxing and tor-mediation core of a Linux-only
//! launcher that installs, updates, and runs a Tor-integrated browser
//! inside a user-namespace sandbox. It drives an external unprivileged
//! sandbox helper (bubblewrap) over its fd protocol, compiles declarative
//! seccomp policies to BPF, interposes two AF_LOCAL surrogates between the
//! browser and the real tor, and applies signed MAR updates fetched over
//! tor.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              orbox                                   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌───────────────┐   ┌─────────────────────────┐  │
//! │  │  SandboxSpec │──▶│    Helper     │──▶│  bubblewrap (external)  │  │
//! │  │  mounts/env/ │   │ fd 3: argv    │   │  namespaces + mounts    │  │
//! │  │  files/ns    │   │ fd 4…: files  │   │  + seccomp(BPF)         │  │
//! │  └──────────────┘   │ last: seccomp │   └───────────┬─────────────┘  │
//! │         ▲           └───────────────┘               │                │
//! │         │                   ▲              ┌────────▼─────────┐      │
//! │  ┌──────┴───────┐   ┌───────┴───────┐      │ browser ─┬─ tor  │      │
//! │  │ UpdatePipeline│  │SeccompProgram │      └──────────┼───────┘      │
//! │  │ check/fetch/  │  │ rules → BPF   │                 │ AF_LOCAL     │
//! │  │ verify/apply  │  └───────────────┘      ┌──────────▼─────────┐    │
//! │  └──────┬────────┘                         │ SocksSurrogate     │    │
//! │         │ HTTPS over tor, pinned           │ CtrlSurrogate      │    │
//! │         ▼                                  └──────────┬─────────┘    │
//! │  ┌───────────────┐                                    │              │
//! │  │     Tor       │◀───────────────────────────────────┘              │
//! │  │ attach/spawn  │  control port, bootstrap, dialers                 │
//! │  └───────────────┘                                                   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Behaviors
//!
//! - **Helper protocol**: directives stream NUL-separated over fd 3,
//!   injected file bodies over fds 4…, the compiled seccomp program over
//!   the last fd, written strictly in that order. Helpers older than
//!   0.1.3 are refused.
//! - **Stream isolation**: the SOCKS surrogate appends a random isolation
//!   tag to every forwarded password; `SIGNAL NEWNYM` on the control
//!   surrogate rotates the tag atomically.
//! - **Synthetic control port**: the browser sees a fixed tor version and
//!   SOCKS address and a three-command post-auth surface; everything else
//!   is refused without ever touching the real control port.
//! - **Update safety**: downgrades are rejected before any download,
//!   the MAR must match its SHA-512 and signature, and the manifest is
//!   committed only after the sandboxed updater reports `succeeded`.
//!
//! # Example
//!
//! ```rust,ignore
//! use orbox::config::{LauncherEnv, RuntimeLock};
//! use orbox::launch::{run_browser, BrowserLaunchConfig};
//! use orbox::progress::{CancelToken, Progress};
//! use orbox::sandbox::Helper;
//! use orbox::tor::{torrc, Tor, TorLaunchConfig};
//!
//! #[tokio::main]
//! async fn main() -> orbox::Result<()> {
//!     let env = LauncherEnv::from_env()?;
//!     let _lock = RuntimeLock::acquire(&env.runtime_dir)?;
//!     let helper = Helper::find().await?;
//!
//!     let composed = torrc::compose(&torrc_config)?;
//!     let (progress, _rx) = Progress::channel();
//!     let (_guard, mut cancel) = CancelToken::new();
//!     let tor = Tor::spawn_sandboxed(
//!         &helper, &tor_launch, composed, &env.runtime_dir, &progress, &mut cancel,
//!     )
//!     .await?;
//!
//!     let mut child = run_browser(&helper, &env, &browser_cfg, &tor).await?;
//!     child.wait().await?;
//!     Ok(())
//! }
//! ```

// =============================================================================
// Modules
// =============================================================================

mod constants;
mod error;

pub mod config;
pub mod launch;
pub mod manifest;
pub mod progress;
pub mod sandbox;
pub mod seccomp;
pub mod socks;
pub mod tor;
pub mod update;

pub use error::{Error, Result};

//! Sandbox construction and launch.
//!
//! A [`SandboxSpec`] describes one child invocation; a [`Helper`] drives
//! the external unprivileged sandbox helper to realize it. The helper does
//! the actual namespace and mount work; this module's job is to speak its
//! fd-based protocol exactly.

mod runner;
mod spec;
pub mod x11;

pub use runner::{Helper, SandboxedChild};
pub use spec::{SandboxSpec, SeccompEmitter, UnshareOpts};

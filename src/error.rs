//! Error types for the launcher core.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for launcher core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the launcher core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),

    /// The host OS or architecture is not supported.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Malformed user-supplied input.
    #[error("invalid configuration '{what}': {reason}")]
    InvalidConfig { what: String, reason: String },

    // =========================================================================
    // Sandbox Setup Errors
    // =========================================================================
    /// The sandbox helper binary could not be located.
    #[error("sandbox helper not found (searched {0:?})")]
    HelperNotFound(Vec<PathBuf>),

    /// The sandbox helper is older than the required minimum.
    #[error("sandbox helper {found} is older than required {required}")]
    HelperTooOld { found: String, required: String },

    /// A required bind mount source does not exist on the host.
    #[error("bind source does not exist: {0}")]
    BindSourceMissing(PathBuf),

    /// Launching the sandboxed child failed.
    #[error("failed to launch sandboxed child '{child}': {reason}")]
    LaunchFailed { child: String, reason: String },

    /// The sandbox spec is internally inconsistent.
    #[error("invalid sandbox spec: {0}")]
    InvalidSpec(String),

    // =========================================================================
    // Seccomp Policy Errors
    // =========================================================================
    /// A rule file line failed to parse.
    #[error("seccomp rule syntax error at line {line}: {reason}")]
    PolicySyntax { line: usize, reason: String },

    /// A condition references an undefined constant.
    #[error("seccomp rule references unknown constant '{0}'")]
    UnknownConstant(String),

    /// The compiled BPF program exceeds the kernel's size limit.
    #[error("BPF program too large: {len} instructions (limit {limit})")]
    ProgramTooLarge { len: usize, limit: usize },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// A SOCKS or control-port peer violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The update metadata did not conform to the expected schema.
    #[error("update metadata error: {0}")]
    UpdateMetadata(String),

    /// A downloaded artifact failed its hash check.
    #[error("hash mismatch for {what}")]
    HashMismatch { what: String },

    /// A downloaded artifact failed signature verification.
    #[error("signature verification failed: {0}")]
    BadSignature(String),

    // =========================================================================
    // Network Errors
    // =========================================================================
    /// Dialing a remote endpoint failed.
    #[error("failed to dial {addr}: {reason}")]
    DialFailed { addr: String, reason: String },

    /// An HTTPS request returned a non-200 status.
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// The server attempted to redirect the request.
    #[error("refusing to follow redirect to {0}")]
    RedirectRefused(String),

    /// The peer's certificate chain did not match the static pins.
    #[error("certificate pin mismatch for {host}")]
    PinMismatch { host: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The operation was canceled by the user.
    #[error("operation canceled")]
    Canceled,

    /// A control-port operation was attempted without a live connection.
    #[error("tor is not running")]
    TorNotRunning,

    /// An operation exceeded its deadline.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// True if this error was caused by explicit cancellation.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

//! SOCKS surrogate.
//!
//! An AF_LOCAL SOCKS5 server bound inside the launcher's runtime
//! directory and bind-mounted into the browser sandbox. Every accepted
//! request has the current isolation tag appended to its password before
//! being redispatched to the real tor SOCKS endpoint, so the browser's
//! per-request circuit isolation keeps working without the browser ever
//! seeing tor itself.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use rand::RngCore;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::constants::{ISOLATION_TAG_PREFIX, MAX_SOCKS_PASSWD_LEN, SOCKS_SOCKET};
use crate::error::{Error, Result};
use crate::socks::{self, Endpoint, Reply};

// =============================================================================
// Isolation Tag
// =============================================================================

/// The shared per-launch isolation tag.
///
/// Handshakes read it, `SIGNAL NEWNYM` rotates it. Readers and the writer
/// synchronize on a reader-writer lock so a rotation is observed atomically:
/// a handshake sees either the whole old tag or the whole new one.
#[derive(Debug, Clone)]
pub struct IsolationTag(Arc<RwLock<String>>);

impl IsolationTag {
    /// Creates a tag with fresh randomness.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(Self::generate())))
    }

    fn generate() -> String {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        format!("{ISOLATION_TAG_PREFIX}{}", hex::encode(raw))
    }

    /// Current tag value.
    #[must_use]
    pub fn get(&self) -> String {
        // A poisoned lock still holds a whole tag; use it.
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Atomically replaces the tag with fresh randomness.
    pub fn rotate(&self) {
        let fresh = Self::generate();
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = fresh;
    }
}

impl Default for IsolationTag {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Surrogate
// =============================================================================

/// The running SOCKS surrogate.
///
/// Owned by the supervisor; per-connection tasks are detached and live
/// only as long as their sockets.
#[derive(Debug)]
pub struct SocksSurrogate {
    path: PathBuf,
    tag: IsolationTag,
    accept_task: JoinHandle<()>,
}

impl SocksSurrogate {
    /// Binds the surrogate socket in `runtime_dir` and starts accepting.
    ///
    /// # Errors
    ///
    /// Socket binding failures.
    pub fn launch(runtime_dir: &Path, upstream: Endpoint, tag: IsolationTag) -> Result<Self> {
        let path = runtime_dir.join(SOCKS_SOCKET);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        debug!(path = %path.display(), "SOCKS surrogate listening");

        let accept_tag = tag.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((conn, _)) => {
                        let tag = accept_tag.clone();
                        let upstream = upstream.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_conn(conn, &upstream, &tag).await {
                                debug!(error = %e, "SOCKS connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept SOCKS connection");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            path,
            tag,
            accept_task,
        })
    }

    /// Path of the surrogate's AF_LOCAL socket.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Rotates the isolation tag; all subsequent handshakes use the new
    /// value.
    pub fn rotate_tag(&self) {
        self.tag.rotate();
    }

    /// Stops accepting and removes the socket. In-flight connections are
    /// left to drain on their own.
    pub fn close(&self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for SocksSurrogate {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Per-Connection Handling
// =============================================================================

async fn handle_conn(
    mut conn: UnixStream,
    upstream: &Endpoint,
    tag: &IsolationTag,
) -> Result<()> {
    let mut req = socks::handshake(&mut conn).await?;

    if req.cmd != socks::CMD_CONNECT {
        socks::send_reply(&mut conn, Reply::CommandNotSupported).await?;
        return Err(Error::Protocol(format!("unsupported command {}", req.cmd)));
    }

    // An empty username means the client never opted into isolation;
    // refuse rather than hand it a shared circuit.
    if req.auth.uname.is_empty() {
        socks::send_reply(&mut conn, Reply::GeneralFailure).await?;
        return Err(Error::Protocol("request without username".into()));
    }

    if let Err(e) = rewrite_auth(&mut req.auth, &tag.get()) {
        socks::send_reply(&mut conn, Reply::GeneralFailure).await?;
        return Err(e);
    }

    // Redispatch upstream with the rewritten credentials.
    let mut up = match socks::connect(upstream, &req.addr, Some(&req.auth)).await {
        Ok(up) => up,
        Err(e) => {
            socks::send_reply(&mut conn, Reply::from_error(&e)).await?;
            return Err(e);
        }
    };

    socks::send_reply(&mut conn, Reply::Succeeded).await?;

    // Shuttle bytes until either side closes; both sides are torn down on
    // any error by falling out of scope.
    let _ = tokio::io::copy_bidirectional(&mut conn, &mut up).await;
    Ok(())
}

/// Appends `":" tag` to the password, enforcing the RFC 1929 length cap.
fn rewrite_auth(auth: &mut socks::AuthInfo, tag: &str) -> Result<()> {
    auth.passwd.push(b':');
    auth.passwd.extend_from_slice(tag.as_bytes());
    if auth.passwd.len() > MAX_SOCKS_PASSWD_LEN {
        return Err(Error::Protocol(
            "password too long after isolation tag".into(),
        ));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

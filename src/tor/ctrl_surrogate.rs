//! Control-port surrogate.
//!
//! A synthetic Tor control protocol server that tells the browser exactly
//! the lies it needs to hear. Only a filtered subset of the protocol is
//! exposed: the browser can authenticate, discover a (fake) SOCKS
//! listener, and request NEWNYM. Nothing it says ever reaches the real
//! control port except an optional NEWNYM forward.
//!
//! Per-connection state machine: PreAuth → PostAuth → closed.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::constants::{CONTROL_SOCKET, SURROGATE_SOCKS_ADDR, SURROGATE_TOR_VERSION};
use crate::error::{Error, Result};
use crate::tor::socks_surrogate::IsolationTag;

const CMD_PROTOCOLINFO: &str = "PROTOCOLINFO";
const CMD_AUTHENTICATE: &str = "AUTHENTICATE";
const CMD_AUTHCHALLENGE: &str = "AUTHCHALLENGE";
const CMD_QUIT: &str = "QUIT";
const CMD_GETINFO: &str = "GETINFO";
const CMD_SIGNAL: &str = "SIGNAL";

const RESPONSE_OK: &str = "250 OK\r\n";
const ERR_AUTHENTICATION_REQUIRED: &str = "514 Authentication required\r\n";
const ERR_UNRECOGNIZED_COMMAND: &str = "510 Unrecognized command\r\n";
const ERR_UNSPECIFIED_TOR: &str = "550 Unspecified Tor error\r\n";

// =============================================================================
// Surrogate
// =============================================================================

/// The running control-port surrogate.
#[derive(Debug)]
pub struct CtrlSurrogate {
    path: PathBuf,
    accept_task: JoinHandle<()>,
}

impl CtrlSurrogate {
    /// Binds the surrogate socket in `runtime_dir` and starts accepting.
    ///
    /// `newnym_tx`, when present, forwards every accepted NEWNYM to the
    /// supervisor so it can relay the signal to the real tor. When absent
    /// the tag rotation alone provides the new identity.
    ///
    /// # Errors
    ///
    /// Socket binding failures.
    pub fn launch(
        runtime_dir: &Path,
        tag: IsolationTag,
        newnym_tx: Option<mpsc::Sender<()>>,
    ) -> Result<Self> {
        let path = runtime_dir.join(CONTROL_SOCKET);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        debug!(path = %path.display(), "control surrogate listening");

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((conn, _)) => {
                        let tag = tag.clone();
                        let newnym_tx = newnym_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_conn(conn, tag, newnym_tx).await {
                                debug!(error = %e, "control connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept control connection");
                        return;
                    }
                }
            }
        });

        Ok(Self { path, accept_task })
    }

    /// Path of the surrogate's AF_LOCAL socket.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting and removes the socket.
    pub fn close(&self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for CtrlSurrogate {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Per-Connection State Machine
// =============================================================================

struct CtrlConn {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: OwnedWriteHalf,
    tag: IsolationTag,
    newnym_tx: Option<mpsc::Sender<()>>,
}

async fn handle_conn(
    conn: UnixStream,
    tag: IsolationTag,
    newnym_tx: Option<mpsc::Sender<()>>,
) -> Result<()> {
    let (read_half, writer) = conn.into_split();
    let mut c = CtrlConn {
        reader: BufReader::new(read_half),
        writer,
        tag,
        newnym_tx,
    };
    c.process_pre_auth().await?;
    c.process_post_auth().await
}

impl CtrlConn {
    /// Reads one CRLF-terminated command line. Commands are
    /// case-insensitive; arguments keep their case.
    async fn read_line(&mut self) -> Result<(String, Vec<String>)> {
        let mut raw = String::new();
        let n = self.reader.read_line(&mut raw).await?;
        if n == 0 {
            return Err(Error::Protocol("control connection closed".into()));
        }
        let split: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
        let cmd = split
            .first()
            .map(|s| s.to_uppercase())
            .unwrap_or_default();
        Ok((cmd, split))
    }

    async fn write(&mut self, s: &str) -> Result<()> {
        self.writer.write_all(s.as_bytes()).await?;
        Ok(())
    }

    /// PreAuth accepts PROTOCOLINFO (once), AUTHENTICATE, AUTHCHALLENGE
    /// (refused), and QUIT. Anything else ends the connection with 514.
    async fn process_pre_auth(&mut self) -> Result<()> {
        let mut sent_protocolinfo = false;
        loop {
            let (cmd, split) = self.read_line().await?;
            match cmd.as_str() {
                CMD_PROTOCOLINFO => {
                    if sent_protocolinfo {
                        self.write(ERR_AUTHENTICATION_REQUIRED).await?;
                        return Err(Error::Protocol(
                            "client sent PROTOCOLINFO twice".into(),
                        ));
                    }
                    sent_protocolinfo = true;
                    self.on_protocolinfo(&split).await?;
                }
                CMD_AUTHENTICATE => {
                    // Credentials are accepted blindly; the real
                    // authentication happened when the browser was allowed
                    // to reach this socket at all.
                    self.write(RESPONSE_OK).await?;
                    return Ok(());
                }
                CMD_AUTHCHALLENGE => {
                    // PROTOCOLINFO lies about the supported auth methods,
                    // so a client doing this is off-script.
                    self.write(ERR_UNRECOGNIZED_COMMAND).await?;
                    return Err(Error::Protocol(
                        "client sent AUTHCHALLENGE, not supported".into(),
                    ));
                }
                CMD_QUIT => {
                    return Err(Error::Protocol("client requested close".into()));
                }
                _ => {
                    self.write(ERR_AUTHENTICATION_REQUIRED).await?;
                    return Err(Error::Protocol(format!(
                        "invalid pre-auth command '{cmd}'"
                    )));
                }
            }
        }
    }

    /// PostAuth accepts PROTOCOLINFO, GETINFO, and SIGNAL; everything else
    /// gets 510 and the connection stays open.
    async fn process_post_auth(&mut self) -> Result<()> {
        loop {
            let (cmd, split) = self.read_line().await?;
            match cmd.as_str() {
                CMD_PROTOCOLINFO => self.on_protocolinfo(&split).await?,
                CMD_GETINFO => self.on_getinfo(&split).await?,
                CMD_SIGNAL => self.on_signal(&split).await?,
                _ => self.write(ERR_UNRECOGNIZED_COMMAND).await?,
            }
        }
    }

    async fn on_protocolinfo(&mut self, split: &[String]) -> Result<()> {
        for version in &split[1..] {
            if version.parse::<i32>().is_err() {
                let resp = format!("513 No such version \"{version}\"\r\n");
                return self.write(&resp).await;
            }
        }
        let resp = format!(
            "250-PROTOCOLINFO 1\r\n\
             250-AUTH METHODS=NULL,HASHEDPASSWORD\r\n\
             250-VERSION Tor=\"{SURROGATE_TOR_VERSION}\"\r\n\
             {RESPONSE_OK}"
        );
        self.write(&resp).await
    }

    async fn on_getinfo(&mut self, split: &[String]) -> Result<()> {
        const ARG_SOCKS_LISTENERS: &str = "net/listeners/socks";
        if split.len() != 2 {
            return self.arg_count_error(CMD_GETINFO, 2, split.len()).await;
        }
        if split[1] != ARG_SOCKS_LISTENERS {
            let resp = format!("552 Unrecognized key \"{}\"\r\n", split[1]);
            return self.write(&resp).await;
        }
        let resp =
            format!("250-{ARG_SOCKS_LISTENERS}=\"{SURROGATE_SOCKS_ADDR}\"\r\n{RESPONSE_OK}");
        self.write(&resp).await
    }

    async fn on_signal(&mut self, split: &[String]) -> Result<()> {
        const ARG_NEWNYM: &str = "NEWNYM";
        if split.len() != 2 {
            return self.arg_count_error(CMD_SIGNAL, 2, split.len()).await;
        }
        if split[1] != ARG_NEWNYM {
            let resp = format!("552 Unrecognized signal code \"{}\"\r\n", split[1]);
            return self.write(&resp).await;
        }

        // Rotating the isolation tag forces fresh circuits for every
        // subsequent request on its own; the forward is for tors that
        // still want the hint.
        self.tag.rotate();
        if let Some(tx) = &self.newnym_tx {
            if tx.send(()).await.is_err() {
                return self.write(ERR_UNSPECIFIED_TOR).await;
            }
        }
        self.write(RESPONSE_OK).await
    }

    async fn arg_count_error(&mut self, cmd: &str, expected: usize, actual: usize) -> Result<()> {
        let resp = if expected > actual {
            format!("512 Missing argument to {cmd}\r\n")
        } else {
            format!("512 Too many arguments to {cmd}\r\n")
        };
        self.write(&resp).await
    }
}

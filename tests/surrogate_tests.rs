//! Tests for the control-port surrogate.
//!
//! Drives the synthetic control dialog over real AF_LOCAL sockets and
//! checks the PreAuth/PostAuth command surfaces, the fixed replies, and
//! the NEWNYM-driven tag rotation.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use orbox::tor::{CtrlSurrogate, IsolationTag};

const PROTOCOLINFO_REPLY: &str = "250-PROTOCOLINFO 1\r\n\
     250-AUTH METHODS=NULL,HASHEDPASSWORD\r\n\
     250-VERSION Tor=\"0.2.8.7\"\r\n\
     250 OK\r\n";

struct TestConn {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestConn {
    async fn connect(surrogate: &CtrlSurrogate) -> Self {
        let conn = UnixStream::connect(surrogate.socket_path())
            .await
            .expect("surrogate must accept");
        let (r, writer) = conn.into_split();
        Self {
            reader: BufReader::new(r),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    /// Reads until (and including) a final `NNN ` line.
    async fn read_reply(&mut self) -> String {
        let mut out = String::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed mid-reply");
            out.push_str(&line);
            if line.len() >= 4 && &line[3..4] == " " {
                return out;
            }
        }
    }

    /// True once the server has closed the connection.
    async fn at_eof(&mut self) -> bool {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap() == 0
    }

    async fn authenticate(&mut self) {
        self.send("AUTHENTICATE").await;
        assert_eq!(self.read_reply().await, "250 OK\r\n");
    }
}

fn launch(tag: &IsolationTag) -> (tempfile::TempDir, CtrlSurrogate) {
    let dir = tempfile::tempdir().unwrap();
    let surrogate = CtrlSurrogate::launch(dir.path(), tag.clone(), None).unwrap();
    (dir, surrogate)
}

// =============================================================================
// PreAuth
// =============================================================================

#[tokio::test]
async fn test_protocolinfo_then_authenticate() {
    let tag = IsolationTag::new();
    let (_dir, surrogate) = launch(&tag);
    let mut conn = TestConn::connect(&surrogate).await;

    conn.send("PROTOCOLINFO 1").await;
    assert_eq!(conn.read_reply().await, PROTOCOLINFO_REPLY);

    conn.send("AUTHENTICATE").await;
    assert_eq!(conn.read_reply().await, "250 OK\r\n");
}

#[tokio::test]
async fn test_second_protocolinfo_closes_with_514() {
    let tag = IsolationTag::new();
    let (_dir, surrogate) = launch(&tag);
    let mut conn = TestConn::connect(&surrogate).await;

    conn.send("PROTOCOLINFO").await;
    conn.read_reply().await;
    conn.send("PROTOCOLINFO").await;
    assert_eq!(conn.read_reply().await, "514 Authentication required\r\n");
    assert!(conn.at_eof().await);
}

#[tokio::test]
async fn test_authchallenge_rejected_with_510() {
    let tag = IsolationTag::new();
    let (_dir, surrogate) = launch(&tag);
    let mut conn = TestConn::connect(&surrogate).await;

    conn.send("AUTHCHALLENGE SAFECOOKIE 00").await;
    assert_eq!(conn.read_reply().await, "510 Unrecognized command\r\n");
    assert!(conn.at_eof().await);
}

#[tokio::test]
async fn test_preauth_rejects_everything_else() {
    let tag = IsolationTag::new();
    let (_dir, surrogate) = launch(&tag);
    let mut conn = TestConn::connect(&surrogate).await;

    conn.send("GETINFO net/listeners/socks").await;
    assert_eq!(conn.read_reply().await, "514 Authentication required\r\n");
    assert!(conn.at_eof().await);
}

#[tokio::test]
async fn test_quit_closes_without_reply() {
    let tag = IsolationTag::new();
    let (_dir, surrogate) = launch(&tag);
    let mut conn = TestConn::connect(&surrogate).await;

    conn.send("QUIT").await;
    assert!(conn.at_eof().await);
}

#[tokio::test]
async fn test_commands_are_case_insensitive() {
    let tag = IsolationTag::new();
    let (_dir, surrogate) = launch(&tag);
    let mut conn = TestConn::connect(&surrogate).await;

    conn.send("protocolinfo 1").await;
    assert_eq!(conn.read_reply().await, PROTOCOLINFO_REPLY);
    conn.send("authenticate").await;
    assert_eq!(conn.read_reply().await, "250 OK\r\n");
}

// =============================================================================
// PostAuth
// =============================================================================

#[tokio::test]
async fn test_getinfo_socks_listeners() {
    let tag = IsolationTag::new();
    let (_dir, surrogate) = launch(&tag);
    let mut conn = TestConn::connect(&surrogate).await;
    conn.authenticate().await;

    conn.send("GETINFO net/listeners/socks").await;
    assert_eq!(
        conn.read_reply().await,
        "250-net/listeners/socks=\"127.0.0.1:9150\"\r\n250 OK\r\n"
    );
}

#[tokio::test]
async fn test_getinfo_other_keys_rejected() {
    let tag = IsolationTag::new();
    let (_dir, surrogate) = launch(&tag);
    let mut conn = TestConn::connect(&surrogate).await;
    conn.authenticate().await;

    conn.send("GETINFO version").await;
    assert_eq!(
        conn.read_reply().await,
        "552 Unrecognized key \"version\"\r\n"
    );

    conn.send("GETINFO").await;
    assert_eq!(conn.read_reply().await, "512 Missing argument to GETINFO\r\n");

    conn.send("GETINFO a b").await;
    assert_eq!(
        conn.read_reply().await,
        "512 Too many arguments to GETINFO\r\n"
    );
}

#[tokio::test]
async fn test_signal_newnym_rotates_tag() {
    let tag = IsolationTag::new();
    let (_dir, surrogate) = launch(&tag);
    let mut conn = TestConn::connect(&surrogate).await;
    conn.authenticate().await;

    let before = tag.get();
    conn.send("SIGNAL NEWNYM").await;
    assert_eq!(conn.read_reply().await, "250 OK\r\n");
    let after = tag.get();

    assert_ne!(before, after, "NEWNYM must rotate the tag");
    for value in [&before, &after] {
        let hex_part = value
            .strip_prefix("sandboxed-tor-browser:")
            .expect("tag prefix");
        assert_eq!(hex_part.len(), 32);
        assert!(hex_part
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
    }
}

#[tokio::test]
async fn test_signal_other_codes_rejected() {
    let tag = IsolationTag::new();
    let (_dir, surrogate) = launch(&tag);
    let mut conn = TestConn::connect(&surrogate).await;
    conn.authenticate().await;

    conn.send("SIGNAL HUP").await;
    assert_eq!(
        conn.read_reply().await,
        "552 Unrecognized signal code \"HUP\"\r\n"
    );
}

#[tokio::test]
async fn test_postauth_unknown_commands_get_510_and_stay_open() {
    let tag = IsolationTag::new();
    let (_dir, surrogate) = launch(&tag);
    let mut conn = TestConn::connect(&surrogate).await;
    conn.authenticate().await;

    for cmd in ["SETCONF foo=1", "SETEVENTS STATUS_CLIENT", "TAKEOWNERSHIP"] {
        conn.send(cmd).await;
        assert_eq!(conn.read_reply().await, "510 Unrecognized command\r\n");
    }

    // Still serviceable afterwards.
    conn.send("GETINFO net/listeners/socks").await;
    assert!(conn.read_reply().await.starts_with("250-"));
}

//! Tests for the SOCKS surrogate.
//!
//! Stands up a fake upstream SOCKS server on an AF_LOCAL socket, points
//! the surrogate at it, and checks isolation-tag rewriting, rotation
//! visibility, rejection policy, and the relay path.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use orbox::socks::{self, Address, AuthInfo, Endpoint, Reply};
use orbox::tor::{IsolationTag, SocksSurrogate};

/// A fake tor SOCKS endpoint: accepts handshakes, reports the credentials
/// it observed, then echoes payload bytes.
fn spawn_upstream(path: &Path) -> mpsc::UnboundedReceiver<AuthInfo> {
    let listener = UnixListener::bind(path).expect("bind upstream");
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let req = socks::handshake(&mut conn).await?;
                let _ = tx.send(req.auth);
                socks::send_reply(&mut conn, Reply::Succeeded).await?;

                // Echo payload until the peer hangs up.
                let mut buf = [0u8; 4096];
                loop {
                    let n = conn.read(&mut buf).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    conn.write_all(&buf[..n]).await?;
                }
                #[allow(unreachable_code)]
                Ok::<(), orbox::Error>(())
            });
        }
    });
    rx
}

struct Fixture {
    _dir: tempfile::TempDir,
    surrogate: SocksSurrogate,
    tag: IsolationTag,
    upstream_auth: mpsc::UnboundedReceiver<AuthInfo>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let upstream_path = dir.path().join("upstream");
    let upstream_auth = spawn_upstream(&upstream_path);

    let tag = IsolationTag::new();
    let surrogate = SocksSurrogate::launch(
        dir.path(),
        Endpoint::Unix(upstream_path),
        tag.clone(),
    )
    .unwrap();

    Fixture {
        _dir: dir,
        surrogate,
        tag,
        upstream_auth,
    }
}

fn surrogate_endpoint(f: &Fixture) -> Endpoint {
    Endpoint::Unix(f.surrogate.socket_path().to_path_buf())
}

fn auth(uname: &[u8], passwd: &[u8]) -> AuthInfo {
    AuthInfo {
        uname: uname.to_vec(),
        passwd: passwd.to_vec(),
    }
}

// =============================================================================
// Tag Rewriting
// =============================================================================

#[tokio::test]
async fn test_redispatch_appends_isolation_tag() {
    let mut f = fixture();
    let addr = Address::Domain("example.com".into(), 443);

    let _conn = socks::connect(&surrogate_endpoint(&f), &addr, Some(&auth(b"u", b"p")))
        .await
        .expect("surrogate must redispatch");

    let observed = f.upstream_auth.recv().await.unwrap();
    assert_eq!(observed.uname, b"u");
    let expected = format!("p:{}", f.tag.get());
    assert_eq!(observed.passwd, expected.as_bytes());
}

#[tokio::test]
async fn test_rotation_is_visible_to_subsequent_handshakes() {
    let mut f = fixture();
    let addr = Address::Domain("example.com".into(), 443);
    let endpoint = surrogate_endpoint(&f);

    let _a = socks::connect(&endpoint, &addr, Some(&auth(b"u", b"p")))
        .await
        .unwrap();
    let first = f.upstream_auth.recv().await.unwrap();

    f.surrogate.rotate_tag();

    let _b = socks::connect(&endpoint, &addr, Some(&auth(b"u", b"p")))
        .await
        .unwrap();
    let second = f.upstream_auth.recv().await.unwrap();

    assert_ne!(first.passwd, second.passwd);
    for observed in [&first, &second] {
        let passwd = String::from_utf8(observed.passwd.clone()).unwrap();
        let (_, tag) = passwd.split_once(':').unwrap();
        let hex_part = tag.strip_prefix("sandboxed-tor-browser:").unwrap();
        assert_eq!(hex_part.len(), 32);
        assert!(hex_part.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}

#[tokio::test]
async fn test_password_length_boundary() {
    let f = fixture();
    let addr = Address::Domain("example.com".into(), 443);
    let endpoint = surrogate_endpoint(&f);

    // prefix ":" + tag pushes the password to exactly 255 bytes: fine.
    let tag_overhead = 1 + f.tag.get().len();
    let at_limit = vec![b'x'; 255 - tag_overhead];
    socks::connect(&endpoint, &addr, Some(&auth(b"u", &at_limit)))
        .await
        .expect("255-byte rewritten password must pass");

    // One byte more overflows the RFC 1929 field: rejected.
    let over_limit = vec![b'x'; 256 - tag_overhead];
    let err = socks::connect(&endpoint, &addr, Some(&auth(b"u", &over_limit)))
        .await
        .unwrap_err();
    assert!(matches!(err, orbox::Error::Protocol(_)));
}

// =============================================================================
// Rejection Policy
// =============================================================================

#[tokio::test]
async fn test_empty_username_rejected_without_upstream_dial() {
    let mut f = fixture();
    let addr = Address::Domain("example.com".into(), 443);

    // No credentials at all: the client never opted into isolation.
    let err = socks::connect(&surrogate_endpoint(&f), &addr, None)
        .await
        .unwrap_err();
    assert!(matches!(err, orbox::Error::Protocol(msg) if msg.contains("reply code 1")));

    // The upstream never saw a connection.
    assert!(f.upstream_auth.try_recv().is_err());
}

#[tokio::test]
async fn test_non_connect_commands_rejected() {
    let f = fixture();

    let mut conn = UnixStream::connect(f.surrogate.socket_path()).await.unwrap();

    // Greeting and auth.
    conn.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut resp = [0u8; 2];
    conn.read_exact(&mut resp).await.unwrap();
    conn.write_all(&[0x01, 0x01, b'u', 0x01, b'p']).await.unwrap();
    conn.read_exact(&mut resp).await.unwrap();

    // BIND request.
    conn.write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x07, "command not supported");
}

// =============================================================================
// Relay
// =============================================================================

#[tokio::test]
async fn test_bytes_relay_in_order() {
    let f = fixture();
    let addr = Address::Domain("example.com".into(), 443);

    let mut conn = socks::connect(&surrogate_endpoint(&f), &addr, Some(&auth(b"u", b"p")))
        .await
        .unwrap();

    for chunk in [&b"hello"[..], b" ", b"world"] {
        conn.write_all(chunk).await.unwrap();
    }
    let mut echoed = vec![0u8; 11];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"hello world");
}

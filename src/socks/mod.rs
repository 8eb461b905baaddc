//! SOCKS5 wire protocol, RFC 1928 with RFC 1929 username/password
//! authentication.
//!
//! Both halves live here: the server-side handshake the surrogate speaks
//! with the browser, and the client side used to redispatch accepted
//! requests to the real tor SOCKS endpoint. Only `CONNECT` is supported.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use crate::error::{Error, Result};

/// Protocol version byte.
const SOCKS_VERSION: u8 = 0x05;

/// RFC 1929 subnegotiation version byte.
const AUTH_VERSION: u8 = 0x01;

const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

/// The one request command the surrogate honors.
pub const CMD_CONNECT: u8 = 0x01;

// =============================================================================
// Reply Codes
// =============================================================================

/// RFC 1928 reply field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressNotSupported,
}

impl Reply {
    fn code(self) -> u8 {
        match self {
            Self::Succeeded => 0x00,
            Self::GeneralFailure => 0x01,
            Self::ConnectionNotAllowed => 0x02,
            Self::NetworkUnreachable => 0x03,
            Self::HostUnreachable => 0x04,
            Self::ConnectionRefused => 0x05,
            Self::TtlExpired => 0x06,
            Self::CommandNotSupported => 0x07,
            Self::AddressNotSupported => 0x08,
        }
    }

    /// Maps an upstream dial/handshake error onto the reply sent downstream.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
                std::io::ErrorKind::TimedOut => Self::TtlExpired,
                _ => Self::GeneralFailure,
            },
            Error::DialFailed { .. } => Self::HostUnreachable,
            Error::Protocol(_) => Self::GeneralFailure,
            _ => Self::GeneralFailure,
        }
    }
}

// =============================================================================
// Addresses and Auth
// =============================================================================

/// RFC 1929 username/password pair, as raw bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthInfo {
    pub uname: Vec<u8>,
    pub passwd: Vec<u8>,
}

/// A SOCKS destination address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(ip, port) => write!(f, "{ip}:{port}"),
            Self::V6(ip, port) => write!(f, "[{ip}]:{port}"),
            Self::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// A fully parsed client request, ready for policy checks and redispatch.
#[derive(Debug, Clone)]
pub struct Request {
    pub cmd: u8,
    pub auth: AuthInfo,
    pub addr: Address,
}

// =============================================================================
// Server Handshake
// =============================================================================

/// Performs the server side of the SOCKS5 handshake up to (and including)
/// reading the request.
///
/// Username/password authentication is negotiated when the client offers
/// it; a client that only offers "no auth" is allowed through the
/// handshake with empty credentials so the caller can reject it with a
/// proper reply rather than a slammed connection.
///
/// # Errors
///
/// Any framing violation; the connection is useless afterwards.
pub async fn handshake<S>(conn: &mut S) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Version/method negotiation.
    let ver = conn.read_u8().await?;
    if ver != SOCKS_VERSION {
        return Err(Error::Protocol(format!("bad SOCKS version {ver:#04x}")));
    }
    let nmethods = conn.read_u8().await?;
    let mut methods = vec![0u8; usize::from(nmethods)];
    conn.read_exact(&mut methods).await?;

    let method = if methods.contains(&METHOD_USERPASS) {
        METHOD_USERPASS
    } else if methods.contains(&METHOD_NONE) {
        METHOD_NONE
    } else {
        conn.write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]).await?;
        return Err(Error::Protocol("no acceptable auth method".into()));
    };
    conn.write_all(&[SOCKS_VERSION, method]).await?;

    let auth = if method == METHOD_USERPASS {
        negotiate_auth(conn).await?
    } else {
        AuthInfo::default()
    };

    // The request proper.
    let ver = conn.read_u8().await?;
    if ver != SOCKS_VERSION {
        return Err(Error::Protocol(format!(
            "bad request version {ver:#04x}"
        )));
    }
    let cmd = conn.read_u8().await?;
    let _rsv = conn.read_u8().await?;
    let addr = read_address(conn).await?;

    Ok(Request { cmd, auth, addr })
}

async fn negotiate_auth<S>(conn: &mut S) -> Result<AuthInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let fail = [AUTH_VERSION, 0x01];

    let ver = conn.read_u8().await?;
    if ver != AUTH_VERSION {
        conn.write_all(&fail).await?;
        return Err(Error::Protocol(format!("bad auth version {ver:#04x}")));
    }

    let ulen = conn.read_u8().await?;
    if ulen == 0 {
        conn.write_all(&fail).await?;
        return Err(Error::Protocol("zero length username".into()));
    }
    let mut uname = vec![0u8; usize::from(ulen)];
    conn.read_exact(&mut uname).await?;

    let plen = conn.read_u8().await?;
    if plen == 0 {
        conn.write_all(&fail).await?;
        return Err(Error::Protocol("zero length password".into()));
    }
    let mut passwd = vec![0u8; usize::from(plen)];
    conn.read_exact(&mut passwd).await?;

    conn.write_all(&[AUTH_VERSION, 0x00]).await?;
    Ok(AuthInfo { uname, passwd })
}

async fn read_address<S>(conn: &mut S) -> Result<Address>
where
    S: AsyncRead + Unpin,
{
    const ATYP_V4: u8 = 0x01;
    const ATYP_DOMAIN: u8 = 0x03;
    const ATYP_V6: u8 = 0x04;

    let atyp = conn.read_u8().await?;
    let addr = match atyp {
        ATYP_V4 => {
            let mut octets = [0u8; 4];
            conn.read_exact(&mut octets).await?;
            let port = conn.read_u16().await?;
            Address::V4(Ipv4Addr::from(octets), port)
        }
        ATYP_V6 => {
            let mut octets = [0u8; 16];
            conn.read_exact(&mut octets).await?;
            let port = conn.read_u16().await?;
            Address::V6(Ipv6Addr::from(octets), port)
        }
        ATYP_DOMAIN => {
            let len = conn.read_u8().await?;
            let mut host = vec![0u8; usize::from(len)];
            conn.read_exact(&mut host).await?;
            let host = String::from_utf8(host)
                .map_err(|_| Error::Protocol("non-UTF8 domain name".into()))?;
            let port = conn.read_u16().await?;
            Address::Domain(host, port)
        }
        _ => return Err(Error::Protocol(format!("bad address type {atyp:#04x}"))),
    };
    Ok(addr)
}

/// Sends a server reply with a zeroed bind address.
///
/// # Errors
///
/// Propagates write failures.
pub async fn send_reply<S>(conn: &mut S, reply: Reply) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let buf = [
        SOCKS_VERSION,
        reply.code(),
        0x00, // RSV
        0x01, // ATYP: IPv4
        0,
        0,
        0,
        0, // BND.ADDR
        0,
        0, // BND.PORT
    ];
    conn.write_all(&buf).await?;
    Ok(())
}

// =============================================================================
// Client Side
// =============================================================================

/// Endpoint of the real SOCKS server requests are redispatched to.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// AF_LOCAL socket path.
    Unix(PathBuf),
    /// TCP `host:port`.
    Tcp(String),
}

impl Endpoint {
    /// Dials the endpoint.
    ///
    /// # Errors
    ///
    /// `DialFailed` with the underlying reason.
    pub async fn dial(&self) -> Result<Stream> {
        match self {
            Self::Unix(path) => UnixStream::connect(path)
                .await
                .map(Stream::Unix)
                .map_err(|e| Error::DialFailed {
                    addr: path.display().to_string(),
                    reason: e.to_string(),
                }),
            Self::Tcp(addr) => TcpStream::connect(addr)
                .await
                .map(Stream::Tcp)
                .map_err(|e| Error::DialFailed {
                    addr: addr.clone(),
                    reason: e.to_string(),
                }),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// A connected stream to the real SOCKS server.
#[derive(Debug)]
pub enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Self::Tcp(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Self::Tcp(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => std::pin::Pin::new(s).poll_flush(cx),
            Self::Tcp(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Self::Tcp(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Dials the endpoint and performs the client handshake for `CONNECT` to
/// `addr`, authenticating with `auth` when provided.
///
/// On success the returned stream is ready for payload bytes.
///
/// # Errors
///
/// Dial failures, framing violations, authentication rejection, and
/// non-success replies (mapped to `Protocol` errors naming the code).
pub async fn connect(
    endpoint: &Endpoint,
    addr: &Address,
    auth: Option<&AuthInfo>,
) -> Result<Stream> {
    let mut conn = endpoint.dial().await?;

    let method = if auth.is_some() {
        METHOD_USERPASS
    } else {
        METHOD_NONE
    };
    conn.write_all(&[SOCKS_VERSION, 1, method]).await?;

    let ver = conn.read_u8().await?;
    let chosen = conn.read_u8().await?;
    if ver != SOCKS_VERSION || chosen != method {
        return Err(Error::Protocol(format!(
            "upstream rejected auth method: ver {ver:#04x} method {chosen:#04x}"
        )));
    }

    if let Some(auth) = auth {
        if auth.uname.is_empty()
            || auth.uname.len() > 255
            || auth.passwd.is_empty()
            || auth.passwd.len() > 255
        {
            return Err(Error::Protocol("credentials out of range".into()));
        }
        let mut buf = Vec::with_capacity(3 + auth.uname.len() + auth.passwd.len());
        buf.push(AUTH_VERSION);
        buf.push(auth.uname.len() as u8);
        buf.extend_from_slice(&auth.uname);
        buf.push(auth.passwd.len() as u8);
        buf.extend_from_slice(&auth.passwd);
        conn.write_all(&buf).await?;

        let ver = conn.read_u8().await?;
        let status = conn.read_u8().await?;
        if ver != AUTH_VERSION || status != 0x00 {
            return Err(Error::Protocol("upstream rejected credentials".into()));
        }
    }

    // CONNECT request.
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00]);
    match addr {
        Address::V4(ip, port) => {
            buf.push(0x01);
            buf.extend_from_slice(&ip.octets());
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::V6(ip, port) => {
            buf.push(0x04);
            buf.extend_from_slice(&ip.octets());
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Domain(host, port) => {
            if host.len() > 255 {
                return Err(Error::Protocol("domain name too long".into()));
            }
            buf.push(0x03);
            buf.push(host.len() as u8);
            buf.extend_from_slice(host.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }
    conn.write_all(&buf).await?;

    // Reply.
    let ver = conn.read_u8().await?;
    if ver != SOCKS_VERSION {
        return Err(Error::Protocol(format!("bad reply version {ver:#04x}")));
    }
    let code = conn.read_u8().await?;
    let _rsv = conn.read_u8().await?;
    let _bind = read_address(&mut conn).await?;
    if code != 0x00 {
        return Err(Error::Protocol(format!("upstream reply code {code}")));
    }

    Ok(conn)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_handshake_userpass() {
        let (mut client, mut server) = duplex(1024);

        let server_task = tokio::spawn(async move { handshake(&mut server).await });

        // greeting: ver 5, 1 method, user/pass
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x05, 0x02]);

        // auth: ver 1, "u", "p"
        client.write_all(&[0x01, 0x01, b'u', 0x01, b'p']).await.unwrap();
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x01, 0x00]);

        // request: CONNECT example.com:443
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let parsed = server_task.await.unwrap().unwrap();
        assert_eq!(parsed.cmd, CMD_CONNECT);
        assert_eq!(parsed.auth.uname, b"u");
        assert_eq!(parsed.auth.passwd, b"p");
        assert_eq!(
            parsed.addr,
            Address::Domain("example.com".to_string(), 443)
        );
    }

    #[tokio::test]
    async fn test_handshake_no_auth_yields_empty_credentials() {
        let (mut client, mut server) = duplex(1024);
        let server_task = tokio::spawn(async move { handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x05, 0x00]);

        let req = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        client.write_all(&req).await.unwrap();

        let parsed = server_task.await.unwrap().unwrap();
        assert!(parsed.auth.uname.is_empty());
        assert_eq!(parsed.addr, Address::V4(Ipv4Addr::LOCALHOST, 80));
    }

    #[tokio::test]
    async fn test_handshake_rejects_zero_length_username() {
        let (mut client, mut server) = duplex(1024);
        let server_task = tokio::spawn(async move { handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();

        client.write_all(&[0x01, 0x00]).await.unwrap();
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x01, 0x01], "auth must fail");

        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_version() {
        let (mut client, mut server) = duplex(64);
        let server_task = tokio::spawn(async move { handshake(&mut server).await });
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_reply_wire_format() {
        let (mut client, mut server) = duplex(64);
        send_reply(&mut server, Reply::CommandNotSupported)
            .await
            .unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x05);
        assert_eq!(buf[1], 0x07);
    }
}

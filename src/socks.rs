//! SOCKS5 wire format (RFC 1928) with username/password auth (RFC 1929).
//!
//! Only the pieces needed by a CONNECT-only server are implemented.

use crate::error::{ProxyError, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Authentication methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Method {
    NoAuth = 0x00,
    UserPass = 0x02,
    NoAcceptable = 0xFF,
}

/// Reply codes sent in response to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Destination requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn host(&self) -> String {
        match self {
            Self::Ip(addr) => addr.ip().to_string(),
            Self::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// Username/password pair from RFC 1929 sub-negotiation.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Constant-time comparison against the configured credentials.
    pub fn matches(&self, expected: &Credentials) -> bool {
        let user = self.username.as_bytes().ct_eq(expected.username.as_bytes());
        let pass = self.password.as_bytes().ct_eq(expected.password.as_bytes());
        (user & pass).into()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

fn check_version(expected: u8, got: u8) -> Result<()> {
    if expected != got {
        return Err(ProxyError::protocol(format!(
            "unexpected version {got:#04x}, expected {expected:#04x}"
        )));
    }
    Ok(())
}

/// Reads the client greeting and returns the offered methods.
pub async fn read_greeting<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let version = reader.read_u8().await?;
    check_version(VERSION, version)?;

    let count = reader.read_u8().await? as usize;
    let mut methods = vec![0u8; count];
    reader.read_exact(&mut methods).await?;
    Ok(methods)
}

/// Sends the selected method.
pub async fn write_method<W: AsyncWrite + Unpin>(writer: &mut W, method: Method) -> Result<()> {
    writer.write_all(&[VERSION, method as u8]).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_short_string<R: AsyncRead + Unpin>(reader: &mut R, what: &str) -> Result<String> {
    let len = reader.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| ProxyError::protocol(format!("{what} is not valid UTF-8")))
}

/// Reads a username/password request.
pub async fn read_credentials<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Credentials> {
    let version = reader.read_u8().await?;
    check_version(AUTH_VERSION, version)?;

    let username = read_short_string(reader, "username").await?;
    let password = read_short_string(reader, "password").await?;
    Ok(Credentials { username, password })
}

/// Sends the username/password verdict.
pub async fn write_auth_status<W: AsyncWrite + Unpin>(writer: &mut W, success: bool) -> Result<()> {
    let status = if success { 0x00 } else { 0x01 };
    writer.write_all(&[AUTH_VERSION, status]).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a request and returns its destination.
///
/// The whole request is consumed even for unsupported commands, which are
/// reported as [`ProxyError::UnsupportedCommand`].
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<TargetAddr> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;
    check_version(VERSION, version)?;

    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            let port = reader.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            let port = reader.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        ATYP_DOMAIN => {
            let domain = read_short_string(reader, "domain").await?;
            if domain.is_empty() {
                return Err(ProxyError::protocol("empty domain"));
            }
            let port = reader.read_u16().await?;
            TargetAddr::Domain(domain, port)
        }
        other => return Err(ProxyError::UnsupportedAddressType(other)),
    };

    if command != CMD_CONNECT {
        return Err(ProxyError::UnsupportedCommand(command));
    }
    Ok(target)
}

/// Sends a reply carrying the bound address (or `0.0.0.0:0`).
pub async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: Reply,
    bound: Option<SocketAddr>,
) -> Result<()> {
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[VERSION, reply as u8, 0x00]);
    match bound.ip() {
        IpAddr::V4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&bound.port().to_be_bytes());

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

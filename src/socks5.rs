//! SOCKS5 client dialer.
//!
//! Opens a tunnel to `host:port` through a SOCKS5 proxy using the
//! no-authentication method and a domain-name CONNECT request, so the proxy
//! performs name resolution (required for `.onion` targets).

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::AsFd;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{reply_description, Error, Result};
use crate::timed::read_exact_with_timeout;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;

const SOCKS5_CMD_CONNECT: u8 = 0x01;

const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

const SOCKS5_REP_SUCCESS: u8 = 0x00;

/// Longest domain name the one-byte length prefix can carry.
pub const MAX_DOMAIN_LEN: usize = 255;

/// Fixed capacity of an outbound CONNECT request: 5 header bytes, the
/// domain, and 2 port bytes.
pub const REQUEST_CAPACITY: usize = 5 + MAX_DOMAIN_LEN + 2;

/// Default budget for each negotiation read.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(120);

/// SOCKS5 proxy dialer.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    /// Proxy host name or address
    proxy_host: String,
    /// Proxy port
    proxy_port: u16,
    /// Budget for connecting and for each negotiation read
    timeout: Duration,
}

impl Socks5Dialer {
    /// Create a new dialer for the proxy at `proxy_host:proxy_port`.
    pub fn new(proxy_host: impl Into<String>, proxy_port: u16) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            proxy_port,
            timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }

    /// Set connection and negotiation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The proxy address in host:port format
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy_host, self.proxy_port)
    }

    /// Open a tunnel to `target_host:target_port`.
    ///
    /// The target is validated before any socket is created. On any failure
    /// after the proxy connection opened, the socket is dropped (closed)
    /// before the error is returned. The host name is sent as given, byte for
    /// byte.
    pub fn dial<H: AsRef<[u8]>>(&self, target_host: H, target_port: u16) -> Result<TcpStream> {
        let target_host = target_host.as_ref();
        let request = build_connect_request(target_host, target_port)?;

        let mut stream = self.connect_proxy()?;
        debug!(proxy = %self.proxy_addr(), "connected to proxy");

        negotiate(&mut stream, self.timeout)?;
        connect(&mut stream, &request, self.timeout)?;

        debug!(
            proxy = %self.proxy_addr(),
            target = %format!("{}:{}", String::from_utf8_lossy(target_host), target_port),
            "tunnel established"
        );
        Ok(stream)
    }

    /// Resolve the proxy and connect to the first address that accepts.
    fn connect_proxy(&self) -> Result<TcpStream> {
        let unreachable = |source| Error::ProxyUnreachable {
            proxy: self.proxy_addr(),
            source,
        };

        let addrs: Vec<SocketAddr> = (self.proxy_host.as_str(), self.proxy_port)
            .to_socket_addrs()
            .map_err(unreachable)?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match self.connect_addr(addr) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, error = %e, "proxy address refused connection");
                    last_err = Some(e);
                }
            }
        }

        Err(unreachable(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "proxy host resolved to no addresses",
            )
        })))
    }

    fn connect_addr(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.connect_timeout(&addr.into(), self.timeout)?;
        let stream = TcpStream::from(socket);
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Open a tunnel to `target_host:target_port` through the SOCKS5 proxy at
/// `proxy_host:proxy_port`.
pub fn dial_via_socks5(
    proxy_host: &str,
    proxy_port: u16,
    target_host: impl AsRef<[u8]>,
    target_port: u16,
    timeout: Duration,
) -> Result<TcpStream> {
    Socks5Dialer::new(proxy_host, proxy_port)
        .with_timeout(timeout)
        .dial(target_host, target_port)
}

/// Build a CONNECT request for a domain-name target.
///
/// Fails with `InvalidTarget` when the name is empty or does not fit the
/// length prefix and the fixed request capacity.
pub fn build_connect_request<H: AsRef<[u8]>>(host: H, port: u16) -> Result<Vec<u8>> {
    let domain = host.as_ref();
    if domain.is_empty() {
        return Err(Error::InvalidTarget("empty host name".to_string()));
    }
    if domain.len() > MAX_DOMAIN_LEN || 5 + domain.len() + 2 > REQUEST_CAPACITY {
        return Err(Error::InvalidTarget(format!(
            "host name is {} bytes, limit is {}",
            domain.len(),
            MAX_DOMAIN_LEN
        )));
    }

    let mut req = Vec::with_capacity(REQUEST_CAPACITY);
    req.extend_from_slice(&[
        SOCKS5_VERSION,
        SOCKS5_CMD_CONNECT,
        0x00,
        SOCKS5_ATYP_DOMAIN,
        domain.len() as u8,
    ]);
    req.extend_from_slice(domain);
    req.extend_from_slice(&port.to_be_bytes());
    Ok(req)
}

/// Method selection: offer no-auth only and require the proxy to accept it.
fn negotiate<S>(stream: &mut S, timeout: Duration) -> Result<()>
where
    S: Read + Write + AsFd + ?Sized,
{
    stream
        .write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_NONE])
        .map_err(|e| Error::ProxyHandshakeFailed(format!("failed to send greeting: {}", e)))?;

    let resp = read_exact_with_timeout(stream, 2, timeout)
        .map_err(|e| Error::ProxyHandshakeFailed(format!("no method selection: {}", e)))?;

    if resp[0] != SOCKS5_VERSION {
        return Err(Error::ProxyHandshakeFailed(format!(
            "invalid SOCKS version: {}",
            resp[0]
        )));
    }
    if resp[1] != SOCKS5_AUTH_NONE {
        return Err(Error::ProxyHandshakeFailed(format!(
            "proxy selected unsupported method: {}",
            resp[1]
        )));
    }
    Ok(())
}

/// Send the CONNECT request and consume the whole reply.
///
/// The bound address is drained even when the proxy rejects the request or
/// answers with the wrong version, so the reply is never left half-read.
fn connect<S>(stream: &mut S, request: &[u8], timeout: Duration) -> Result<()>
where
    S: Read + Write + AsFd + ?Sized,
{
    stream
        .write_all(request)
        .map_err(|e| Error::ProxyHandshakeFailed(format!("failed to send request: {}", e)))?;

    let header = read_exact_with_timeout(stream, 4, timeout)
        .map_err(|e| Error::ProxyHandshakeFailed(format!("no reply: {}", e)))?;

    let (version, rep) = (header[0], header[1]);
    let drained = drain_bound_address(stream, header[3], timeout);

    if version != SOCKS5_VERSION {
        warn!(version, reply = rep, "proxy answered CONNECT with a foreign version");
        return Err(Error::ConnectRejected(rep));
    }
    if rep != SOCKS5_REP_SUCCESS {
        warn!(reply = rep, "proxy rejected CONNECT: {}", reply_description(rep));
        return Err(Error::ConnectRejected(rep));
    }
    drained
}

/// Number of bytes following the reply header for a fixed-size address
/// type, including the port. `None` for domain names and unknown types.
pub fn bound_address_len(atyp: u8) -> Option<usize> {
    match atyp {
        SOCKS5_ATYP_IPV4 => Some(4 + 2),
        SOCKS5_ATYP_IPV6 => Some(16 + 2),
        _ => None,
    }
}

fn drain_bound_address<S>(stream: &mut S, atyp: u8, timeout: Duration) -> Result<()>
where
    S: Read + AsFd + ?Sized,
{
    let truncated = |e: Error| Error::ProxyHandshakeFailed(format!("truncated bound address: {}", e));

    let len = match (atyp, bound_address_len(atyp)) {
        (_, Some(len)) => len,
        (SOCKS5_ATYP_DOMAIN, None) => {
            let prefix = read_exact_with_timeout(stream, 1, timeout).map_err(truncated)?;
            prefix[0] as usize + 2
        }
        (other, None) => return Err(Error::UnsupportedAddressType(other)),
    };

    read_exact_with_timeout(stream, len, timeout).map_err(truncated)?;
    Ok(())
}

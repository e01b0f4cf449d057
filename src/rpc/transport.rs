//! Physical transports: plain TCP and TLS
//!
//! TLS certificates are not validated against a CA. The server's identity is
//! its certificate fingerprint, checked against the trust store by the
//! connection after the handshake.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ClientConnection, ServerName, StreamOwned};
use tracing::debug;

use super::error::{ConnectionError, ConnectionResult};
use super::trust::fingerprint_from_der;

/// Byte stream carrying RPC packets
pub trait RpcStream: Read + Write + Send {}

impl<T: Read + Write + Send> RpcStream for T {}

/// An open transport
pub struct Transport {
    /// The byte stream
    pub stream: Box<dyn RpcStream>,
    /// Server certificate fingerprint for secure transports
    pub fingerprint: Option<String>,
    /// Remote socket address, when known
    pub peer_addr: Option<SocketAddr>,
    /// Local socket address, when known
    pub local_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("fingerprint", &self.fingerprint)
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Opens transports to a server endpoint.
pub trait Connector: Send + Sync {
    /// Connect to `host:port`, performing the TLS handshake when `secure`.
    fn connect(
        &self,
        host: &str,
        port: u16,
        secure: bool,
        timeout: Option<Duration>,
    ) -> ConnectionResult<Transport>;
}

/// Default connector over `std::net` and rustls
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    fn open(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
        let mut last_err = None;
        for candidate in (host, port).to_socket_addrs()? {
            let attempt = match timeout {
                Some(limit) => TcpStream::connect_timeout(&candidate, limit),
                None => TcpStream::connect(candidate),
            };
            match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    stream.set_read_timeout(timeout)?;
                    stream.set_write_timeout(timeout)?;
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address resolved for {host}"))
        }))
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        secure: bool,
        timeout: Option<Duration>,
    ) -> ConnectionResult<Transport> {
        let mut tcp = Self::open(host, port, timeout)?;
        let peer_addr = tcp.peer_addr().ok();
        let local_addr = tcp.local_addr().ok();

        if !secure {
            return Ok(Transport {
                stream: Box::new(tcp),
                fingerprint: None,
                peer_addr,
                local_addr,
            });
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(FingerprintOnly))
            .with_no_client_auth();
        let server_name = ServerName::try_from(host)
            .map_err(|err| ConnectionError::Tls(format!("invalid server name {host}: {err}")))?;
        let mut conn = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|err| ConnectionError::Tls(err.to_string()))?;

        while conn.is_handshaking() {
            conn.complete_io(&mut tcp)
                .map_err(|err| ConnectionError::Tls(format!("handshake failed: {err}")))?;
        }

        // SHA-256 over the leaf certificate; see `fingerprint_from_der`
        let fingerprint = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| fingerprint_from_der(&cert.0))
            .ok_or_else(|| ConnectionError::Tls("no certificate retrieved from TLS session".into()))?;
        debug!(host, port, %fingerprint, "TLS handshake complete");

        Ok(Transport {
            stream: Box::new(StreamOwned::new(conn, tcp)),
            fingerprint: Some(fingerprint),
            peer_addr,
            local_addr,
        })
    }
}

/// Accepts any certificate; trust is decided by fingerprint afterwards.
struct FingerprintOnly;

impl ServerCertVerifier for FingerprintOnly {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// `ip:port` for a socket address, bracketing IPv6.
pub fn format_ip_port(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) => format!("{ip}:{}", addr.port()),
        IpAddr::V6(ip) => format!("[{ip}]:{}", addr.port()),
    }
}

//! SOCKS5 handshakes
//!
//! The server side accepts local clients and hands back the requested
//! target; the reply is sent only after the routed dial finished, so the
//! client sees the real outcome. The client side is used by `Socks5Dialer`
//! to reach targets through an upstream relay.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::trace;

use crate::common::{Address, Network, Result, Stream};
use crate::error::Error;
use crate::transport::Dialer;

use super::Socks5Config;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const AUTH_SUBNEGOTIATION_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Server side of the local SOCKS5 front-end (CONNECT only)
#[derive(Debug, Clone, Default)]
pub struct Socks5Server {
    config: Socks5Config,
}

impl Socks5Server {
    pub fn new(config: Socks5Config) -> Self {
        Self { config }
    }

    /// Negotiate auth and read the CONNECT request.
    ///
    /// Protocol violations that have a SOCKS reply code are answered before
    /// the error is returned. On success nothing is replied yet; call
    /// [`send_reply`] once the target dial finished.
    pub async fn accept<S>(&self, stream: &mut S) -> Result<Address>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;
        if buf[0] != SOCKS5_VERSION {
            return Err(Error::Protocol(format!("Unsupported SOCKS version: {}", buf[0])));
        }

        let mut methods = vec![0u8; buf[1] as usize];
        stream.read_exact(&mut methods).await?;

        let selected = if self.config.requires_auth() {
            if methods.contains(&AUTH_PASSWORD) {
                AUTH_PASSWORD
            } else {
                AUTH_NO_ACCEPTABLE
            }
        } else if methods.contains(&AUTH_NONE) {
            AUTH_NONE
        } else {
            AUTH_NO_ACCEPTABLE
        };
        stream.write_all(&[SOCKS5_VERSION, selected]).await?;

        match selected {
            AUTH_NO_ACCEPTABLE => return Err(Error::Protocol("No acceptable auth method".into())),
            AUTH_PASSWORD => self.authenticate(stream).await?,
            _ => {}
        }

        let mut header = [0u8; 3];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(Error::Protocol("Invalid SOCKS version in request".into()));
        }

        let address = match read_address(stream).await {
            Ok(address) => address,
            Err(e) => {
                if matches!(e, Error::Unsupported(_)) {
                    send_reply(stream, REP_ATYP_NOT_SUPPORTED).await?;
                }
                return Err(e);
            }
        };

        if header[1] != CMD_CONNECT {
            send_reply(stream, REP_CMD_NOT_SUPPORTED).await?;
            return Err(Error::Unsupported(format!("SOCKS5 command {}", header[1])));
        }

        trace!("SOCKS5 CONNECT {}", address);
        Ok(address)
    }

    async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut ver = [0u8; 1];
        stream.read_exact(&mut ver).await?;
        if ver[0] != AUTH_SUBNEGOTIATION_VERSION {
            return Err(Error::Protocol("Invalid auth version".into()));
        }

        let username = read_short_field(stream).await?;
        let password = read_short_field(stream).await?;

        let auth_ok = self.config.username.as_deref() == Some(username.as_str())
            && self.config.password.as_deref() == Some(password.as_str());

        if auth_ok {
            stream.write_all(&[AUTH_SUBNEGOTIATION_VERSION, 0x00]).await?;
            Ok(())
        } else {
            stream.write_all(&[AUTH_SUBNEGOTIATION_VERSION, 0x01]).await?;
            Err(Error::Protocol("Authentication failed".into()))
        }
    }
}

/// Send a reply with an unspecified bound address
pub async fn send_reply<S>(stream: &mut S, reply: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let packet = [SOCKS5_VERSION, reply, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&packet).await?;
    stream.flush().await?;
    Ok(())
}

/// Reply code describing a failed dial
pub fn reply_code(err: &Error) -> u8 {
    match err {
        Error::Timeout => REP_TTL_EXPIRED,
        Error::NoRoute(_) => REP_NETWORK_UNREACHABLE,
        Error::Unsupported(_) => REP_CMD_NOT_SUPPORTED,
        Error::InvalidAddress(_) => REP_HOST_UNREACHABLE,
        Error::Io(e) => match e.kind() {
            std::io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
            std::io::ErrorKind::TimedOut => REP_TTL_EXPIRED,
            std::io::ErrorKind::PermissionDenied => REP_NOT_ALLOWED,
            _ => REP_HOST_UNREACHABLE,
        },
        _ => REP_GENERAL_FAILURE,
    }
}

/// Client handshake: ask the relay on `stream` to CONNECT to `target`
pub async fn connect<S>(stream: &mut S, config: &Socks5Config, target: &Address) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = if config.requires_auth() {
        AUTH_PASSWORD
    } else {
        AUTH_NONE
    };
    stream.write_all(&[SOCKS5_VERSION, 1, method]).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != SOCKS5_VERSION {
        return Err(Error::Protocol("Invalid SOCKS version from server".into()));
    }

    match response[1] {
        AUTH_NONE => {}
        AUTH_PASSWORD => {
            let username = config.username.as_deref().unwrap_or("");
            let password = config.password.as_deref().unwrap_or("");

            let mut request = vec![AUTH_SUBNEGOTIATION_VERSION];
            push_short_field(&mut request, username)?;
            push_short_field(&mut request, password)?;
            stream.write_all(&request).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(Error::Protocol("Upstream authentication failed".into()));
            }
        }
        _ => return Err(Error::Protocol("Upstream rejected auth methods".into())),
    }

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    encode_address(&mut request, target)?;
    stream.write_all(&request).await?;

    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Error::Protocol("Invalid SOCKS version in response".into()));
    }

    if header[1] != REP_SUCCESS {
        return Err(reply_error(header[1], target));
    }

    // bound address, unused
    read_address(stream).await?;
    Ok(())
}

fn reply_error(reply: u8, target: &Address) -> Error {
    let kind = match reply {
        REP_CONNECTION_REFUSED => std::io::ErrorKind::ConnectionRefused,
        REP_TTL_EXPIRED => std::io::ErrorKind::TimedOut,
        REP_NOT_ALLOWED => std::io::ErrorKind::PermissionDenied,
        _ => {
            let msg = match reply {
                REP_GENERAL_FAILURE => "General failure",
                REP_NETWORK_UNREACHABLE => "Network unreachable",
                REP_HOST_UNREACHABLE => "Host unreachable",
                REP_CMD_NOT_SUPPORTED => "Command not supported",
                REP_ATYP_NOT_SUPPORTED => "Address type not supported",
                _ => "Unknown error",
            };
            return Error::Protocol(format!("SOCKS5 error for {}: {}", target, msg));
        }
    };
    Error::Io(std::io::Error::new(kind, format!("upstream relay could not reach {}", target)))
}

async fn read_address<S>(stream: &mut S) -> Result<Address>
where
    S: AsyncRead + Unpin,
{
    let mut atyp = [0u8; 1];
    stream.read_exact(&mut atyp).await?;

    let address = match atyp[0] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            Address::Socket(SocketAddr::new(Ipv4Addr::from(ip).into(), port))
        }
        ATYP_DOMAIN => {
            let domain = read_short_field(stream).await?;
            let port = stream.read_u16().await?;
            Address::Domain(domain, port)
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            Address::Socket(SocketAddr::new(Ipv6Addr::from(ip).into(), port))
        }
        other => return Err(Error::Unsupported(format!("SOCKS5 address type {}", other))),
    };
    Ok(address)
}

fn encode_address(buf: &mut Vec<u8>, address: &Address) -> Result<()> {
    match address {
        Address::Socket(SocketAddr::V4(v4)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
        Address::Socket(SocketAddr::V6(v6)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.port().to_be_bytes());
        }
        Address::Domain(domain, port) => {
            buf.push(ATYP_DOMAIN);
            push_short_field(buf, domain)?;
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }
    Ok(())
}

/// Length-prefixed string, at most 255 bytes
async fn read_short_field<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u8().await? as usize;
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

fn push_short_field(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    let len = u8::try_from(value.len())
        .map_err(|_| Error::InvalidAddress(format!("{} exceeds 255 bytes", value)))?;
    buf.push(len);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Proxy-path dialer: connects to the upstream relay and asks it for the
/// target. The whole exchange shares the caller's timeout.
pub struct Socks5Dialer {
    server: Address,
    config: Socks5Config,
    transport: Arc<dyn Dialer>,
}

impl Socks5Dialer {
    pub fn new(server: Address, config: Socks5Config, transport: Arc<dyn Dialer>) -> Self {
        Self {
            server,
            config,
            transport,
        }
    }

    pub fn server(&self) -> &Address {
        &self.server
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self, network: Network, addr: &Address, timeout: Duration) -> Result<Stream> {
        if network != Network::Tcp {
            return Err(Error::Unsupported(format!("{} through SOCKS5 relay", network)));
        }

        let started = Instant::now();
        let mut stream = self.transport.dial(Network::Tcp, &self.server, timeout).await?;
        let remaining = timeout.saturating_sub(started.elapsed());

        tokio::time::timeout(remaining, connect(&mut stream, &self.config, addr))
            .await
            .map_err(|_| Error::Timeout)??;

        trace!("Relay {} connected to {}", self.server, addr);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn with_auth() -> Socks5Config {
        Socks5Config {
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
        }
    }

    #[tokio::test]
    async fn test_client_server_handshake() {
        let (mut client, mut server) = duplex(1024);
        let target = Address::domain("example.com", 443);

        let server_task = tokio::spawn(async move {
            let address = Socks5Server::default().accept(&mut server).await.unwrap();
            send_reply(&mut server, REP_SUCCESS).await.unwrap();
            address
        });

        connect(&mut client, &Socks5Config::default(), &target).await.unwrap();
        assert_eq!(server_task.await.unwrap(), target);
    }

    #[tokio::test]
    async fn test_password_auth() {
        let (mut client, mut server) = duplex(1024);
        let target: Address = "1.2.3.4:80".parse().unwrap();

        let server_task = tokio::spawn(async move {
            let address = Socks5Server::new(with_auth()).accept(&mut server).await.unwrap();
            send_reply(&mut server, REP_SUCCESS).await.unwrap();
            address
        });

        connect(&mut client, &with_auth(), &target).await.unwrap();
        assert_eq!(server_task.await.unwrap(), target);
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let (mut client, mut server) = duplex(1024);
        let server_task =
            tokio::spawn(async move { Socks5Server::new(with_auth()).accept(&mut server).await });

        let wrong = Socks5Config {
            username: Some("user".to_string()),
            password: Some("nope".to_string()),
        };
        let result = connect(&mut client, &wrong, &Address::domain("a.example", 80)).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_failure_reply_maps_to_error() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            Socks5Server::default().accept(&mut server).await.unwrap();
            send_reply(&mut server, REP_CONNECTION_REFUSED).await.unwrap();
        });

        let result = connect(&mut client, &Socks5Config::default(), &Address::domain("a.example", 80)).await;
        match result {
            Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionRefused),
            _ => panic!("expected connection refused"),
        }
    }

    #[tokio::test]
    async fn test_non_connect_command_rejected() {
        let (mut client, mut server) = duplex(1024);
        let server_task =
            tokio::spawn(async move { Socks5Server::default().accept(&mut server).await });

        client.write_all(&[SOCKS5_VERSION, 1, AUTH_NONE]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        // UDP ASSOCIATE 0.0.0.0:0
        client
            .write_all(&[SOCKS5_VERSION, 0x03, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_CMD_NOT_SUPPORTED);
        assert!(matches!(server_task.await.unwrap(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_reply_codes() {
        assert_eq!(reply_code(&Error::Timeout), REP_TTL_EXPIRED);
        assert_eq!(reply_code(&Error::NoRoute("x".into())), REP_NETWORK_UNREACHABLE);
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(reply_code(&Error::Io(refused)), REP_CONNECTION_REFUSED);
        assert_eq!(reply_code(&Error::Protocol("x".into())), REP_GENERAL_FAILURE);
    }

    #[tokio::test]
    async fn test_dialer_through_relay() {
        use crate::transport::TcpDialer;

        let tcp = TcpDialer::new();
        let listener = tcp.bind(&"127.0.0.1:0".parse().unwrap()).await.unwrap();
        let relay_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let target = Socks5Server::default().accept(&mut stream).await.unwrap();
            assert_eq!(target, Address::domain("example.com", 443));
            send_reply(&mut stream, REP_SUCCESS).await.unwrap();
            stream.write_all(b"pong").await.unwrap();
        });

        let dialer = Socks5Dialer::new(relay_addr, Socks5Config::default(), Arc::new(tcp));
        let mut stream = dialer
            .dial(Network::Tcp, &Address::domain("example.com", 443), Duration::from_secs(2))
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}

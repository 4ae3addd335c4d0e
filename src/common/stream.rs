//! Connection abstraction
//!
//! Every dial path hands back a `Stream`: a boxed async byte pipe that also
//! knows its endpoints.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// An established, bidirectional connection
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {
    /// Local endpoint of the connection
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Remote endpoint of the connection
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// The core stream type returned by every dialer.
pub type Stream = Box<dyn Connection>;

impl Connection for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

/// In-memory pipes have no socket endpoints.
impl Connection for DuplexStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "in-memory stream"))
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "in-memory stream"))
    }
}

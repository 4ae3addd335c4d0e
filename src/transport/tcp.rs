//! TCP Transport implementation

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::common::{Address, Network, Result, Stream};
use crate::error::Error;

use super::{Dialer, Listener};

/// TCP dialer - raw TCP connections
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl TcpDialer {
    pub fn new() -> Self {
        Self
    }

    /// Bind a listener on a socket address
    pub async fn bind(&self, addr: &Address) -> Result<Box<dyn Listener>> {
        let socket_addr = addr
            .as_socket()
            .ok_or_else(|| Error::Config(format!("Cannot bind to domain address {}", addr)))?;

        let listener = TcpListener::bind(socket_addr).await?;
        Ok(Box::new(TcpListenerWrapper { listener }))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, network: Network, addr: &Address, timeout: Duration) -> Result<Stream> {
        if network != Network::Tcp {
            return Err(Error::Unsupported(format!("{} dialing", network)));
        }

        let connect = async {
            match addr {
                Address::Socket(socket_addr) => TcpStream::connect(socket_addr).await,
                Address::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
            }
        };

        let stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| Error::Timeout)??;

        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;

        Ok(Box::new(stream))
    }
}

/// Wrapper for TcpListener to implement Listener trait
struct TcpListenerWrapper {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpListenerWrapper {
    async fn accept(&self) -> Result<(Stream, Address)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), Address::Socket(addr)))
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(Address::Socket(self.listener.local_addr()?))
    }
}

//! Transport Layer
//!
//! Responsibilities:
//! - Establish lowest-level connections (TCP)
//! - NO encryption, NO protocol parsing, NO content inspection
//!
//! The `Dialer` signature is shared by every dial path in the crate: the raw
//! TCP dialer, the upstream relay dialer and the routing engine itself, so
//! any of them can be dropped in where another is expected.

mod reject;
mod tcp;

pub use reject::RejectDialer;
pub use tcp::TcpDialer;

use std::time::Duration;

use async_trait::async_trait;

use crate::common::{Address, Network, Result, Stream};

/// Something that can open a connection to `addr` within `timeout`
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to a remote address
    async fn dial(&self, network: Network, addr: &Address, timeout: Duration) -> Result<Stream>;
}

/// Listener trait for accepting incoming connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept a new connection
    async fn accept(&self) -> Result<(Stream, Address)>;

    /// Get the local bound address
    fn local_addr(&self) -> Result<Address>;
}

//! Reject dialer - fails every dial immediately
//!
//! Stands in for the proxy path when no upstream relay is configured, so
//! the routing engine still works in direct-only mode.

use std::time::Duration;

use async_trait::async_trait;

use crate::common::{Address, Network, Result, Stream};
use crate::error::Error;

use super::Dialer;

#[derive(Debug, Default, Clone, Copy)]
pub struct RejectDialer;

impl RejectDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for RejectDialer {
    async fn dial(&self, _network: Network, addr: &Address, _timeout: Duration) -> Result<Stream> {
        Err(Error::NoRoute(format!("{} (no upstream configured)", addr)))
    }
}

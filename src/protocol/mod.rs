//! Proxy Protocol Layer
//!
//! Responsibilities:
//! - Authentication
//! - Target address parsing
//!
//! Only SOCKS5 is spoken: as a server towards local clients and as a client
//! towards the upstream relay that backs the proxy path.

pub mod socks5;

pub use socks5::{Socks5Dialer, Socks5Server};

/// SOCKS5 credentials
#[derive(Debug, Clone, Default)]
pub struct Socks5Config {
    /// Username for authentication (optional)
    pub username: Option<String>,
    /// Password for authentication (optional)
    pub password: Option<String>,
}

impl Socks5Config {
    pub fn requires_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

//! detour - adaptive direct/proxy routing
//!
//! # Architecture
//!
//! ```text
//! local client
//! → SOCKS5 inbound (protocol)
//! → RoutingEngine (detour)
//!     → RoutingPolicy (router)      forced strategy or AutoTry
//!     → Detector + SiteStatistics   learned direct/proxy preference
//!     → direct TcpDialer | upstream Socks5Dialer (transport/protocol)
//! → RoutedConnection                early read signals, close-time feedback
//! → PersistenceLoop                 periodic and shutdown snapshots
//! ```
//!
//! ## Core Principles
//!
//! - Every dial path implements the same `Dialer` trait, the engine included
//! - Policies are pure functions of the host, no IO
//! - Learning happens once per connection, when it closes
//! - Statistics failures never stop traffic
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Address
//! ├── transport/       # Dialer/Listener traits, TCP, reject
//! ├── protocol/        # SOCKS5 server and client handshakes
//! ├── router/          # Strategy, RoutingPolicy, rule-based policy
//! ├── detour/          # Statistics, detector, routed connections, engine
//! └── app/             # Dispatcher, Runtime, stats API
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod transport;
pub mod protocol;
pub mod router;
pub mod detour;
pub mod app;

// Supporting modules
pub mod config;
pub mod metrics;

// Re-exports for convenience
pub use common::{Address, Network, Stream};
pub use config::Config;
pub use error::{Error, Result};

pub use app::Runtime;
pub use detour::{init_statistics, RoutingEngine, SiteStatistics};
pub use router::{RoutingPolicy, Strategy};
pub use transport::Dialer;

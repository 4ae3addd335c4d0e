//! Adaptive routing engine
//!
//! Responsibilities:
//! - Keep per-host visit statistics and persist them across restarts
//! - Decide per connection whether to dial directly or through the proxy
//! - Watch the first bytes of every connection for blocking signals
//! - Feed the outcome back into the statistics when the connection closes
//!
//! Flow of a dial:
//!
//! ```text
//! RoutingEngine::dial_routed(addr)
//!   -> RoutingPolicy::get_rule(host)        forced or AutoTry
//!   -> Detector::should_try_direct(host)    AutoTry only
//!   -> direct dialer, then proxy dialer     at most one attempt each
//!   -> RoutedConnection                     reads capture early signals
//!   -> close / drop                         success recorded or withheld
//! ```

mod conn;
mod detector;
mod engine;
mod persist;
mod sitestat;
mod visit;

pub use conn::{RouteState, RoutedConnection, DEFAULT_EARLY_WINDOW, DEFAULT_READ_TIMEOUT};
pub use detector::Detector;
pub use engine::{EngineConfig, RoutingEngine};
pub use persist::{init_statistics, load_with_fallback, LoadSource, DEFAULT_SAVE_INTERVAL};
pub use sitestat::{SiteStatistics, StatSnapshot};
pub use visit::{Thresholds, VisitCounter, DEFAULT_BLOCKED_DELTA, DEFAULT_DIRECT_DELTA};

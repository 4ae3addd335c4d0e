//! Application Layer
//!
//! This module contains:
//! - Dispatcher: SOCKS5 inbound → routing engine → relay → close feedback
//! - Runtime: configuration-driven assembly and lifecycle
//! - StatsApi: HTTP API exposing Prometheus metrics and site statistics

mod dispatcher;
mod runtime;
pub mod stats_api;

pub use dispatcher::Dispatcher;
pub use runtime::Runtime;
pub use stats_api::{build_api_router, start_api_server};

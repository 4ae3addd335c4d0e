//! Blocking detector: decides whether a host is worth a direct attempt and
//! turns connection outcomes into statistics updates.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::trace;

use super::sitestat::SiteStatistics;
use super::visit::Thresholds;

pub struct Detector {
    stats: Arc<SiteStatistics>,
    thresholds: Thresholds,
}

impl Detector {
    pub fn new(stats: Arc<SiteStatistics>, thresholds: Thresholds) -> Self {
        Self { stats, thresholds }
    }

    pub fn stats(&self) -> &Arc<SiteStatistics> {
        &self.stats
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// IP literals are always tried directly. Hostnames are tried directly
    /// unless their counters classify them as blocked; hosts in the middle
    /// band get a direct attempt too.
    pub fn should_try_direct(&self, host: &str) -> bool {
        if is_ip_literal(host) {
            return true;
        }
        let vc = self.stats.get_or_create(host);
        let direct = vc.as_direct(self.thresholds.direct_delta)
            || !vc.as_blocked(self.thresholds.blocked_delta);
        trace!(
            "{} direct={} blocked={} -> try direct: {}",
            host,
            vc.direct,
            vc.blocked,
            direct
        );
        direct
    }

    /// Detoured at least once since the last clean direct visit
    pub fn once_blocked(&self, host: &str) -> bool {
        self.stats
            .get(host)
            .map(|vc| vc.once_blocked())
            .unwrap_or(false)
    }

    /// Read deadline expiry. Never treated as a blocking signal.
    pub fn is_timeout_signal(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::TimedOut
    }

    pub fn record_direct_success(&self, host: &str) {
        self.stats.record_direct_success(host);
    }

    pub fn record_proxy_success(&self, host: &str) {
        self.stats.record_proxy_success(host);
    }
}

fn is_ip_literal(host: &str) -> bool {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
}

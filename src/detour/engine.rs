//! The adaptive dial entry point

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::common::{Address, Network, Result, Stream};
use crate::error::Error;
use crate::metrics;
use crate::router::{RoutingPolicy, Strategy};
use crate::transport::Dialer;

use super::conn::{RouteState, RoutedConnection, DEFAULT_EARLY_WINDOW, DEFAULT_READ_TIMEOUT};
use super::detector::Detector;
use super::sitestat::SiteStatistics;
use super::visit::Thresholds;

/// Engine tuning. Defaults match the long-standing heuristic constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Dial timeout for both paths
    pub dial_timeout: Duration,
    /// Direct dial timeout for hosts detoured since their last clean direct visit
    pub blocked_dial_timeout: Duration,
    /// Per-read deadline on routed connections
    pub read_timeout: Duration,
    /// Bytes within which a read error counts as a blocking signal
    pub early_window: u64,
    pub thresholds: Thresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            blocked_dial_timeout: Duration::from_secs(3),
            read_timeout: DEFAULT_READ_TIMEOUT,
            early_window: DEFAULT_EARLY_WINDOW,
            thresholds: Thresholds::default(),
        }
    }
}

/// Chooses between the direct and the proxy dialer for every connection.
///
/// The engine owns its statistics, policy and detector, so several engines
/// can run side by side in one process. It implements `Dialer` itself and
/// can replace either of the dialers it wraps.
pub struct RoutingEngine {
    direct: Arc<dyn Dialer>,
    proxy: Arc<dyn Dialer>,
    policy: Arc<dyn RoutingPolicy>,
    detector: Arc<Detector>,
    config: EngineConfig,
}

impl RoutingEngine {
    pub fn new(
        direct: Arc<dyn Dialer>,
        proxy: Arc<dyn Dialer>,
        policy: Arc<dyn RoutingPolicy>,
        stats: Arc<SiteStatistics>,
        config: EngineConfig,
    ) -> Self {
        let detector = Arc::new(Detector::new(stats, config.thresholds));
        Self {
            direct,
            proxy,
            policy,
            detector,
            config,
        }
    }

    pub fn detector(&self) -> &Arc<Detector> {
        &self.detector
    }

    pub fn stats(&self) -> &Arc<SiteStatistics> {
        self.detector.stats()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Dial `addr`, trying at most one direct and one proxy attempt.
    ///
    /// `AlwaysDirect` never falls back and returns the direct error as is.
    /// `AutoTry` tries direct when the detector recommends it and falls back
    /// to the proxy on any direct failure. `AlwaysProxy` and detector-blocked
    /// hosts go straight to the proxy, whose error is returned unchanged.
    pub async fn dial_routed(
        &self,
        network: Network,
        addr: &Address,
        timeout: Duration,
    ) -> Result<RoutedConnection> {
        let host = addr.host();
        let strategy = self.policy.get_rule(&host);

        let try_direct = match strategy {
            Strategy::AlwaysDirect => true,
            Strategy::AutoTry => self.detector.should_try_direct(&host),
            Strategy::AlwaysProxy => false,
        };

        let mut try_proxy = strategy == Strategy::AlwaysProxy;

        if try_direct {
            let limit = if strategy == Strategy::AutoTry && self.detector.once_blocked(&host) {
                self.config.blocked_dial_timeout
            } else {
                self.config.dial_timeout
            };
            let limit = effective_timeout(timeout, limit);

            trace!("Attempting direct connection for {} ({})", addr, strategy);
            metrics::DIAL_ATTEMPTS_TOTAL.with_label_values(&["direct"]).inc();
            match self.direct.dial(network, addr, limit).await {
                Ok(stream) => {
                    trace!("Dial {} to {} succeeded", RouteState::Direct.label(), addr);
                    return Ok(self.wrap(stream, addr, RouteState::Direct));
                }
                Err(e) => {
                    metrics::DIAL_FAILURES_TOTAL.with_label_values(&["direct"]).inc();
                    if strategy == Strategy::AlwaysDirect {
                        debug!("Dial {} to {} failed: {}", RouteState::Direct.label(), addr, e);
                        return Err(e);
                    }
                    debug!(
                        "Dial {} to {} failed ({}), try detour",
                        RouteState::Direct.label(),
                        addr,
                        if e.is_timeout() { "timeout" } else { "error" }
                    );
                    metrics::DIAL_FALLBACKS_TOTAL.inc();
                    try_proxy = true;
                }
            }
        } else if strategy == Strategy::AutoTry {
            try_proxy = true;
        }

        if try_proxy {
            let limit = effective_timeout(timeout, self.config.dial_timeout);
            trace!("Detouring {}", addr);
            metrics::DIAL_ATTEMPTS_TOTAL.with_label_values(&["proxy"]).inc();
            return match self.proxy.dial(network, addr, limit).await {
                Ok(stream) => {
                    trace!("Dial {} to {} succeeded", RouteState::Proxy.label(), addr);
                    Ok(self.wrap(stream, addr, RouteState::Proxy))
                }
                Err(e) => {
                    metrics::DIAL_FAILURES_TOTAL.with_label_values(&["proxy"]).inc();
                    debug!("Dial {} to {} failed: {}", RouteState::Proxy.label(), addr, e);
                    Err(e)
                }
            };
        }

        Err(Error::NoRoute(addr.to_string()))
    }

    fn wrap(&self, stream: Stream, addr: &Address, state: RouteState) -> RoutedConnection {
        RoutedConnection::new(
            stream,
            addr.clone(),
            state,
            self.detector.clone(),
            self.policy.clone(),
        )
        .with_read_timeout(self.config.read_timeout)
        .with_early_window(self.config.early_window)
    }
}

#[async_trait]
impl Dialer for RoutingEngine {
    async fn dial(&self, network: Network, addr: &Address, timeout: Duration) -> Result<Stream> {
        let conn = self.dial_routed(network, addr, timeout).await?;
        Ok(Box::new(conn))
    }
}

/// A zero caller timeout means "use the configured one"; otherwise the
/// tighter of the two applies.
fn effective_timeout(caller: Duration, configured: Duration) -> Duration {
    if caller.is_zero() {
        configured
    } else {
        caller.min(configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::router::{RulePolicy, StaticPolicy};

    enum Outcome {
        Connect,
        Fail(io::ErrorKind),
        Timeout,
    }

    struct MockDialer {
        outcome: Outcome,
        calls: AtomicUsize,
        last_timeout: Mutex<Option<Duration>>,
    }

    impl MockDialer {
        fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: AtomicUsize::new(0),
                last_timeout: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(&self, _network: Network, _addr: &Address, timeout: Duration) -> Result<Stream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_timeout.lock() = Some(timeout);
            match &self.outcome {
                Outcome::Connect => {
                    let (client, mut server) = tokio::io::duplex(64);
                    server.write_all(b"hello").await?;
                    Ok(Box::new(client))
                }
                Outcome::Fail(kind) => Err(Error::Io(io::Error::new(*kind, "mock failure"))),
                Outcome::Timeout => Err(Error::Timeout),
            }
        }
    }

    fn engine(
        direct: &Arc<MockDialer>,
        proxy: &Arc<MockDialer>,
        policy: Arc<dyn RoutingPolicy>,
        stats: &Arc<SiteStatistics>,
    ) -> RoutingEngine {
        RoutingEngine::new(
            direct.clone(),
            proxy.clone(),
            policy,
            stats.clone(),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_direct_timeout_falls_back_to_proxy() {
        let direct = MockDialer::new(Outcome::Timeout);
        let proxy = MockDialer::new(Outcome::Connect);
        let stats = Arc::new(SiteStatistics::new());
        let engine = engine(&direct, &proxy, Arc::new(StaticPolicy::default()), &stats);

        let addr = Address::domain("example.com", 443);
        let mut conn = engine
            .dial_routed(Network::Tcp, &addr, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(conn.state(), RouteState::Proxy);
        assert_eq!(direct.calls(), 1);
        assert_eq!(proxy.calls(), 1);

        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");

        conn.close().await.unwrap();
        let vc = stats.get("example.com").unwrap();
        assert_eq!(vc.blocked, 1);
        assert_eq!(vc.direct, 0);
    }

    #[tokio::test]
    async fn test_always_direct_never_falls_back() {
        let direct = MockDialer::new(Outcome::Fail(io::ErrorKind::ConnectionRefused));
        let proxy = MockDialer::new(Outcome::Connect);
        let stats = Arc::new(SiteStatistics::new());
        for _ in 0..5 {
            stats.record_proxy_success("b.cn");
        }
        let engine = engine(&direct, &proxy, Arc::new(RulePolicy::china_direct()), &stats);

        let result = engine
            .dial_routed(Network::Tcp, &Address::domain("b.cn", 80), Duration::ZERO)
            .await;
        match result {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("expected direct failure"),
        }
        assert_eq!(direct.calls(), 1);
        assert_eq!(proxy.calls(), 0);

        // the detector is not consulted for forced hosts
        let _ = engine
            .dial_routed(Network::Tcp, &Address::domain("other.cn", 80), Duration::ZERO)
            .await;
        assert!(stats.get("other.cn").is_none());
    }

    #[tokio::test]
    async fn test_always_proxy_skips_direct() {
        let direct = MockDialer::new(Outcome::Connect);
        let proxy = MockDialer::new(Outcome::Connect);
        let stats = Arc::new(SiteStatistics::new());
        let engine = engine(
            &direct,
            &proxy,
            Arc::new(StaticPolicy::new(Strategy::AlwaysProxy)),
            &stats,
        );

        let conn = engine
            .dial_routed(Network::Tcp, &Address::domain("example.org", 443), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(conn.state(), RouteState::Proxy);
        assert_eq!(direct.calls(), 0);
        conn.close().await.unwrap();
        assert!(stats.get("example.org").is_none());
    }

    #[tokio::test]
    async fn test_blocked_host_goes_straight_to_proxy() {
        let direct = MockDialer::new(Outcome::Connect);
        let proxy = MockDialer::new(Outcome::Connect);
        let stats = Arc::new(SiteStatistics::new());
        stats.record_proxy_success("blocked.example");
        stats.record_proxy_success("blocked.example");
        let engine = engine(&direct, &proxy, Arc::new(StaticPolicy::default()), &stats);

        let conn = engine
            .dial_routed(Network::Tcp, &Address::domain("blocked.example", 443), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(conn.state(), RouteState::Proxy);
        assert_eq!(direct.calls(), 0);
        assert_eq!(proxy.calls(), 1);
    }

    #[tokio::test]
    async fn test_proxy_failure_returned() {
        let direct = MockDialer::new(Outcome::Fail(io::ErrorKind::ConnectionReset));
        let proxy = MockDialer::new(Outcome::Fail(io::ErrorKind::ConnectionRefused));
        let stats = Arc::new(SiteStatistics::new());
        let engine = engine(&direct, &proxy, Arc::new(StaticPolicy::default()), &stats);

        let result = engine
            .dial_routed(Network::Tcp, &Address::domain("down.example", 443), Duration::ZERO)
            .await;
        match result {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused),
            _ => panic!("expected proxy failure"),
        }
        assert_eq!(direct.calls(), 1);
        assert_eq!(proxy.calls(), 1);
        assert!(stats.get("down.example").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_once_blocked_uses_shorter_timeout() {
        let direct = MockDialer::new(Outcome::Connect);
        let proxy = MockDialer::new(Outcome::Connect);
        let stats = Arc::new(SiteStatistics::new());
        stats.record_proxy_success("flaky.example");
        let engine = engine(&direct, &proxy, Arc::new(StaticPolicy::default()), &stats);

        let conn = engine
            .dial_routed(Network::Tcp, &Address::domain("flaky.example", 443), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(conn.state(), RouteState::Direct);
        assert_eq!(*direct.last_timeout.lock(), Some(Duration::from_secs(3)));

        let _ = engine
            .dial_routed(Network::Tcp, &Address::domain("fresh.example", 443), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(*direct.last_timeout.lock(), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_engine_as_dialer() {
        let direct = MockDialer::new(Outcome::Connect);
        let proxy = MockDialer::new(Outcome::Connect);
        let stats = Arc::new(SiteStatistics::new());
        let engine: Arc<dyn Dialer> = Arc::new(engine(&direct, &proxy, Arc::new(StaticPolicy::default()), &stats));

        let mut stream = engine
            .dial(Network::Tcp, &"10.0.0.1:22".parse().unwrap(), Duration::ZERO)
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 5);
        drop(stream);
        assert_eq!(direct.calls(), 1);
        assert_eq!(stats.get("10.0.0.1").unwrap().direct, 1);
    }

    #[test]
    fn test_effective_timeout() {
        let configured = Duration::from_secs(5);
        assert_eq!(effective_timeout(Duration::ZERO, configured), configured);
        assert_eq!(effective_timeout(Duration::from_secs(1), configured), Duration::from_secs(1));
        assert_eq!(effective_timeout(Duration::from_secs(30), configured), configured);
    }
}

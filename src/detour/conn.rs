//! Connection wrapper that watches reads for blocking signals and reports
//! the outcome back to the detector when it is closed.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{Instant, Sleep};
use tracing::{debug, trace};

use crate::common::{Address, Connection, Stream};
use crate::metrics;
use crate::router::RoutingPolicy;

use super::detector::Detector;

/// Which path a connection ended up on. Set once when the dial succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Initial,
    Direct,
    Proxy,
}

impl RouteState {
    /// Adverb used in log lines: "dial directly", "read detoured"
    pub fn label(&self) -> &'static str {
        match self {
            RouteState::Initial => "initially",
            RouteState::Direct => "directly",
            RouteState::Proxy => "detoured",
        }
    }

    /// Metric label for the path
    pub fn path(&self) -> &'static str {
        match self {
            RouteState::Initial => "none",
            RouteState::Direct => "direct",
            RouteState::Proxy => "proxy",
        }
    }
}

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_EARLY_WINDOW: u64 = 4096;

/// A dialed connection plus the bookkeeping needed for close-time feedback.
///
/// Every read gets a fresh deadline of `read_timeout`. A failed read that is
/// neither EOF nor a timeout, arriving after the first byte but within the
/// first `early_window` bytes, is remembered as `last_error`. When the
/// connection is closed (or dropped) and the host is still routed `AutoTry`,
/// a clean connection that delivered data counts as a success for the path
/// it used. An errored one, or one that never delivered a byte, withholds
/// that success.
pub struct RoutedConnection {
    inner: Stream,
    addr: Address,
    host: String,
    state: RouteState,
    detector: Arc<Detector>,
    policy: Arc<dyn RoutingPolicy>,
    read_bytes: u64,
    last_error: Option<io::ErrorKind>,
    read_timeout: Duration,
    early_window: u64,
    deadline: Option<Pin<Box<Sleep>>>,
    /// A read is in flight and owns the current deadline
    read_pending: bool,
    reported: bool,
}

impl RoutedConnection {
    pub fn new(
        inner: Stream,
        addr: Address,
        state: RouteState,
        detector: Arc<Detector>,
        policy: Arc<dyn RoutingPolicy>,
    ) -> Self {
        Self {
            inner,
            host: addr.host(),
            addr,
            state,
            detector,
            policy,
            read_bytes: 0,
            last_error: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            early_window: DEFAULT_EARLY_WINDOW,
            deadline: None,
            read_pending: false,
            reported: false,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_early_window(mut self, bytes: u64) -> Self {
        self.early_window = bytes;
        self
    }

    pub fn state(&self) -> RouteState {
        self.state
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes
    }

    /// Error captured inside the early signal window, if any
    pub fn last_error(&self) -> Option<io::ErrorKind> {
        self.last_error
    }

    /// Report the outcome and shut the underlying stream down
    pub async fn close(mut self) -> io::Result<()> {
        self.report();
        self.inner.shutdown().await
    }

    fn on_read_error(&mut self, err: &io::Error) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            trace!("Read {} bytes from {} {}, EOF", self.read_bytes, self.addr, self.state.label());
            return;
        }
        if Detector::is_timeout_signal(err) {
            debug!("Read from {} {} timed out", self.addr, self.state.label());
            return;
        }
        if self.read_bytes > 0 && self.read_bytes <= self.early_window {
            debug!(
                "Read from {} {} failed after {} bytes: {}",
                self.addr,
                self.state.label(),
                self.read_bytes,
                err
            );
            self.last_error = Some(err.kind());
            metrics::EARLY_SIGNALS_TOTAL.inc();
        } else {
            trace!("Read from {} {} failed: {}", self.addr, self.state.label(), err);
        }
    }

    fn report(&mut self) {
        if self.reported {
            return;
        }
        self.reported = true;

        if self.policy.get_rule(&self.host).is_forced() {
            return;
        }

        let path = self.state.path();
        if self.read_bytes == 0 {
            // nothing delivered, so no evidence either way
            trace!("Closing {} connection to {} before any data", self.state.label(), self.addr);
            metrics::FEEDBACK_TOTAL.with_label_values(&[path, "withheld"]).inc();
            return;
        }

        match (self.state, self.last_error) {
            (RouteState::Initial, _) => {}
            (_, Some(kind)) => {
                debug!(
                    "Closing {} connection to {} after {:?}, success withheld",
                    self.state.label(),
                    self.addr,
                    kind
                );
                metrics::FEEDBACK_TOTAL.with_label_values(&[path, "withheld"]).inc();
            }
            (RouteState::Direct, None) => {
                trace!("{} reachable directly", self.host);
                self.detector.record_direct_success(&self.host);
                metrics::FEEDBACK_TOTAL.with_label_values(&[path, "success"]).inc();
            }
            (RouteState::Proxy, None) => {
                trace!("{} reachable through detour", self.host);
                self.detector.record_proxy_success(&self.host);
                metrics::FEEDBACK_TOTAL.with_label_values(&[path, "success"]).inc();
            }
        }
    }
}

impl Drop for RoutedConnection {
    fn drop(&mut self) {
        self.report();
    }
}

impl AsyncRead for RoutedConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.read_pending {
            let deadline = Instant::now() + this.read_timeout;
            match this.deadline.as_mut() {
                Some(sleep) => sleep.as_mut().reset(deadline),
                None => this.deadline = Some(Box::pin(tokio::time::sleep_until(deadline))),
            }
            this.read_pending = true;
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.read_pending = false;
                this.read_bytes += (buf.filled().len() - before) as u64;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.read_pending = false;
                this.on_read_error(&e);
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                let expired = this
                    .deadline
                    .as_mut()
                    .map(|sleep| sleep.as_mut().poll(cx).is_ready())
                    .unwrap_or(false);
                if !expired {
                    return Poll::Pending;
                }
                this.read_pending = false;
                let err = io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded");
                this.on_read_error(&err);
                Poll::Ready(Err(err))
            }
        }
    }
}

impl AsyncWrite for RoutedConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Connection for RoutedConnection {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

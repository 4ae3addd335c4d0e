//! Dispatcher - Core Execution Flow
//!
//! ```text
//! SOCKS5 handshake -> target Address
//!                        ↓
//!            RoutingEngine.dial_routed()
//!                        ↓
//!              SOCKS5 reply (real outcome)
//!                        ↓
//!               Bidirectional Relay
//!                        ↓
//!        RoutedConnection.close() -> feedback
//! ```
//!
//! Each connection is handled in a separate tokio task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::common::{Address, Network, Result, Stream};
use crate::detour::{RoutedConnection, RoutingEngine};
use crate::metrics::ConnectionMetrics;
use crate::protocol::socks5::{self, Socks5Server, REP_SUCCESS};

/// Relay buffer size (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Accepts SOCKS5 clients and relays them over routed connections
pub struct Dispatcher {
    engine: Arc<RoutingEngine>,
    socks: Socks5Server,
}

impl Dispatcher {
    pub fn new(engine: Arc<RoutingEngine>, socks: Socks5Server) -> Self {
        Self { engine, socks }
    }

    /// Serve one local client from handshake to close
    pub async fn dispatch(&self, mut inbound: Stream, source: Address) -> Result<()> {
        let start = Instant::now();

        let target = self.socks.accept(&mut inbound).await?;

        // zero timeout: the engine applies its configured dial timeouts
        let outbound = match self
            .engine
            .dial_routed(Network::Tcp, &target, Duration::ZERO)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                let _ = socks5::send_reply(&mut inbound, socks5::reply_code(&e)).await;
                return Err(e);
            }
        };
        socks5::send_reply(&mut inbound, REP_SUCCESS).await?;

        let state = outbound.state();
        let conn_metrics = ConnectionMetrics::new(state.path());
        info!("{} -> {} {}", source, target, state.label());

        let (outbound, up, down) = relay(inbound, outbound).await;
        conn_metrics.record_completion(up, down);

        let last_error = outbound.last_error();
        if let Err(e) = outbound.close().await {
            debug!("Close {} failed: {}", target, e);
        }

        info!(
            "Closed: {} -> {} {} (↑{} ↓{} {:?}){}",
            source,
            target,
            state.label(),
            format_bytes(up),
            format_bytes(down),
            start.elapsed(),
            last_error
                .map(|kind| format!(" early error: {:?}", kind))
                .unwrap_or_default()
        );

        Ok(())
    }
}

/// Relay data bidirectionally. Hands the routed connection back so the
/// caller can close it and report the outcome.
async fn relay(inbound: Stream, outbound: RoutedConnection) -> (RoutedConnection, u64, u64) {
    let (mut in_read, mut in_write) = tokio::io::split(inbound);
    let (mut out_read, mut out_write) = tokio::io::split(outbound);

    let (up, down) = tokio::join!(
        copy_half(&mut in_read, &mut out_write),
        copy_half(&mut out_read, &mut in_write)
    );

    (out_read.unsplit(out_write), up, down)
}

/// Copy until EOF or error on either side, then half-close the writer
async fn copy_half<R, W>(reader: &mut R, writer: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }

        total += n as u64;
    }

    let _ = writer.shutdown().await;
    total
}

/// Format bytes in human-readable form
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00MB");
    }
}

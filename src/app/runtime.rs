//! Runtime - Configuration-driven assembly and lifecycle
//!
//! The runtime is responsible for:
//! - Building the dialers, policy and routing engine from `Config`
//! - Starting the statistics persistence loop before the first dial
//! - Running the SOCKS5 inbound and the optional stats API
//! - Broadcasting shutdown and waiting for the final statistics flush

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::common::{Address, Result};
use crate::config::Config;
use crate::detour::{init_statistics, RoutingEngine, SiteStatistics};
use crate::error::Error;
use crate::metrics::init_metrics;
use crate::protocol::{Socks5Dialer, Socks5Server};
use crate::router::RoutingPolicy;
use crate::transport::{Dialer, Listener, RejectDialer, TcpDialer};

use super::dispatcher::Dispatcher;
use super::stats_api::start_api_server;

pub struct Runtime {
    config: Config,
    stats: Arc<SiteStatistics>,
    engine: Arc<RoutingEngine>,
    dispatcher: Arc<Dispatcher>,
    api_listen: Option<SocketAddr>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    pub fn from_config(config: Config) -> Result<Self> {
        init_metrics();
        let (shutdown_tx, _) = broadcast::channel(1);

        let direct: Arc<dyn Dialer> = Arc::new(TcpDialer::new());
        let proxy: Arc<dyn Dialer> = match &config.upstream {
            Some(upstream) => {
                info!("Proxy path: SOCKS5 relay at {}", upstream.server());
                Arc::new(Socks5Dialer::new(
                    upstream.server(),
                    upstream.socks5(),
                    direct.clone(),
                ))
            }
            None => {
                warn!("No upstream configured, detoured dials will fail");
                Arc::new(RejectDialer::new())
            }
        };

        let policy = config.build_policy()?;
        info!("Loaded {} routing rules", policy.len());
        let policy: Arc<dyn RoutingPolicy> = Arc::new(policy);

        let stats = Arc::new(SiteStatistics::with_stale_after(config.detour.stale_after_days));
        let engine = Arc::new(RoutingEngine::new(
            direct,
            proxy,
            policy,
            stats.clone(),
            config.detour.engine_config(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            engine.clone(),
            Socks5Server::new(config.inbound.socks5()),
        ));

        let api_listen = match &config.api {
            Some(api) => Some(parse_api_listen(&api.listen)?),
            None => None,
        };

        Ok(Self {
            config,
            stats,
            engine,
            dispatcher,
            api_listen,
            shutdown_tx,
        })
    }

    /// Override the stats API address (e.g. from the command line)
    pub fn with_api_listen(mut self, listen: &str) -> Result<Self> {
        self.api_listen = Some(parse_api_listen(listen)?);
        Ok(self)
    }

    pub fn engine(&self) -> &Arc<RoutingEngine> {
        &self.engine
    }

    pub fn stats(&self) -> &Arc<SiteStatistics> {
        &self.stats
    }

    /// Run until Ctrl+C
    pub async fn run(&self) -> Result<()> {
        let listener = TcpDialer::new()
            .bind(&Address::Socket(self.config.inbound.listen))
            .await?;

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await
    }

    /// Serve `listener` until `shutdown_signal` completes
    pub async fn serve<F>(&self, listener: Box<dyn Listener>, shutdown_signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        // statistics must be loaded before the first dial
        let persist_handle = init_statistics(
            self.stats.clone(),
            self.config.detour.stat_file.clone(),
            self.config.detour.save_interval(),
            self.shutdown_tx.subscribe(),
        );

        let api_handle = self.api_listen.map(|addr| {
            tokio::spawn(start_api_server(
                addr,
                self.stats.clone(),
                self.shutdown_tx.subscribe(),
            ))
        });

        let dispatcher = self.dispatcher.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let inbound_handle = tokio::spawn(async move {
            if let Err(e) = run_inbound(listener, dispatcher, &mut shutdown_rx).await {
                error!("Inbound error: {}", e);
            }
        });

        shutdown_signal.await;
        info!("Shutting down...");
        let _ = self.shutdown_tx.send(());

        let _ = inbound_handle.await;
        if let Some(handle) = api_handle {
            let _ = handle.await;
        }
        let _ = persist_handle.await;

        info!("Site statistics: {} hosts tracked", self.stats.len());
        Ok(())
    }
}

/// Accept local clients until shutdown
async fn run_inbound(
    listener: Box<dyn Listener>,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<()> {
    info!("SOCKS5 inbound listening on {}", listener.local_addr()?);

    let mut conn_count: u64 = 0;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, source)) => {
                        conn_count += 1;
                        let conn_id = conn_count;
                        debug!("New connection #{} from {}", conn_id, source);

                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            if let Err(e) = dispatcher.dispatch(stream, source.clone()).await {
                                warn!("Connection #{} from {} error: {}", conn_id, source, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Inbound shutting down (handled {} connections)", conn_count);
                break;
            }
        }
    }

    Ok(())
}

fn parse_api_listen(s: &str) -> Result<SocketAddr> {
    s.parse()
        .map_err(|_| Error::Config(format!("Invalid API listen address: {}", s)))
}

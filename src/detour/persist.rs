//! Load-then-persist lifecycle of the statistics table

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics;

use super::sitestat::{with_suffix, SiteStatistics, StatSnapshot};

pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Where the startup table came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    Backup,
    Empty,
}

/// Load `path`, then `<path>.bak`, then fall back to an empty table.
/// Never fails: a broken statistics file must not keep traffic from flowing.
pub fn load_with_fallback(stats: &SiteStatistics, path: &Path) -> LoadSource {
    let candidates = [
        (path.to_path_buf(), LoadSource::Primary),
        (with_suffix(path, ".bak"), LoadSource::Backup),
    ];

    for (candidate, source) in candidates {
        match stats.load(&candidate) {
            Ok(true) => return source,
            Ok(false) => debug!("No statistics at {:?}", candidate),
            Err(e) => warn!("Failed to load statistics: {}", e),
        }
    }

    stats.replace(StatSnapshot::default());
    LoadSource::Empty
}

/// Load the table, then save it every `interval` and once more when
/// `shutdown` fires. Must run before the first dial.
pub fn init_statistics(
    stats: Arc<SiteStatistics>,
    path: PathBuf,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let source = load_with_fallback(&stats, &path);
    info!(
        "Site statistics loaded from {:?} ({} hosts)",
        source,
        stats.len()
    );

    let interval = if interval.is_zero() {
        DEFAULT_SAVE_INTERVAL
    } else {
        interval
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    save_in_background(stats.clone(), path.clone()).await;
                }
                _ = shutdown.recv() => {
                    info!("Flushing site statistics to {:?}", path);
                    save_in_background(stats.clone(), path.clone()).await;
                    break;
                }
            }
        }
    })
}

/// Run a save on the blocking pool. Failures are logged and counted only.
async fn save_in_background(stats: Arc<SiteStatistics>, path: PathBuf) -> bool {
    match tokio::task::spawn_blocking(move || stats.save(&path)).await {
        Ok(Ok(())) => {
            metrics::STAT_SAVES_TOTAL.inc();
            true
        }
        Ok(Err(e)) => {
            warn!("Failed to save statistics: {}", e);
            metrics::STAT_SAVE_FAILURES_TOTAL.inc();
            false
        }
        Err(e) => {
            warn!("Statistics save task failed: {}", e);
            metrics::STAT_SAVE_FAILURES_TOTAL.inc();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_primary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat.json");

        let stats = SiteStatistics::new();
        stats.record_direct_success("a.example");
        stats.save(&path).unwrap();

        let loaded = SiteStatistics::new();
        assert_eq!(load_with_fallback(&loaded, &path), LoadSource::Primary);
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_fallback_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat.json");

        let stats = SiteStatistics::new();
        stats.record_proxy_success("a.example");
        stats.save(&path).unwrap();
        stats.save(&path).unwrap();
        fs::write(&path, b"garbage").unwrap();

        let loaded = SiteStatistics::new();
        assert_eq!(load_with_fallback(&loaded, &path), LoadSource::Backup);
        assert_eq!(loaded.get("a.example").unwrap().blocked, 1);
    }

    #[test]
    fn test_empty_when_nothing_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat.json");
        fs::write(&path, b"garbage").unwrap();
        fs::write(with_suffix(&path, ".bak"), br#"{"site_info": {"x": {"recent": "bad"}}}"#).unwrap();

        let loaded = SiteStatistics::new();
        assert_eq!(load_with_fallback(&loaded, &path), LoadSource::Empty);
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat.json");
        let stats = Arc::new(SiteStatistics::new());
        let (tx, rx) = broadcast::channel(1);

        let handle = init_statistics(stats.clone(), path.clone(), Duration::from_secs(3600), rx);
        stats.record_proxy_success("late.example");
        tx.send(()).unwrap();
        handle.await.unwrap();

        let reloaded = SiteStatistics::new();
        assert!(reloaded.load(&path).unwrap());
        assert_eq!(reloaded.get("late.example").unwrap().blocked, 1);
    }

    #[tokio::test]
    async fn test_periodic_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat.json");
        let stats = Arc::new(SiteStatistics::new());
        let (tx, rx) = broadcast::channel(1);

        let handle = init_statistics(stats.clone(), path.clone(), Duration::from_millis(50), rx);
        stats.record_direct_success("tick.example");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(path.exists());

        drop(tx);
        handle.await.unwrap();
    }
}

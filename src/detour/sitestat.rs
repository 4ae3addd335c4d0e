//! Shared per-host statistics table and its on-disk snapshot

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::metrics;

use super::visit::{date_format, today, VisitCounter};

/// On-disk form of the statistics table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatSnapshot {
    /// Day the snapshot was taken
    #[serde(with = "date_format", default = "today")]
    pub update: NaiveDate,
    #[serde(rename = "site_info", default)]
    pub sites: BTreeMap<String, VisitCounter>,
}

impl Default for StatSnapshot {
    fn default() -> Self {
        Self {
            update: today(),
            sites: BTreeMap::new(),
        }
    }
}

/// Thread-safe host -> counter map shared by every connection.
///
/// Entries are created lazily on the first outcome for a host and are never
/// removed while the process runs.
#[derive(Debug, Default)]
pub struct SiteStatistics {
    table: RwLock<HashMap<String, VisitCounter>>,
    /// Serializes `save` calls so two snapshots never race on the temp file
    save_lock: Mutex<()>,
    stale_after_days: Option<u32>,
}

impl SiteStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries untouched for more than `days` days when saving
    pub fn with_stale_after(days: Option<u32>) -> Self {
        Self {
            stale_after_days: days,
            ..Self::default()
        }
    }

    /// Current counters for `host`, if any outcome was ever recorded
    pub fn get(&self, host: &str) -> Option<VisitCounter> {
        self.table.read().get(host).copied()
    }

    /// Counters for `host`, creating a zeroed entry if missing. Concurrent
    /// callers for the same host all observe the same entry.
    pub fn get_or_create(&self, host: &str) -> VisitCounter {
        if let Some(vc) = self.table.read().get(host) {
            return *vc;
        }
        let mut table = self.table.write();
        let vc = *table.entry(host.to_string()).or_default();
        metrics::HOSTS_TRACKED.set(table.len() as i64);
        vc
    }

    pub fn record_direct_success(&self, host: &str) {
        self.update(host, VisitCounter::record_direct);
    }

    pub fn record_proxy_success(&self, host: &str) {
        self.update(host, VisitCounter::record_blocked);
    }

    fn update(&self, host: &str, f: impl FnOnce(&mut VisitCounter)) {
        let mut table = self.table.write();
        f(table.entry(host.to_string()).or_default());
        metrics::HOSTS_TRACKED.set(table.len() as i64);
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Consistent copy of the table. Zero-count and stale entries are left out.
    pub fn snapshot(&self) -> StatSnapshot {
        let now = today();
        let table = self.table.read();
        let sites = table
            .iter()
            .filter(|(_, vc)| !vc.is_empty())
            .filter(|(_, vc)| match self.stale_after_days {
                Some(days) => !vc.is_stale(now, days),
                None => true,
            })
            .map(|(host, vc)| (host.clone(), *vc))
            .collect();
        StatSnapshot { update: now, sites }
    }

    /// Replace the whole table with a loaded snapshot
    pub fn replace(&self, snapshot: StatSnapshot) {
        let table: HashMap<String, VisitCounter> = snapshot
            .sites
            .into_iter()
            .map(|(host, mut vc)| {
                vc.normalize();
                (host.to_ascii_lowercase(), vc)
            })
            .collect();
        metrics::HOSTS_TRACKED.set(table.len() as i64);
        *self.table.write() = table;
    }

    /// Write the table to `path`.
    ///
    /// The snapshot goes to `<path>.tmp` first. Once that is flushed the
    /// current file becomes `<path>.bak` and the temp file takes its place,
    /// so a crash at any step leaves either the live or the backup file
    /// intact.
    pub fn save(&self, path: &Path) -> Result<()> {
        let _guard = self.save_lock.lock();

        let snapshot = self.snapshot();
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| Error::persistence(path, io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let tmp = with_suffix(path, ".tmp");
        let bak = with_suffix(path, ".bak");

        write_synced(&tmp, &data).map_err(|e| Error::persistence(&tmp, e))?;
        remove_if_exists(&bak).map_err(|e| Error::persistence(&bak, e))?;
        match fs::rename(path, &bak) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::persistence(path, e)),
        }
        fs::rename(&tmp, path).map_err(|e| Error::persistence(path, e))?;

        debug!("Saved {} site entries to {:?}", snapshot.sites.len(), path);
        Ok(())
    }

    /// Load `path` into the table.
    ///
    /// Returns `Ok(false)` if the file does not exist, leaving the table
    /// untouched. A file that exists but cannot be parsed is an error.
    pub fn load(&self, path: &Path) -> Result<bool> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::persistence(path, e)),
        };

        let snapshot: StatSnapshot =
            serde_json::from_slice(&data).map_err(|e| Error::MalformedStats {
                path: path.to_path_buf(),
                source: e,
            })?;

        debug!("Loaded {} site entries from {:?}", snapshot.sites.len(), path);
        self.replace(snapshot);
        Ok(true)
    }
}

/// `path` with `suffix` appended to the full file name
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

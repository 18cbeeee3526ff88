//! Housekeeping for a directory of caches: each cache directory carries a
//! freshness marker, and once the whole set grows too large the stale ones
//! are deleted.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::fs::StoreDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PruneConfig {
    /// Caches untouched for longer than this are stale (default: 2 days)
    pub max_age_secs: u64,

    /// Nothing is deleted while all caches together stay at or below this
    /// size (default: 50MB)
    pub size_threshold: u64,

    /// File in each cache directory holding its last-used time
    pub marker_name: String,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 2 * 24 * 60 * 60,
            size_threshold: 50 * 1024 * 1024,
            marker_name: "stamp".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Size of all caches before pruning.
    pub total_bytes: u64,
    pub removed: Vec<String>,
    pub reclaimed_bytes: u64,
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

/// Marks `dir` as used at `now`.
pub async fn touch<D>(dir: &D, config: &PruneConfig, now: SystemTime) -> anyhow::Result<()>
where
    D: StoreDir,
{
    dir.mkdir().await?;
    dir.write(&config.marker_name, unix_secs(now).to_string().as_bytes())
        .await
}

/// Total size of the files under `dir`.
pub async fn dir_size<D>(dir: &D) -> anyhow::Result<u64>
where
    D: StoreDir,
{
    let mut total = 0;
    let mut pending = vec![dir.clone()];
    while let Some(dir) = pending.pop() {
        for name in dir.ls().await? {
            match dir.stat(&name).await? {
                Some(stat) if stat.is_dir => pending.push(dir.cd(&name)),
                Some(stat) => total += stat.len,
                None => {}
            }
        }
    }
    Ok(total)
}

async fn last_used<D>(dir: &D, config: &PruneConfig) -> anyhow::Result<Option<u64>>
where
    D: StoreDir,
{
    let Some(contents) = dir.read(&config.marker_name).await? else {
        return Ok(None);
    };
    Ok(std::str::from_utf8(&contents)
        .ok()
        .and_then(|s| s.trim().parse().ok()))
}

/// Deletes stale caches under `root` once they take up more than the size
/// threshold. A cache without a readable marker counts as stale.
pub async fn prune<D>(
    root: &D,
    config: &PruneConfig,
    now: SystemTime,
) -> anyhow::Result<PruneReport>
where
    D: StoreDir,
{
    let now = unix_secs(now);
    let mut caches = Vec::new();
    for name in root.ls().await? {
        if matches!(root.stat(&name).await?, Some(stat) if stat.is_dir) {
            let size = dir_size(&root.cd(&name)).await?;
            caches.push((name, size));
        }
    }

    let mut report = PruneReport {
        total_bytes: caches.iter().map(|(_, size)| size).sum(),
        ..Default::default()
    };
    if report.total_bytes <= config.size_threshold {
        debug!(total = report.total_bytes, "caches under threshold");
        return Ok(report);
    }

    for (name, size) in caches {
        let stale = match last_used(&root.cd(&name), config).await? {
            Some(stamp) => now.saturating_sub(stamp) > config.max_age_secs,
            None => true,
        };
        if stale && root.remove_dir(&name).await? {
            report.reclaimed_bytes += size;
            report.removed.push(name);
        }
    }
    info!(
        removed = report.removed.len(),
        reclaimed = report.reclaimed_bytes,
        total = report.total_bytes,
        "pruned caches"
    );
    Ok(report)
}

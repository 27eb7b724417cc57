//! Short-lived cache of finished downloads.
//!
//! Every download lands in its own `<root>/<download_id>/` directory. The
//! cache maps a normalized source URL plus the requested [`Variant`] to the
//! produced file, and remembers when it was created. Entries expire after a
//! fixed TTL; [`DownloadCache::sweep`] drops expired entries and deletes their
//! files. The index is mirrored to `<root>/download_cache.json` so a restart
//! can still clean up what the previous process left behind.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::Url;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::media::Variant;

pub const INDEX_FILE: &str = "download_cache.json";

/// Canonical form of a user supplied URL, used as the cache key.
///
/// Only absolute `http`/`https` URLs are accepted. Scheme and host are
/// lower-cased, the fragment is dropped and a trailing slash on a non-root
/// path is removed.
pub fn normalize_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("Please provide a URL.");
    }
    let mut url = Url::parse(trimmed).map_err(|_| anyhow!("Invalid URL: {trimmed}"))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        bail!("Invalid URL: {trimmed}");
    }
    url.set_fragment(None);
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    Ok(url.into())
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub url: String,
    pub variant: Variant,
}

impl CacheKey {
    pub fn new(raw_url: &str, variant: Variant) -> Result<Self> {
        Ok(Self {
            url: normalize_url(raw_url)?,
            variant,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub variant: Variant,
    pub download_id: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn key(&self) -> CacheKey {
        CacheKey {
            url: self.url.clone(),
            variant: self.variant,
        }
    }

    /// Path under which the HTTP layer serves this file.
    pub fn download_url(&self) -> String {
        format!("/file/{}/{}", self.download_id, self.file_name)
    }
}

#[derive(Default, Deserialize)]
struct CacheIndex {
    entries: Vec<CacheEntry>,
}

#[derive(Serialize)]
struct CacheIndexRef<'a> {
    entries: Vec<&'a CacheEntry>,
}

/// Outcome of one maintenance pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub orphans_removed: usize,
    pub remaining: usize,
}

pub struct DownloadCache {
    root: PathBuf,
    index_path: PathBuf,
    ttl: TimeDelta,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    /// Download ids handed out but not yet inserted or abandoned. Their
    /// directories are never treated as orphans.
    pending: Mutex<HashSet<String>>,
}

impl DownloadCache {
    /// Creates `root` if needed and loads the persisted index. A missing or
    /// unreadable index starts an empty cache.
    pub fn open(root: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_context(|| format!("creating {}", root.display()))?;
        let ttl = TimeDelta::from_std(ttl).context("cache TTL out of range")?;
        let index_path = root.join(INDEX_FILE);

        let entries = match fs::read_to_string(&index_path) {
            Ok(raw) => match serde_json::from_str::<CacheIndex>(&raw) {
                Ok(index) => index.entries,
                Err(err) => {
                    tracing::warn!(path = %index_path.display(), "ignoring corrupt cache index: {err}");
                    Vec::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                tracing::warn!(path = %index_path.display(), "could not read cache index: {err}");
                Vec::new()
            }
        };
        tracing::debug!(count = entries.len(), "loaded cache index");

        Ok(Self {
            root,
            index_path,
            ttl,
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|entry| (entry.key(), entry))
                    .collect(),
            ),
            pending: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns a fresh entry for `key`: younger than the TTL and still
    /// backed by a file on disk.
    pub fn lookup(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        let entry = self.entries.lock().get(key).cloned()?;
        if self.is_expired(&entry, now) {
            tracing::debug!(url = %key.url, variant = %key.variant.label(), "cache entry expired");
            return None;
        }
        if !entry.file_path.is_file() {
            tracing::debug!(url = %key.url, path = %entry.file_path.display(), "cached file vanished");
            return None;
        }
        Some(entry)
    }

    /// Allocates a download id and its directory path. The directory is
    /// protected from orphan pruning until [`insert`](Self::insert) or
    /// [`abandon`](Self::abandon) is called with the same id.
    pub fn reserve(&self) -> (String, PathBuf) {
        let download_id = Uuid::new_v4().to_string();
        self.pending.lock().insert(download_id.clone());
        let dir = self.root.join(&download_id);
        (download_id, dir)
    }

    /// Gives up on a reserved id and removes whatever was written for it.
    pub fn abandon(&self, download_id: &str) {
        self.pending.lock().remove(download_id);
        let dir = self.root.join(download_id);
        if let Err(err) = fs::remove_dir_all(&dir)
            && err.kind() != ErrorKind::NotFound
        {
            tracing::warn!(dir = %dir.display(), "could not remove abandoned download: {err}");
        }
    }

    /// Records a finished download, replacing any older entry for the same
    /// key, and persists the index.
    pub fn insert(&self, entry: CacheEntry) -> Result<()> {
        self.pending.lock().remove(&entry.download_id);
        let mut entries = self.entries.lock();
        tracing::info!(
            url = %entry.url,
            variant = %entry.variant.label(),
            file = %entry.file_path.display(),
            "cached download"
        );
        entries.insert(entry.key(), entry);
        self.persist(&entries)
    }

    /// Evicts entries older than the TTL (or whose file disappeared), deletes
    /// their files and empty download directories, and returns what was
    /// removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let removed: Vec<CacheEntry> = {
            let mut entries = self.entries.lock();
            let stale: Vec<CacheKey> = entries
                .iter()
                .filter(|(_, entry)| self.is_expired(entry, now) || !entry.file_path.exists())
                .map(|(key, _)| key.clone())
                .collect();
            let removed: Vec<CacheEntry> = stale
                .iter()
                .filter_map(|key| entries.remove(key))
                .collect();
            if !removed.is_empty()
                && let Err(err) = self.persist(&entries)
            {
                tracing::warn!("could not persist cache index after sweep: {err:#}");
            }
            removed
        };

        for entry in &removed {
            self.delete_files(entry);
        }
        removed
    }

    /// Removes download directories that no entry references and that are
    /// older than the TTL. These are left behind by crashes mid-download.
    pub fn prune_orphans(&self, now: DateTime<Utc>) -> usize {
        let referenced: HashSet<String> = self
            .entries
            .lock()
            .values()
            .map(|entry| entry.download_id.clone())
            .collect();
        let pending = self.pending.lock().clone();

        let mut removed = 0;
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if referenced.contains(&*name) || pending.contains(&*name) {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .map(DateTime::<Utc>::from);
            let old_enough = modified.is_some_and(|modified| now - modified >= self.ttl);
            if !old_enough {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    tracing::info!(dir = %entry.path().display(), "removed orphaned download directory");
                    removed += 1;
                }
                Err(err) => {
                    tracing::warn!(dir = %entry.path().display(), "could not remove orphan: {err}");
                }
            }
        }
        removed
    }

    /// One sweep plus one orphan pass.
    pub fn run_maintenance(&self, now: DateTime<Utc>) -> SweepReport {
        let evicted = self.sweep(now).len();
        let orphans_removed = self.prune_orphans(now);
        let report = SweepReport {
            evicted,
            orphans_removed,
            remaining: self.len(),
        };
        if report.evicted > 0 || report.orphans_removed > 0 {
            tracing::info!(
                evicted = report.evicted,
                orphans = report.orphans_removed,
                remaining = report.remaining,
                "cache sweep finished"
            );
        } else {
            tracing::debug!(remaining = report.remaining, "cache sweep found nothing to do");
        }
        report
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.created_at >= self.ttl
    }

    fn delete_files(&self, entry: &CacheEntry) {
        match fs::remove_file(&entry.file_path) {
            Ok(()) => tracing::info!(file = %entry.file_name, "removed expired download"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(file = %entry.file_path.display(), "could not remove expired file: {err}");
            }
        }

        let dir = self.root.join(&entry.download_id);
        let is_empty = fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty && let Err(err) = fs::remove_dir(&dir) {
            tracing::warn!(dir = %dir.display(), "could not remove download directory: {err}");
        }
    }

    fn persist(&self, entries: &HashMap<CacheKey, CacheEntry>) -> Result<()> {
        let mut list: Vec<&CacheEntry> = entries.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let payload = serde_json::to_vec_pretty(&CacheIndexRef { entries: list })?;
        let tmp_path = self.index_path.with_extension("tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.index_path)
            .with_context(|| format!("replacing {}", self.index_path.display()))?;
        Ok(())
    }
}

/// Runs [`DownloadCache::run_maintenance`] every `interval` on the blocking
/// pool. The first pass happens one interval after spawning.
pub fn spawn_sweeper(cache: Arc<DownloadCache>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let cache = cache.clone();
            if let Err(err) =
                tokio::task::spawn_blocking(move || cache.run_maintenance(Utc::now())).await
            {
                tracing::error!("cache sweep task failed: {err}");
            }
        }
    })
}

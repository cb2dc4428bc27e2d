//! Discovery cache persistence
//!
//! The cache holds the result of the last completed pass as a single JSON
//! document. It is replaced wholesale on every pass:
//! - The document is written to a temporary file next to the target and
//!   renamed into place, so readers never see a partial document
//! - If that fails (typically permissions), the write is retried once
//!   through `sudo -n install`
//!
//! Readers compute staleness at read time from the document timestamp.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::discovery::DiscoveryEntry;

/// Default age after which a cached pass is reported stale
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Elevated write to {path} failed after '{first}': {reason}")]
    ElevatedWriteFailed {
        path: String,
        first: String,
        reason: String,
    },
}

/// Persisted result of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryCache {
    /// Capture time, seconds since the Unix epoch
    pub timestamp: f64,
    /// Range specification the pass ran over
    pub range: String,
    /// One entry per expanded address, in expansion order
    pub entries: Vec<DiscoveryEntry>,
}

impl DiscoveryCache {
    /// Stamp a new document with the current time
    pub fn new(range: impl Into<String>, entries: Vec<DiscoveryEntry>) -> Self {
        Self {
            timestamp: now_secs(),
            range: range.into(),
            entries,
        }
    }

    pub fn entry(&self, ip: Ipv4Addr) -> Option<&DiscoveryEntry> {
        self.entries.iter().find(|e| e.ip() == ip)
    }

    /// Serial number captured for an address by this pass
    pub fn serial_for(&self, ip: Ipv4Addr) -> Option<&str> {
        self.entry(ip).and_then(DiscoveryEntry::serial)
    }

    /// Age of the document relative to `now` (seconds since epoch)
    pub fn age_secs(&self, now: f64) -> f64 {
        now - self.timestamp
    }

    pub fn is_stale_at(&self, now: f64, stale_after: Duration) -> bool {
        self.age_secs(now) > stale_after.as_secs_f64()
    }
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// A cached pass together with its read-time staleness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSnapshot {
    #[serde(flatten)]
    pub cache: DiscoveryCache,
    pub stale: bool,
}

/// Owner of the cache file
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
    stale_after: Duration,
    elevated_fallback: bool,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
            elevated_fallback: true,
        }
    }

    /// Disable the `sudo` retry (used where no elevated path exists)
    pub fn without_elevated_fallback(mut self) -> Self {
        self.elevated_fallback = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Read the last pass; a missing file is an empty, stale document
    pub fn read(&self) -> Result<CacheSnapshot, CacheError> {
        self.read_at(now_secs())
    }

    pub fn read_at(&self, now: f64) -> Result<CacheSnapshot, CacheError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No discovery cache yet");
                return Ok(CacheSnapshot {
                    cache: DiscoveryCache::default(),
                    stale: true,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let cache: DiscoveryCache = serde_json::from_str(&content)?;
        let stale = cache.is_stale_at(now, self.stale_after);
        Ok(CacheSnapshot { cache, stale })
    }

    /// Replace the cache with `cache`
    pub fn write(&self, cache: &DiscoveryCache) -> Result<(), CacheError> {
        let content = serde_json::to_string_pretty(cache)?;

        match self.write_atomic(content.as_bytes()) {
            Ok(()) => {}
            Err(e) if self.elevated_fallback => {
                warn!(path = %self.path.display(), error = %e, "Cache write failed, retrying with sudo");
                self.write_elevated(content.as_bytes(), &e.to_string())?;
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            path = %self.path.display(),
            entries = cache.entries.len(),
            "Wrote discovery cache"
        );
        Ok(())
    }

    fn write_atomic(&self, content: &[u8]) -> std::io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".ztpd-cache-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(content)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    fn write_elevated(&self, content: &[u8], first: &str) -> Result<(), CacheError> {
        let fail = |reason: String| CacheError::ElevatedWriteFailed {
            path: self.path.display().to_string(),
            first: first.to_string(),
            reason,
        };

        // Removed when dropped
        let staged =
            stage_for_install(&std::env::temp_dir(), content).map_err(|e| fail(e.to_string()))?;

        let output = Command::new("sudo")
            .args(["-n", "install", "-D", "-m", "0644"])
            .arg(staged.path())
            .arg(&self.path)
            .stdin(Stdio::null())
            .output();

        match output {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => Err(fail(String::from_utf8_lossy(&out.stderr).trim().to_string())),
            Err(e) => Err(fail(e.to_string())),
        }
    }
}

/// Write `content` to a freshly created, uniquely named file in `dir`
fn stage_for_install(dir: &Path, content: &[u8]) -> std::io::Result<NamedTempFile> {
    let mut staged = tempfile::Builder::new()
        .prefix("ztpd-cache-")
        .suffix(".json")
        .tempfile_in(dir)?;
    staged.write_all(content)?;
    staged.flush()?;
    Ok(staged)
}

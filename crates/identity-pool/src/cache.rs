//! Durable identity cache
//!
//! A JSON file `{ "ips": [...], "sessions": [{ "ip": ..., "port": ... }] }`.
//! `ips` is every identity the pool has claimed and not evicted; `sessions`
//! is the live pool snapshot. Sessions themselves are rebuilt on load.
//!
//! The pool rewrites the whole file on every bookkeeping change while holding
//! its state lock, so the file never names an entry the pool has dropped.
//! Writes go through a temp file + rename to survive crashes mid-write.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identity::{Identity, Tag};

/// On-disk cache layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub sessions: Vec<CachedSession>,
}

/// One live pool entry as persisted. `port` holds the entry's tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSession {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
}

impl CacheRecord {
    /// Snapshot pool bookkeeping. Output is sorted so identical state always
    /// produces an identical file.
    pub fn from_state(used: &HashSet<Identity>, live: &HashMap<Identity, Tag>) -> Self {
        let mut ips: Vec<String> = used.iter().map(|id| id.as_str().to_string()).collect();
        ips.sort();
        let mut sessions: Vec<CachedSession> = live
            .iter()
            .map(|(id, tag)| CachedSession {
                ip: id.as_str().to_string(),
                port: tag.value(),
            })
            .collect();
        sessions.sort_by(|a, b| a.ip.cmp(&b.ip));
        Self { ips, sessions }
    }

    /// Cached (identity, tag) pairs in file order.
    ///
    /// Records with an empty address or a zero tag are skipped, as are
    /// repeated addresses after their first occurrence.
    pub fn cached_identities(&self) -> Vec<(Identity, Tag)> {
        let mut seen = HashSet::new();
        self.sessions
            .iter()
            .filter(|s| !s.ip.is_empty() && s.port != 0)
            .filter(|s| seen.insert(s.ip.clone()))
            .map(|s| (Identity::new(s.ip.clone()), Tag::new(s.port)))
            .collect()
    }

    pub fn used_identities(&self) -> HashSet<Identity> {
        self.ips
            .iter()
            .filter(|ip| !ip.is_empty())
            .map(|ip| Identity::new(ip.clone()))
            .collect()
    }
}

/// File-backed cache store.
#[derive(Debug, Clone)]
pub struct IdentityCache {
    path: PathBuf,
}

impl IdentityCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cache.
    ///
    /// A missing file is a cold start: an empty cache is written and returned.
    pub async fn load(&self) -> Result<CacheRecord> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "cache file not found, starting empty");
            let record = CacheRecord::default();
            write_atomic(&self.path, &record).await?;
            return Ok(record);
        }
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Cache(format!("reading {}: {e}", self.path.display())))?;
        let record: CacheRecord = serde_json::from_str(&contents)
            .map_err(|e| Error::Cache(format!("parsing {}: {e}", self.path.display())))?;
        info!(
            path = %self.path.display(),
            sessions = record.sessions.len(),
            ips = record.ips.len(),
            "loaded identity cache"
        );
        Ok(record)
    }

    /// Overwrite the cache with `record`.
    pub async fn save(&self, record: &CacheRecord) -> Result<()> {
        write_atomic(&self.path, record).await
    }
}

/// Write the record to a temp file next to `path`, then rename over it.
///
/// Permissions are 0600 on unix: the file is a history of exit addresses.
async fn write_atomic(path: &Path, record: &CacheRecord) -> Result<()> {
    let json = serde_json::to_string_pretty(record)
        .map_err(|e| Error::Cache(format!("serializing cache: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Cache("cache path has no parent directory".into()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache".into());
    let tmp_path = dir.join(format!(".{name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Cache(format!("writing temp cache file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Cache(format!("setting cache file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Cache(format!("renaming temp cache file: {e}")))?;

    debug!(path = %path.display(), sessions = record.sessions.len(), "persisted identity cache");
    Ok(())
}

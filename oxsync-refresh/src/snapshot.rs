//! Point-in-time records of completed COPY cycles.
//!
//! Each snapshot is one `snapshot-<id>.json` file in the snapshot folder,
//! where `id` is the commit time in milliseconds. Ids only ever grow, so
//! name order is commit order and pruning removes from the front.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use oxsync_slo::{errors, Result};
use oxsync_storage::{fold, Attributes};

use crate::{
    config::UpdateMethod,
    report::{CycleError, CycleReport, Decision, Summary},
};

const PREFIX: &str = "snapshot-";
const SUFFIX: &str = ".json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(u64);

impl SnapshotId {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn file_name(&self) -> String {
        format!("{}{}{}", PREFIX, self.0, SUFFIX)
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        name.strip_prefix(PREFIX)?
            .strip_suffix(SUFFIX)?
            .parse()
            .ok()
            .map(Self)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub inum: String,
    pub dn: String,
    /// Hex sha256 of the mapped attributes.
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub cycle: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub update_method: UpdateMethod,
    pub summary: Summary,
    pub decisions: Vec<Decision>,
    pub errors: Vec<CycleError>,
    pub target: Vec<SnapshotEntry>,
}

/// Digest over folded names and sorted values, so attribute spelling and
/// value order do not change it.
pub fn digest(attributes: &Attributes) -> String {
    let canonical: BTreeMap<String, Vec<&str>> = attributes
        .iter()
        .map(|(name, values)| {
            let mut values: Vec<&str> = values.iter().map(String::as_str).collect();
            values.sort_unstable();
            (fold(name), values)
        })
        .collect();
    let mut hasher = Sha256::new();
    for (name, values) in &canonical {
        hasher.update(name.as_bytes());
        for value in values {
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
        }
        hasher.update([0xffu8]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct SnapshotManager {
    folder: PathBuf,
    max_count: usize,
}

impl SnapshotManager {
    pub fn new<P: Into<PathBuf>>(folder: P, max_count: usize) -> Self {
        Self {
            folder: folder.into(),
            max_count: max_count.max(1),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Writes the snapshot of `report` and returns its id.
    pub async fn commit(&self, report: &CycleReport) -> Result<SnapshotId> {
        tokio::fs::create_dir_all(&self.folder)
            .await
            .map_err(errors::any)?;

        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let id = match self.list().await?.last() {
            Some(last) if last.0 >= now => SnapshotId(last.0 + 1),
            _ => SnapshotId(now),
        };

        let snapshot = Snapshot {
            id,
            cycle: report.cycle,
            started_at: report.started_at,
            finished_at: report.finished_at,
            update_method: report.update_method,
            summary: report.summary,
            decisions: report.decisions.clone(),
            errors: report.errors.clone(),
            target: report
                .target
                .iter()
                .map(|t| SnapshotEntry {
                    inum: t.inum.clone(),
                    dn: t.dn.clone(),
                    digest: digest(&t.attributes),
                })
                .collect(),
        };
        let body = serde_json::to_vec_pretty(&snapshot).map_err(errors::any)?;

        let path = self.folder.join(id.file_name());
        let staging = self.folder.join(format!(".{}.tmp", id.file_name()));
        tokio::fs::write(&staging, &body)
            .await
            .map_err(errors::any)?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(errors::any)?;
        tracing::info!("snapshot {} written to {}", id, path.display());
        Ok(id)
    }

    /// Deletes the oldest snapshots until at most `max_count` remain and
    /// returns the removed ids.
    pub async fn prune(&self) -> Result<Vec<SnapshotId>> {
        let ids = self.list().await?;
        let excess = ids.len().saturating_sub(self.max_count);
        let mut removed = Vec::with_capacity(excess);
        for id in ids.into_iter().take(excess) {
            tokio::fs::remove_file(self.folder.join(id.file_name()))
                .await
                .map_err(errors::any)?;
            tracing::debug!("pruned snapshot {}", id);
            removed.push(id);
        }
        Ok(removed)
    }

    /// Snapshot ids, oldest first. A missing folder has no snapshots.
    pub async fn list(&self) -> Result<Vec<SnapshotId>> {
        let mut dir = match tokio::fs::read_dir(&self.folder).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(errors::any(e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(errors::any)? {
            if let Some(id) = entry.file_name().to_str().and_then(SnapshotId::from_file_name) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn load(&self, id: SnapshotId) -> Result<Snapshot> {
        let path = self.folder.join(id.file_name());
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(errors::not_found(&format!("snapshot {}", id)))
            }
            Err(e) => return Err(errors::any(e)),
        };
        serde_json::from_slice(&raw).map_err(errors::any)
    }

    pub async fn latest(&self) -> Result<Option<Snapshot>> {
        match self.list().await?.last() {
            Some(id) => self.load(*id).await.map(Some),
            None => Ok(None),
        }
    }
}

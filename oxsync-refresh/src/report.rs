use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use oxsync_storage::Attributes;

use crate::{config::UpdateMethod, snapshot::SnapshotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "RETAIN")]
    Retain,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "SKIP-EXTERNAL")]
    SkipExternal,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Self::Create,
        Self::Update,
        Self::Retain,
        Self::Delete,
        Self::SkipExternal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Retain => "RETAIN",
            Self::Delete => "DELETE",
            Self::SkipExternal => "SKIP-EXTERNAL",
        }
    }

    /// Whether executing the decision writes to a directory.
    pub fn writes(&self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Decided but not executed (VDS).
    Planned,
    Applied,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inum: Option<String>,
    /// Target person DN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dn: Option<String>,
    /// Destination attributes written by an UPDATE.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<String>,
}

/// Per-record and per-source failures. None of them aborts a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleError {
    #[error("source {name} unavailable: {reason}")]
    SourceUnavailable { name: String, reason: String },
    #[error("record {dn} from {name} has no value for key attribute {attribute}")]
    UnkeyableRecord {
        name: String,
        dn: String,
        attribute: String,
    },
    #[error("record {dn} from {name} repeats key [{key}] already taken by {first}")]
    DuplicateKeyConflict {
        name: String,
        dn: String,
        key: String,
        first: String,
    },
    #[error("{action} of {dn} failed: {reason}")]
    TargetWriteFailure {
        dn: String,
        action: Action,
        reason: String,
    },
    #[error("snapshot failed: {reason}")]
    SnapshotFailure { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub created: usize,
    pub updated: usize,
    pub retained: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rejected: usize,
}

impl Summary {
    fn count(&mut self, action: Action) {
        match action {
            Action::Create => self.created += 1,
            Action::Update => self.updated += 1,
            Action::Retain => self.retained += 1,
            Action::Delete => self.deleted += 1,
            Action::SkipExternal => self.skipped += 1,
        }
    }
}

/// Target entry as left by a COPY cycle, recorded in its snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetState {
    pub inum: String,
    pub dn: String,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub update_method: UpdateMethod,
    pub summary: Summary,
    pub decisions: Vec<Decision>,
    pub errors: Vec<CycleError>,
    /// Orphans were left alone because a source was not read in full.
    #[serde(default)]
    pub orphans_deferred: bool,
    /// Sources cut short by the search size limit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truncated_sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotId>,
    #[serde(skip)]
    pub target: Vec<TargetState>,
}

impl CycleReport {
    pub fn new(update_method: UpdateMethod) -> Self {
        let now = Utc::now();
        Self {
            cycle: now.timestamp_millis(),
            started_at: now,
            finished_at: now,
            update_method,
            summary: Summary::default(),
            decisions: Vec::new(),
            errors: Vec::new(),
            orphans_deferred: false,
            truncated_sources: Vec::new(),
            snapshot: None,
            target: Vec::new(),
        }
    }

    pub fn record(&mut self, decision: Decision) {
        match decision.outcome {
            Outcome::Failed => self.summary.failed += 1,
            Outcome::Planned | Outcome::Applied => self.summary.count(decision.action),
        }
        self.decisions.push(decision);
    }

    /// Records dropped before a decision (unkeyable or duplicate).
    pub fn reject(&mut self, err: CycleError) {
        self.summary.rejected += 1;
        self.errors.push(err);
    }

    pub fn error(&mut self, err: CycleError) {
        self.errors.push(err);
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    pub fn count(&self, action: Action) -> usize {
        self.decisions.iter().filter(|d| d.action == action).count()
    }

    /// Decisions that wrote to a directory.
    pub fn writes(&self) -> usize {
        self.decisions
            .iter()
            .filter(|d| d.outcome == Outcome::Applied && d.action.writes())
            .count()
    }
}

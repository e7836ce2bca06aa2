//! Cache refresh: pulls person entries from source directories, maps them
//! onto the target schema and reconciles them against the target directory.

pub mod config;
pub mod engine;
pub mod inum;
pub mod mapping;
pub mod matcher;
pub mod report;
pub mod snapshot;
pub mod source;

pub use config::{CacheRefreshConfiguration, KeyCasePolicy, UpdateMethod};
pub use engine::{ReconciliationEngine, Stores};
pub use mapping::{AttributeMapper, AttributeMapping, MappedRecord, Transform};
pub use matcher::{CorrelationKey, KeyMatcher, TargetIndex};
pub use report::{Action, CycleError, CycleReport, Decision, Outcome, Summary};
pub use snapshot::{Snapshot, SnapshotId, SnapshotManager};
pub use source::{RawRecord, SourceDirectory, SourceReader, SourceRecords};

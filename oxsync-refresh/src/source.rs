use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use futures_util::future::join_all;

use oxsync_slo::Result;
use oxsync_storage::{Attributes, Directory, Entry, Filter, LdapConfig};

use crate::{config::CacheRefreshConfiguration, report::CycleError};

/// An entry as read from one source, before mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub source: String,
    pub dn: String,
    pub attributes: Attributes,
}

/// A configured source directory and the store that reads it.
#[derive(Clone)]
pub struct SourceDirectory {
    pub name: String,
    pub base_dn: String,
    pub enabled: bool,
    pub directory: Arc<dyn Directory>,
}

impl fmt::Debug for SourceDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDirectory")
            .field("name", &self.name)
            .field("base_dn", &self.base_dn)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl SourceDirectory {
    pub fn new(config: &LdapConfig, directory: Arc<dyn Directory>) -> Self {
        Self {
            name: config.config_id.clone(),
            base_dn: config.base_dn().unwrap_or_default().to_owned(),
            enabled: config.enabled,
            directory,
        }
    }
}

/// Records of all sources, yielded source by source in configuration
/// order. Sources that could not be read are listed in `unavailable`,
/// sources cut short by the search size limit in `truncated`.
#[derive(Debug, Default)]
pub struct SourceRecords {
    batches: VecDeque<(String, std::vec::IntoIter<Entry>)>,
    unavailable: Vec<CycleError>,
    truncated: Vec<String>,
}

impl SourceRecords {
    pub fn unavailable(&self) -> &[CycleError] {
        &self.unavailable
    }

    pub fn truncated(&self) -> &[String] {
        &self.truncated
    }

    /// Every enabled source was read in full, so a target identity no
    /// record claims is a real orphan.
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty() && self.truncated.is_empty()
    }
}

impl Iterator for SourceRecords {
    type Item = RawRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (name, entries) = self.batches.front_mut()?;
            if let Some(entry) = entries.next() {
                return Some(RawRecord {
                    source: name.clone(),
                    dn: entry.dn,
                    attributes: entry.attributes,
                });
            }
            self.batches.pop_front();
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceReader {
    filter: Filter,
    attributes: Vec<String>,
    size_limit: Option<usize>,
    timeout: Duration,
}

impl SourceReader {
    pub fn new(config: &CacheRefreshConfiguration) -> Result<Self> {
        let mut filters: Vec<Filter> = config
            .key_object_classes
            .iter()
            .map(|class| Filter::equal("objectClass", class.trim()))
            .collect();
        if let Some(custom) = config.custom_filter()? {
            filters.push(custom);
        }
        Ok(Self {
            filter: Filter::and(filters),
            attributes: config.requested_attributes(),
            size_limit: config.size_limit(),
            timeout: config.source_timeout(),
        })
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Reads every enabled source concurrently. A failing source never
    /// stops the others.
    pub async fn read(&self, sources: &[SourceDirectory]) -> SourceRecords {
        let reads = sources
            .iter()
            .filter(|s| {
                if !s.enabled {
                    tracing::debug!("source {} is disabled", s.name);
                }
                s.enabled
            })
            .map(|s| async move { (s.name.clone(), self.read_one(s).await) });

        let mut records = SourceRecords::default();
        for (name, result) in join_all(reads).await {
            match result {
                Ok((entries, truncated)) => {
                    tracing::info!("source {} returned {} entries", name, entries.len());
                    if truncated {
                        records.truncated.push(name.clone());
                    }
                    records.batches.push_back((name, entries.into_iter()));
                }
                Err(err) => {
                    tracing::warn!("{}", err);
                    records.unavailable.push(err);
                }
            }
        }
        records
    }

    /// Entries of one source and whether the size limit cut them short.
    async fn read_one(&self, source: &SourceDirectory) -> Result<(Vec<Entry>, bool), CycleError> {
        let unavailable = |reason: String| CycleError::SourceUnavailable {
            name: source.name.clone(),
            reason,
        };
        let search = source.directory.search(
            &source.base_dn,
            &self.filter,
            &self.attributes,
            self.size_limit,
        );
        let mut entries = tokio::time::timeout(self.timeout, search)
            .await
            .map_err(|_| unavailable(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| unavailable(e.to_string()))?;
        let truncated = match self.size_limit {
            Some(limit) if entries.len() >= limit => {
                tracing::debug!(
                    "source {} reached the search size limit of {}, further entries are ignored",
                    source.name,
                    limit
                );
                entries.truncate(limit);
                true
            }
            _ => false,
        };
        Ok((entries, truncated))
    }
}

use std::{fmt, sync::Arc};

use oxsync_slo::{errors, hex_quads, Result};
use oxsync_storage::{Directory, Entry, Filter, Modification};

use crate::matcher::CorrelationKey;

pub const INUM_MAP_OBJECT_CLASS: &str = "gluuInumMap";
pub const INUM_DELIMITER: char = '!';
/// Type code of people inums.
pub const PEOPLE_TYPE: &str = "0000";

const STATUS_ACTIVE: &str = "active";
const STATUS_INACTIVE: &str = "inactive";
const MAX_MINT_ATTEMPTS: usize = 16;

/// Entry of the inum store binding a correlation key to an inum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InumMap {
    pub dn: String,
    pub inum: String,
    /// `primaryKeyAttrName`: key attribute names joined by `,`.
    pub key_names: String,
    /// `primaryKeyValue`: the stored correlation key.
    pub key_value: String,
    pub active: bool,
}

impl InumMap {
    fn from_entry(entry: &Entry) -> Option<Self> {
        let attrs = &entry.attributes;
        Some(Self {
            dn: entry.dn.clone(),
            inum: attrs.first("inum")?.to_owned(),
            key_names: attrs.first("primaryKeyAttrName")?.to_owned(),
            key_value: attrs.first("primaryKeyValue")?.to_owned(),
            active: !attrs
                .first("gluuStatus")
                .is_some_and(|s| s.eq_ignore_ascii_case(STATUS_INACTIVE)),
        })
    }

    fn to_entry(&self) -> Entry {
        Entry::new(self.dn.clone())
            .with("objectClass", ["top", INUM_MAP_OBJECT_CLASS])
            .with("inum", [self.inum.as_str()])
            .with("primaryKeyAttrName", [self.key_names.as_str()])
            .with("primaryKeyValue", [self.key_value.as_str()])
            .with("gluuStatus", [status(self.active)])
    }
}

fn status(active: bool) -> &'static str {
    if active {
        STATUS_ACTIVE
    } else {
        STATUS_INACTIVE
    }
}

/// Mints and tracks stable identity numbers in the inum store.
#[derive(Clone)]
pub struct InumService {
    directory: Arc<dyn Directory>,
    base_dn: String,
    org_inum: String,
    key_names: String,
}

impl fmt::Debug for InumService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InumService")
            .field("base_dn", &self.base_dn)
            .field("org_inum", &self.org_inum)
            .finish_non_exhaustive()
    }
}

impl InumService {
    pub fn new(
        directory: Arc<dyn Directory>,
        base_dn: &str,
        org_inum: &str,
        key_names: String,
    ) -> Self {
        Self {
            directory,
            base_dn: base_dn.to_owned(),
            org_inum: org_inum.trim().to_owned(),
            key_names,
        }
    }

    pub fn dn(&self, inum: &str) -> String {
        format!("inum={},{}", inum, self.base_dn)
    }

    /// Every well-formed inum map under the base DN, active or not.
    pub async fn load(&self) -> Result<Vec<InumMap>> {
        let entries = self
            .directory
            .search(
                &self.base_dn,
                &Filter::equal("objectClass", INUM_MAP_OBJECT_CLASS),
                &[],
                None,
            )
            .await?;
        Ok(entries
            .iter()
            .filter_map(|entry| {
                let map = InumMap::from_entry(entry);
                if map.is_none() {
                    tracing::warn!("skipping malformed inum map {}", entry.dn);
                }
                map
            })
            .collect())
    }

    fn mint(&self) -> String {
        let mut inum = String::with_capacity(self.org_inum.len() + 16);
        if !self.org_inum.is_empty() {
            inum.push_str(&self.org_inum);
            inum.push(INUM_DELIMITER);
        }
        inum.push_str(PEOPLE_TYPE);
        inum.push(INUM_DELIMITER);
        inum.push_str(&hex_quads(2));
        inum
    }

    /// Mints an unused inum and stores an active map for `key`.
    pub async fn allocate(&self, key: &CorrelationKey) -> Result<InumMap> {
        for _ in 0..MAX_MINT_ATTEMPTS {
            let inum = self.mint();
            let dn = self.dn(&inum);
            if self.directory.contains(&dn).await? {
                tracing::debug!("inum {} already taken", inum);
                continue;
            }
            let map = InumMap {
                dn,
                inum,
                key_names: self.key_names.clone(),
                key_value: key.stored(),
                active: true,
            };
            self.directory.persist(&map.to_entry()).await?;
            tracing::debug!("allocated inum {} for [{}]", map.inum, key);
            return Ok(map);
        }
        Err(errors::conflict(&format!(
            "no free inum after {} attempts",
            MAX_MINT_ATTEMPTS
        )))
    }

    pub async fn set_status(&self, map: &InumMap, active: bool) -> Result<()> {
        self.directory
            .merge(
                &map.dn,
                &[Modification::Replace {
                    name: "gluuStatus".to_owned(),
                    values: vec![status(active).to_owned()],
                }],
            )
            .await
    }
}

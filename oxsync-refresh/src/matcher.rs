use std::{
    collections::{HashMap, HashSet},
    fmt,
    hash::{Hash, Hasher},
};

use oxsync_storage::{fold, Entry};

use crate::{config::KeyCasePolicy, inum::InumMap, report::CycleError, source::RawRecord};

/// Joins key parts. Directory strings never carry the unit separator.
pub const KEY_SEPARATOR: char = '\u{1f}';

/// Composite correlation key. Equality and hashing use the normalized
/// value only; `parts` keeps the trimmed values in their original case.
#[derive(Debug, Clone)]
pub struct CorrelationKey {
    value: String,
    parts: Vec<String>,
}

impl CorrelationKey {
    fn build(parts: Vec<String>, policy: KeyCasePolicy) -> Self {
        let joined = parts.join(&KEY_SEPARATOR.to_string());
        let value = match policy {
            KeyCasePolicy::IgnoreCase => joined.to_lowercase(),
            KeyCasePolicy::Exact => joined,
        };
        Self { value, parts }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Form kept in the inum map's `primaryKeyValue`.
    pub fn stored(&self) -> String {
        self.parts.join(&KEY_SEPARATOR.to_string())
    }
}

impl PartialEq for CorrelationKey {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for CorrelationKey {}

impl Hash for CorrelationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parts.join(", "))
    }
}

/// Builds correlation keys and enforces first-wins on duplicates within one
/// cycle. A fresh matcher is used per cycle.
#[derive(Debug, Clone)]
pub struct KeyMatcher {
    attributes: Vec<String>,
    policy: KeyCasePolicy,
    admitted: HashMap<String, String>,
}

impl KeyMatcher {
    pub fn new(attributes: &[String], policy: KeyCasePolicy) -> Self {
        Self {
            attributes: attributes.iter().map(|a| a.trim().to_owned()).collect(),
            policy,
            admitted: HashMap::new(),
        }
    }

    /// Key attribute names as stored in `primaryKeyAttrName`.
    pub fn key_names(&self) -> String {
        self.attributes.join(",")
    }

    pub fn key(&self, raw: &RawRecord) -> Result<CorrelationKey, CycleError> {
        let mut parts = Vec::with_capacity(self.attributes.len());
        for attribute in &self.attributes {
            let value = raw
                .attributes
                .first(attribute)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| CycleError::UnkeyableRecord {
                    name: raw.source.clone(),
                    dn: raw.dn.clone(),
                    attribute: attribute.clone(),
                })?;
            parts.push(value.to_owned());
        }
        Ok(CorrelationKey::build(parts, self.policy))
    }

    /// Keys `raw` and claims the key for it. A key already claimed earlier in
    /// the cycle rejects the record.
    pub fn admit(&mut self, raw: &RawRecord) -> Result<CorrelationKey, CycleError> {
        let key = self.key(raw)?;
        if let Some(first) = self.admitted.get(key.value()) {
            return Err(CycleError::DuplicateKeyConflict {
                name: raw.source.clone(),
                dn: raw.dn.clone(),
                key: key.to_string(),
                first: first.clone(),
            });
        }
        self.admitted.insert(key.value().to_owned(), raw.dn.clone());
        Ok(key)
    }

    /// Rebuilds a key persisted in an inum map. Maps written for a different
    /// key definition yield `None`.
    pub fn from_stored(&self, names: &str, stored: &str) -> Option<CorrelationKey> {
        let names: Vec<String> = names.split(',').map(|n| fold(n.trim())).collect();
        let expected: Vec<String> = self.attributes.iter().map(|a| fold(a)).collect();
        if names != expected {
            return None;
        }
        let parts: Vec<String> = stored
            .split(KEY_SEPARATOR)
            .map(|p| p.trim().to_owned())
            .collect();
        if parts.len() != expected.len() || parts.iter().any(String::is_empty) {
            return None;
        }
        Some(CorrelationKey::build(parts, self.policy))
    }
}

/// A target identity: its inum map, its person entry, or both.
#[derive(Debug, Clone)]
pub struct TargetRef {
    slot: usize,
    pub key: Option<CorrelationKey>,
    pub map: Option<InumMap>,
    pub person: Option<Entry>,
}

impl TargetRef {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn inum(&self) -> Option<&str> {
        self.map
            .as_ref()
            .map(|m| m.inum.as_str())
            .or_else(|| self.person.as_ref().and_then(|p| p.attributes.first("inum")))
    }
}

/// Current target state keyed by correlation key.
#[derive(Debug, Clone, Default)]
pub struct TargetIndex {
    refs: Vec<TargetRef>,
    by_key: HashMap<String, usize>,
}

impl TargetIndex {
    /// Joins inum maps with target persons on `inum`. Active maps win a key
    /// over inactive ones; persons without a usable map stay unkeyed.
    pub fn build(matcher: &KeyMatcher, mut maps: Vec<InumMap>, persons: Vec<Entry>) -> Self {
        maps.sort_by(|a, b| b.active.cmp(&a.active).then_with(|| a.dn.cmp(&b.dn)));

        let mut index = Self::default();
        let mut by_inum = HashMap::new();
        for map in maps {
            let mut key = matcher.from_stored(&map.key_names, &map.key_value);
            if key.is_none() {
                tracing::warn!(
                    "inum map {} does not match key attributes {}",
                    map.dn,
                    matcher.key_names()
                );
            }
            if let Some(k) = &key {
                if index.by_key.contains_key(k.value()) {
                    tracing::warn!("inum map {} repeats key {}", map.dn, k);
                    key = None;
                }
            }
            let slot = index.refs.len();
            if let Some(k) = &key {
                index.by_key.insert(k.value().to_owned(), slot);
            }
            by_inum.insert(map.inum.to_lowercase(), slot);
            index.refs.push(TargetRef {
                slot,
                key,
                map: Some(map),
                person: None,
            });
        }

        let mut joined = HashSet::new();
        for person in persons {
            let inum = person.attributes.first("inum").map(str::to_lowercase);
            match inum.and_then(|i| by_inum.get(&i).copied()) {
                Some(slot) if joined.insert(slot) => index.refs[slot].person = Some(person),
                _ => {
                    let slot = index.refs.len();
                    index.refs.push(TargetRef {
                        slot,
                        key: None,
                        map: None,
                        person: Some(person),
                    });
                }
            }
        }
        index
    }

    pub fn correlate(&self, key: &CorrelationKey) -> Option<&TargetRef> {
        self.by_key.get(key.value()).map(|slot| &self.refs[*slot])
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetRef> {
        self.refs.iter()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

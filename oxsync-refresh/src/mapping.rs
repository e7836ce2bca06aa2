use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use oxsync_storage::{Attributes, Modification};

use crate::{matcher::CorrelationKey, source::RawRecord};

/// One `source -> destination` rule of `attributeMapping`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeMapping {
    #[serde(default)]
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub transform: Transform,
}

impl AttributeMapping {
    pub fn copy<S: Into<String>, D: Into<String>>(source: S, destination: D) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            transform: Transform::Copy,
        }
    }

    pub fn constant<D: Into<String>>(destination: D, values: Vec<String>) -> Self {
        Self {
            source: String::new(),
            destination: destination.into(),
            transform: Transform::Constant { values },
        }
    }

    pub fn key<D: Into<String>>(destination: D) -> Self {
        Self {
            source: String::new(),
            destination: destination.into(),
            transform: Transform::Key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transform {
    /// Source values as they are.
    #[default]
    Copy,
    /// Fixed values regardless of the source record.
    Constant { values: Vec<String> },
    /// The key attribute values the correlation key was built from.
    Key,
}

/// A source record after mapping: only mapping destinations are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRecord {
    pub source: String,
    pub source_dn: String,
    pub key: CorrelationKey,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Default)]
pub struct AttributeMapper {
    rules: Vec<AttributeMapping>,
}

impl AttributeMapper {
    pub fn new(rules: &[AttributeMapping]) -> Self {
        Self {
            rules: rules.to_vec(),
        }
    }

    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.destination.trim())
    }

    pub fn map(&self, raw: &RawRecord, key: CorrelationKey) -> MappedRecord {
        let mut attributes = Attributes::new();
        for rule in &self.rules {
            let values: Vec<String> = match &rule.transform {
                Transform::Copy => raw
                    .attributes
                    .get(rule.source.trim())
                    .unwrap_or_default()
                    .to_vec(),
                Transform::Constant { values } => values.clone(),
                Transform::Key => key.parts().to_vec(),
            };
            let values: Vec<String> = values
                .into_iter()
                .filter(|v| !v.trim().is_empty())
                .collect();
            // absent source attribute: the destination is left out entirely
            attributes.extend(rule.destination.trim(), &values);
        }
        MappedRecord {
            source: raw.source.clone(),
            source_dn: raw.dn.clone(),
            key,
            attributes,
        }
    }

    /// Modifications that bring the mapped destinations of `current` in line
    /// with `mapped`. Value lists compare as sets; attributes outside the
    /// mapping are never touched.
    pub fn diff(&self, mapped: &Attributes, current: &Attributes) -> Vec<Modification> {
        let mut changes = Vec::new();
        for destination in self.destinations() {
            match (mapped.get(destination), current.get(destination)) {
                (Some(wanted), Some(have)) if same_values(wanted, have) => {}
                (Some(wanted), _) => changes.push(Modification::Replace {
                    name: destination.to_owned(),
                    values: wanted.to_vec(),
                }),
                (None, Some(_)) => changes.push(Modification::Clear {
                    name: destination.to_owned(),
                }),
                (None, None) => {}
            }
        }
        changes
    }

    /// Projection of `attributes` onto the mapping destinations.
    pub fn project(&self, attributes: &Attributes) -> Attributes {
        let names: Vec<String> = self.destinations().map(str::to_owned).collect();
        if names.is_empty() {
            return Attributes::new();
        }
        attributes.project(&names)
    }
}

fn same_values(a: &[String], b: &[String]) -> bool {
    a.iter().map(String::as_str).collect::<BTreeSet<_>>()
        == b.iter().map(String::as_str).collect::<BTreeSet<_>>()
}

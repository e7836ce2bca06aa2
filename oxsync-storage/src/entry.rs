use std::collections::{btree_map, BTreeMap};

use serde::{Deserialize, Serialize};

/// Attribute names compare case-insensitively in directory schemas, so every
/// lookup goes through the folded name while the first spelling seen is kept
/// for output.
#[inline]
pub fn fold(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Normalized form of a distinguished name used as a lookup key: RDNs are
/// trimmed and the whole value is lower-cased.
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim())
        .filter(|rdn| !rdn.is_empty())
        .collect::<Vec<_>>()
        .join(",")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attribute {
    name: String,
    values: Vec<String>,
}

/// Multi-valued attribute bag keyed by case-folded attribute name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Vec<String>>",
    into = "BTreeMap<String, Vec<String>>"
)]
pub struct Attributes {
    inner: BTreeMap<String, Attribute>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(&fold(name))
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.inner.get(&fold(name)).map(|v| v.values.as_slice())
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    /// Replaces the values of `name`. An empty value list removes the
    /// attribute, matching directory semantics where an attribute without
    /// values does not exist.
    pub fn insert<S: Into<String>>(&mut self, name: S, values: Vec<String>) {
        let name = name.into();
        let key = fold(&name);
        if values.is_empty() {
            self.inner.remove(&key);
            return;
        }
        match self.inner.entry(key) {
            btree_map::Entry::Occupied(mut o) => o.get_mut().values = values,
            btree_map::Entry::Vacant(v) => {
                v.insert(Attribute { name, values });
            }
        }
    }

    /// Appends values to `name`, skipping ones already present.
    pub fn extend<S: Into<String>>(&mut self, name: S, values: &[String]) {
        let name = name.into();
        let attr = self
            .inner
            .entry(fold(&name))
            .or_insert_with(|| Attribute {
                name,
                values: Vec::new(),
            });
        for value in values {
            if !attr.values.contains(value) {
                attr.values.push(value.clone());
            }
        }
        if attr.values.is_empty() {
            let key = fold(&attr.name);
            self.inner.remove(&key);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.inner.remove(&fold(name)).map(|v| v.values)
    }

    /// Case-insensitive value membership, used for `objectClass` checks.
    pub fn has_value(&self, name: &str, value: &str) -> bool {
        self.get(name).is_some_and(|values| {
            values.iter().any(|v| v.eq_ignore_ascii_case(value))
        })
    }

    /// Keeps only the attributes whose folded name is listed.
    pub fn project(&self, names: &[String]) -> Self {
        if names.is_empty() || names.iter().any(|n| n == "*") {
            return self.clone();
        }
        let mut out = Self::new();
        for name in names {
            if let Some(attr) = self.inner.get(&fold(name)) {
                out.inner.insert(fold(name), attr.clone());
            }
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.inner
            .values()
            .map(|attr| (attr.name.as_str(), attr.values.as_slice()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.values().map(|attr| attr.name.as_str())
    }
}

impl<S: Into<String>> FromIterator<(S, Vec<String>)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (S, Vec<String>)>>(iter: T) -> Self {
        let mut attrs = Self::new();
        for (name, values) in iter {
            attrs.extend(name, &values);
        }
        attrs
    }
}

impl From<BTreeMap<String, Vec<String>>> for Attributes {
    fn from(value: BTreeMap<String, Vec<String>>) -> Self {
        value.into_iter().collect()
    }
}

impl From<Attributes> for BTreeMap<String, Vec<String>> {
    fn from(value: Attributes) -> Self {
        value
            .inner
            .into_values()
            .map(|attr| (attr.name, attr.values))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub dn: String,
    pub attributes: Attributes,
}

impl Entry {
    pub fn new<S: Into<String>>(dn: S) -> Self {
        Self {
            dn: dn.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with<S: Into<String>, V: Into<String>>(
        mut self,
        name: S,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect::<Vec<_>>();
        self.attributes.extend(name, &values);
        self
    }

    pub fn object_classes(&self) -> &[String] {
        self.attributes.get("objectClass").unwrap_or_default()
    }
}

/// A single change applied by [`crate::Directory::merge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Modification {
    Replace { name: String, values: Vec<String> },
    Clear { name: String },
}

impl Modification {
    pub fn name(&self) -> &str {
        match self {
            Self::Replace { name, .. } | Self::Clear { name } => name,
        }
    }

    pub fn apply(&self, attributes: &mut Attributes) {
        match self {
            Self::Replace { name, values } => {
                attributes.insert(name.as_str(), values.clone())
            }
            Self::Clear { name } => {
                attributes.remove(name);
            }
        }
    }
}

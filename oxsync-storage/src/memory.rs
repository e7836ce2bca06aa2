use std::{collections::BTreeMap, sync::RwLock};

use async_trait::async_trait;

use oxsync_slo::{errors, Result};

use crate::{normalize_dn, Directory, Entry, Filter, Modification};

/// Directory held entirely in process memory, keyed by normalized DN.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<I: IntoIterator<Item = Entry>>(entries: I) -> Self {
        let map = entries
            .into_iter()
            .map(|e| (normalize_dn(&e.dn), e))
            .collect();
        Self {
            entries: RwLock::new(map),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all entries in DN order.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        let entries = self.entries.read().map_err(errors::any)?;
        Ok(entries.values().cloned().collect())
    }

    pub fn get(&self, dn: &str) -> Option<Entry> {
        self.entries
            .read()
            .ok()
            .and_then(|e| e.get(&normalize_dn(dn)).cloned())
    }

    /// Inserts or replaces an entry without any existence check.
    pub fn put(&self, entry: Entry) -> Result<()> {
        let mut entries = self.entries.write().map_err(errors::any)?;
        entries.insert(normalize_dn(&entry.dn), entry);
        Ok(())
    }
}

fn under(dn: &str, base: &str) -> bool {
    base.is_empty() || dn == base || dn.ends_with(&format!(",{}", base))
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn find(&self, dn: &str) -> Result<Option<Entry>> {
        Ok(self.get(dn))
    }

    async fn search(
        &self,
        base_dn: &str,
        filter: &Filter,
        attributes: &[String],
        size_limit: Option<usize>,
    ) -> Result<Vec<Entry>> {
        let base = normalize_dn(base_dn);
        let entries = self.entries.read().map_err(errors::any)?;
        let limit = size_limit.unwrap_or(usize::MAX);
        Ok(entries
            .iter()
            .filter(|(dn, _)| under(dn, &base))
            .filter(|(_, e)| filter.matches(&e.attributes))
            .take(limit)
            .map(|(_, e)| Entry {
                dn: e.dn.clone(),
                attributes: e.attributes.project(attributes),
            })
            .collect())
    }

    async fn persist(&self, entry: &Entry) -> Result<()> {
        let mut entries = self.entries.write().map_err(errors::any)?;
        let key = normalize_dn(&entry.dn);
        if entries.contains_key(&key) {
            return Err(errors::conflict(&format!(
                "entry {} already exists",
                entry.dn
            )));
        }
        entries.insert(key, entry.clone());
        Ok(())
    }

    async fn merge(&self, dn: &str, changes: &[Modification]) -> Result<()> {
        let mut entries = self.entries.write().map_err(errors::any)?;
        let entry = entries
            .get_mut(&normalize_dn(dn))
            .ok_or_else(|| errors::not_found(&format!("entry {}", dn)))?;
        for change in changes {
            change.apply(&mut entry.attributes);
        }
        Ok(())
    }

    async fn remove(&self, dn: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(errors::any)?;
        entries
            .remove(&normalize_dn(dn))
            .map(|_| ())
            .ok_or_else(|| errors::not_found(&format!("entry {}", dn)))
    }

    async fn contains(&self, dn: &str) -> Result<bool> {
        let entries = self.entries.read().map_err(errors::any)?;
        Ok(entries.contains_key(&normalize_dn(dn)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(uid: &str) -> Entry {
        Entry::new(format!("uid={},ou=people,o=example", uid))
            .with("objectClass", ["top", "inetOrgPerson"])
            .with("uid", [uid])
            .with("mail", [format!("{}@example.com", uid)])
    }

    #[tokio::test]
    async fn search_scope_filter_limit() {
        let dir = MemoryDirectory::with_entries([
            person("alice"),
            person("bob"),
            person("carol"),
            Entry::new("uid=dave,ou=other,o=example").with("uid", ["dave"]),
        ]);
        let all = dir
            .search(
                "ou=People, o=Example",
                &Filter::present("uid"),
                &["uid".to_owned()],
                None,
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|e| !e.attributes.contains("mail")));

        let limited = dir
            .search("o=example", &Filter::present("uid"), &[], Some(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);

        let bob = dir
            .search("o=example", &Filter::equal("uid", "BOB"), &[], None)
            .await
            .unwrap();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].attributes.first("mail"), Some("bob@example.com"));
    }

    #[tokio::test]
    async fn write_lifecycle() {
        let dir = MemoryDirectory::new();
        let alice = person("alice");
        dir.persist(&alice).await.unwrap();
        assert!(dir.persist(&alice).await.is_err());
        assert!(dir.contains("UID=alice,ou=people,o=example").await.unwrap());

        dir.merge(
            &alice.dn,
            &[
                Modification::Replace {
                    name: "mail".to_owned(),
                    values: vec!["a@x.com".to_owned()],
                },
                Modification::Clear {
                    name: "uid".to_owned(),
                },
            ],
        )
        .await
        .unwrap();
        let found = dir.find(&alice.dn).await.unwrap().unwrap();
        assert_eq!(found.attributes.first("mail"), Some("a@x.com"));
        assert!(!found.attributes.contains("uid"));

        dir.remove(&alice.dn).await.unwrap();
        assert!(dir.remove(&alice.dn).await.unwrap_err().is_not_found());
        assert!(dir.merge(&alice.dn, &[]).await.is_err());
        assert!(dir.is_empty());
    }
}

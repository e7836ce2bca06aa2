use std::{collections::HashSet, fmt, sync::Arc};

use oxsync_slo::{errors, Result};
use oxsync_storage::{Directory, Entry, Filter, Modification};

use crate::{
    config::{CacheRefreshConfiguration, UpdateMethod},
    inum::{InumMap, InumService},
    mapping::{AttributeMapper, MappedRecord},
    matcher::{KeyMatcher, TargetIndex, TargetRef},
    report::{Action, CycleError, CycleReport, Decision, Outcome, TargetState},
    snapshot::SnapshotManager,
    source::{SourceDirectory, SourceReader},
};

/// Directory stores a cycle works against.
#[derive(Clone)]
pub struct Stores {
    pub sources: Vec<SourceDirectory>,
    pub inum: Arc<dyn Directory>,
    pub target: Arc<dyn Directory>,
}

impl fmt::Debug for Stores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stores")
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

/// Runs reconciliation cycles for one loaded configuration.
#[derive(Debug)]
pub struct ReconciliationEngine {
    config: CacheRefreshConfiguration,
    stores: Stores,
    reader: SourceReader,
    mapper: AttributeMapper,
    inums: InumService,
    snapshots: Option<SnapshotManager>,
    target_base: String,
    person_filter: Filter,
}

impl ReconciliationEngine {
    /// Validates `config`; an invalid configuration never reaches a
    /// directory.
    pub fn new(config: CacheRefreshConfiguration, stores: Stores) -> Result<Self> {
        config.check()?;
        let reader = SourceReader::new(&config)?;
        let mapper = AttributeMapper::new(&config.attribute_mapping);
        let base_of = |c: Option<&oxsync_storage::LdapConfig>| {
            c.and_then(|c| c.base_dn())
                .map(str::to_owned)
                .ok_or_else(|| errors::configuration_invalid("missing base DN"))
        };
        let target_base = base_of(config.target_config.as_ref())?;
        let inum_base = base_of(config.inum_config.as_ref())?;
        let key_names =
            KeyMatcher::new(&config.key_attributes, config.key_case_policy).key_names();
        let inums = InumService::new(
            Arc::clone(&stores.inum),
            &inum_base,
            &config.org_inum,
            key_names,
        );
        let snapshots = config.snapshot_manager();
        let person_filter = config
            .target_object_classes
            .iter()
            .find(|c| !c.eq_ignore_ascii_case("top"))
            .map(|c| Filter::equal("objectClass", c.as_str()))
            .unwrap_or_else(|| Filter::present("inum"));
        Ok(Self {
            config,
            stores,
            reader,
            mapper,
            inums,
            snapshots,
            target_base,
            person_filter,
        })
    }

    pub fn config(&self) -> &CacheRefreshConfiguration {
        &self.config
    }

    pub fn snapshots(&self) -> Option<&SnapshotManager> {
        self.snapshots.as_ref()
    }

    fn copy(&self) -> bool {
        self.config.update_method == UpdateMethod::Copy
    }

    fn person_dn(&self, inum: &str) -> String {
        format!("inum={},{}", inum, self.target_base)
    }

    /// One full cycle. Per-record and per-source problems end up in the
    /// report; only an unreadable target or inum store fails the cycle.
    #[tracing::instrument(skip(self), fields(method = %self.config.update_method))]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::new(self.config.update_method);
        tracing::info!("cache refresh cycle {} started", report.cycle);

        let records = self.reader.read(&self.stores.sources).await;
        for err in records.unavailable() {
            report.error(err.clone());
        }
        report.truncated_sources = records.truncated().to_vec();
        let complete = records.is_complete();

        let mut matcher =
            KeyMatcher::new(&self.config.key_attributes, self.config.key_case_policy);
        let index = self.load_index(&matcher).await?;
        tracing::debug!("target index holds {} identities", index.len());

        let mut seen = HashSet::new();
        for raw in records {
            let key = match matcher.admit(&raw) {
                Ok(key) => key,
                Err(err) => {
                    tracing::warn!("{}", err);
                    report.reject(err);
                    continue;
                }
            };
            let mapped = self.mapper.map(&raw, key);
            let target = index.correlate(&mapped.key);
            if let Some(target) = target {
                seen.insert(target.slot());
            }
            self.reconcile(&mut report, mapped, target).await;
        }

        if complete {
            for orphan in index
                .iter()
                .filter(|r| r.person.is_some() && !seen.contains(&r.slot()))
            {
                self.retire(&mut report, orphan).await;
            }
        } else {
            tracing::warn!("a source was not read in full, orphaned entries are kept this cycle");
            report.orphans_deferred = true;
        }

        report.finish();
        if let Some(snapshots) = &self.snapshots {
            self.snapshot(snapshots, &mut report).await;
        }
        let summary = &report.summary;
        tracing::info!(
            created = summary.created,
            updated = summary.updated,
            retained = summary.retained,
            deleted = summary.deleted,
            skipped = summary.skipped,
            failed = summary.failed,
            rejected = summary.rejected,
            "cache refresh cycle {} finished",
            report.cycle
        );
        Ok(report)
    }

    async fn load_index(&self, matcher: &KeyMatcher) -> Result<TargetIndex> {
        let maps = self.inums.load().await?;
        let persons = self
            .stores
            .target
            .search(&self.target_base, &self.person_filter, &[], None)
            .await?;
        Ok(TargetIndex::build(matcher, maps, persons))
    }

    async fn reconcile(
        &self,
        report: &mut CycleReport,
        mapped: MappedRecord,
        target: Option<&TargetRef>,
    ) {
        match target.and_then(|t| t.person.as_ref().map(|p| (t, p))) {
            Some((target, person)) => self.refresh(report, mapped, target, person).await,
            None => self.create(report, mapped, target.and_then(|t| t.map.as_ref())).await,
        }
    }

    async fn refresh(
        &self,
        report: &mut CycleReport,
        mapped: MappedRecord,
        target: &TargetRef,
        person: &Entry,
    ) {
        let changes = self.mapper.diff(&mapped.attributes, &person.attributes);
        let reactivate = target.map.as_ref().filter(|m| !m.active);
        let action = if changes.is_empty() && reactivate.is_none() {
            Action::Retain
        } else {
            Action::Update
        };
        let inum = target.inum().unwrap_or_default().to_owned();

        let outcome = if !self.copy() {
            Outcome::Planned
        } else if action == Action::Retain {
            Outcome::Applied
        } else {
            match self.update(&person.dn, &changes, reactivate).await {
                Ok(()) => Outcome::Applied,
                Err(err) => {
                    self.write_failed(report, &person.dn, action, err);
                    Outcome::Failed
                }
            }
        };
        if self.copy() {
            let attributes = match outcome {
                Outcome::Failed => self.mapper.project(&person.attributes),
                _ => mapped.attributes.clone(),
            };
            report.target.push(TargetState {
                inum: inum.clone(),
                dn: person.dn.clone(),
                attributes,
            });
        }
        report.record(Decision {
            action,
            outcome,
            key: mapped.key.parts().to_vec(),
            inum: Some(inum),
            dn: Some(person.dn.clone()),
            source_dn: Some(mapped.source_dn),
            changed: changes.iter().map(|c| c.name().to_owned()).collect(),
        });
    }

    async fn update(
        &self,
        dn: &str,
        changes: &[Modification],
        reactivate: Option<&InumMap>,
    ) -> Result<()> {
        if !changes.is_empty() {
            self.stores.target.merge(dn, changes).await?;
        }
        if let Some(map) = reactivate {
            self.inums.set_status(map, true).await?;
        }
        Ok(())
    }

    async fn create(&self, report: &mut CycleReport, mapped: MappedRecord, reuse: Option<&InumMap>) {
        let mut decision = Decision {
            action: Action::Create,
            outcome: Outcome::Planned,
            key: mapped.key.parts().to_vec(),
            inum: reuse.map(|m| m.inum.clone()),
            dn: reuse.map(|m| self.person_dn(&m.inum)),
            source_dn: Some(mapped.source_dn.clone()),
            changed: Vec::new(),
        };
        if !self.copy() {
            report.record(decision);
            return;
        }

        let map = match reuse {
            Some(map) if map.active => Ok(map.clone()),
            Some(map) => self.inums.set_status(map, true).await.map(|_| map.clone()),
            None => self.inums.allocate(&mapped.key).await,
        };
        let map = match map {
            Ok(map) => map,
            Err(err) => {
                let dn = decision.dn.clone().unwrap_or_else(|| mapped.source_dn.clone());
                self.write_failed(report, &dn, Action::Create, err);
                decision.outcome = Outcome::Failed;
                report.record(decision);
                return;
            }
        };

        let dn = self.person_dn(&map.inum);
        let mut entry = Entry::new(dn.clone())
            .with(
                "objectClass",
                self.config.target_object_classes.iter().map(String::as_str),
            )
            .with("inum", [map.inum.as_str()]);
        for (name, values) in mapped.attributes.iter() {
            entry.attributes.insert(name, values.to_vec());
        }
        decision.inum = Some(map.inum.clone());
        decision.dn = Some(dn.clone());
        decision.outcome = match self.stores.target.persist(&entry).await {
            Ok(()) => {
                report.target.push(TargetState {
                    inum: map.inum,
                    dn,
                    attributes: mapped.attributes,
                });
                Outcome::Applied
            }
            Err(err) => {
                self.write_failed(report, &dn, Action::Create, err);
                Outcome::Failed
            }
        };
        report.record(decision);
    }

    /// Handles a target identity no source record claimed this cycle.
    async fn retire(&self, report: &mut CycleReport, orphan: &TargetRef) {
        let Some(person) = orphan.person.as_ref() else {
            return;
        };
        let action = if self.config.keep_external_person {
            Action::SkipExternal
        } else {
            Action::Delete
        };
        let inum = orphan.inum().map(str::to_owned);

        let outcome = if !self.copy() {
            Outcome::Planned
        } else if action == Action::SkipExternal {
            Outcome::Applied
        } else {
            match self.delete(&person.dn, orphan.map.as_ref()).await {
                Ok(()) => Outcome::Applied,
                Err(err) => {
                    self.write_failed(report, &person.dn, action, err);
                    Outcome::Failed
                }
            }
        };
        if self.copy() && (action == Action::SkipExternal || outcome == Outcome::Failed) {
            report.target.push(TargetState {
                inum: inum.clone().unwrap_or_default(),
                dn: person.dn.clone(),
                attributes: self.mapper.project(&person.attributes),
            });
        }
        report.record(Decision {
            action,
            outcome,
            key: orphan
                .key
                .as_ref()
                .map(|k| k.parts().to_vec())
                .unwrap_or_default(),
            inum,
            dn: Some(person.dn.clone()),
            source_dn: None,
            changed: Vec::new(),
        });
    }

    async fn delete(&self, dn: &str, map: Option<&InumMap>) -> Result<()> {
        self.stores.target.remove(dn).await?;
        if let Some(map) = map.filter(|m| m.active) {
            self.inums.set_status(map, false).await?;
        }
        Ok(())
    }

    fn write_failed(
        &self,
        report: &mut CycleReport,
        dn: &str,
        action: Action,
        err: errors::WithBacktrace,
    ) {
        let err = CycleError::TargetWriteFailure {
            dn: dn.to_owned(),
            action,
            reason: err.to_string(),
        };
        tracing::warn!("{}", err);
        report.error(err);
    }

    async fn snapshot(&self, snapshots: &SnapshotManager, report: &mut CycleReport) {
        match snapshots.commit(report).await {
            Ok(id) => {
                report.snapshot = Some(id);
                if let Err(err) = snapshots.prune().await {
                    tracing::warn!("snapshot pruning failed, {}", err);
                    report.error(CycleError::SnapshotFailure {
                        reason: err.to_string(),
                    });
                }
            }
            Err(err) => {
                tracing::error!("snapshot commit failed, {}", err);
                report.error(CycleError::SnapshotFailure {
                    reason: err.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use oxsync_slo::errors::Code;
    use oxsync_storage::{MemoryDirectory, MockDirectory};
    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::tests::{copy_config, ldap},
        mapping::AttributeMapping,
    };

    const SOURCE_BASE: &str = "ou=people,o=source";
    const TARGET_BASE: &str = "ou=people,o=gluu";

    fn person(uid: &str, mail: &str) -> Entry {
        Entry::new(format!("uid={},{}", uid, SOURCE_BASE))
            .with("objectClass", ["top", "inetOrgPerson"])
            .with("uid", [uid])
            .with("mail", [mail])
    }

    struct Fixture {
        dir: TempDir,
        config: CacheRefreshConfiguration,
        source: Arc<MemoryDirectory>,
        inum: Arc<MemoryDirectory>,
        target: Arc<MemoryDirectory>,
    }

    impl Fixture {
        fn new(people: &[(&str, &str)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = copy_config(&dir.path().join("snapshots"));
            Self {
                config,
                dir,
                source: Arc::new(MemoryDirectory::with_entries(
                    people.iter().map(|(uid, mail)| person(uid, mail)),
                )),
                inum: Arc::new(MemoryDirectory::new()),
                target: Arc::new(MemoryDirectory::new()),
            }
        }

        fn stores(&self) -> Stores {
            Stores {
                sources: vec![SourceDirectory::new(
                    &self.config.source_configs[0],
                    Arc::clone(&self.source) as Arc<dyn Directory>,
                )],
                inum: Arc::clone(&self.inum) as Arc<dyn Directory>,
                target: Arc::clone(&self.target) as Arc<dyn Directory>,
            }
        }

        fn engine(&self) -> ReconciliationEngine {
            ReconciliationEngine::new(self.config.clone(), self.stores()).unwrap()
        }

        async fn cycle(&self) -> CycleReport {
            self.engine().run_cycle().await.unwrap()
        }

        fn persons(&self) -> Vec<Entry> {
            self.target
                .entries()
                .unwrap()
                .into_iter()
                .filter(|e| e.attributes.has_value("objectClass", "gluuPerson"))
                .collect()
        }

        fn person_by_uid(&self, uid: &str) -> Option<Entry> {
            self.persons()
                .into_iter()
                .find(|e| e.attributes.first("uid") == Some(uid))
        }

        async fn maps(&self) -> Vec<InumMap> {
            InumService::new(
                Arc::clone(&self.inum) as Arc<dyn Directory>,
                "ou=people,o=site",
                "",
                "uid".to_owned(),
            )
            .load()
            .await
            .unwrap()
        }

        fn snapshot_count(&self) -> usize {
            std::fs::read_dir(self.dir.path().join("snapshots"))
                .map(|d| d.count())
                .unwrap_or_default()
        }
    }

    fn actions(report: &CycleReport) -> Vec<Action> {
        report.decisions.iter().map(|d| d.action).collect()
    }

    #[tokio::test]
    async fn copy_cycles_are_idempotent() {
        let fx = Fixture::new(&[("alice", "a@x.com"), ("bob", "b@x.com")]);

        let first = fx.cycle().await;
        assert_eq!(actions(&first), [Action::Create, Action::Create]);
        assert!(first.errors.is_empty());
        assert_eq!(fx.persons().len(), 2);
        assert_eq!(fx.maps().await.len(), 2);
        assert_eq!(fx.snapshot_count(), 1);
        assert!(first.snapshot.is_some());

        let alice = fx.person_by_uid("alice").unwrap();
        let inum = alice.attributes.first("inum").unwrap().to_owned();
        assert!(inum.starts_with("@!1111!0000!"));
        assert_eq!(alice.dn, format!("inum={},{}", inum, TARGET_BASE));
        assert_eq!(alice.attributes.first("mail"), Some("a@x.com"));

        let second = fx.cycle().await;
        assert_eq!(actions(&second), [Action::Retain, Action::Retain]);
        assert_eq!(second.writes(), 0);
        assert_eq!(fx.snapshot_count(), 2);
        assert_eq!(
            fx.person_by_uid("alice").unwrap().attributes.first("inum"),
            Some(inum.as_str())
        );
    }

    #[tokio::test]
    async fn removed_source_record_is_deleted_then_recreated_with_same_inum() {
        let fx = Fixture::new(&[("alice", "a@x.com"), ("bob", "b@x.com")]);
        fx.cycle().await;
        let bob_inum = fx
            .person_by_uid("bob")
            .unwrap()
            .attributes
            .first("inum")
            .unwrap()
            .to_owned();

        fx.source
            .remove(&format!("uid=bob,{}", SOURCE_BASE))
            .await
            .unwrap();
        let report = fx.cycle().await;
        let delete: Vec<_> = report
            .decisions
            .iter()
            .filter(|d| d.action == Action::Delete)
            .collect();
        assert_eq!(delete.len(), 1);
        assert_eq!(delete[0].inum.as_deref(), Some(bob_inum.as_str()));
        assert_eq!(delete[0].outcome, Outcome::Applied);
        assert!(fx.person_by_uid("bob").is_none());
        let maps = fx.maps().await;
        assert!(maps.iter().any(|m| m.inum == bob_inum && !m.active));

        fx.source.put(person("bob", "b@x.com")).unwrap();
        let report = fx.cycle().await;
        let create: Vec<_> = report
            .decisions
            .iter()
            .filter(|d| d.action == Action::Create)
            .collect();
        assert_eq!(create.len(), 1);
        assert_eq!(create[0].inum.as_deref(), Some(bob_inum.as_str()));
        assert!(fx.maps().await.iter().all(|m| m.active));
        assert_eq!(fx.maps().await.len(), 2);
    }

    #[tokio::test]
    async fn keep_external_person_skips_orphans() {
        let mut fx = Fixture::new(&[("alice", "a@x.com"), ("bob", "b@x.com")]);
        fx.config.keep_external_person = true;
        fx.cycle().await;
        fx.target
            .put(
                Entry::new(format!("inum=LOCAL,{}", TARGET_BASE))
                    .with("objectClass", ["top", "gluuPerson"])
                    .with("inum", ["LOCAL"])
                    .with("uid", ["admin"]),
            )
            .unwrap();
        fx.source
            .remove(&format!("uid=bob,{}", SOURCE_BASE))
            .await
            .unwrap();

        let report = fx.cycle().await;
        assert_eq!(report.count(Action::SkipExternal), 2);
        assert_eq!(report.count(Action::Delete), 0);
        assert_eq!(report.count(Action::Retain), 1);
        assert_eq!(fx.persons().len(), 3);

        fx.config.keep_external_person = false;
        let report = fx.cycle().await;
        assert_eq!(report.count(Action::Delete), 2);
        assert_eq!(fx.persons().len(), 1);
    }

    #[tokio::test]
    async fn update_touches_mapped_attributes_only() {
        let fx = Fixture::new(&[("alice", "a@x.com")]);
        fx.cycle().await;
        let alice = fx.person_by_uid("alice").unwrap();
        fx.target
            .merge(
                &alice.dn,
                &[Modification::Replace {
                    name: "description".to_owned(),
                    values: vec!["curated".to_owned()],
                }],
            )
            .await
            .unwrap();
        fx.source.put(person("alice", "alice@x.com")).unwrap();

        let report = fx.cycle().await;
        assert_eq!(actions(&report), [Action::Update]);
        assert_eq!(report.decisions[0].changed, ["mail"]);
        let alice = fx.person_by_uid("alice").unwrap();
        assert_eq!(alice.attributes.first("mail"), Some("alice@x.com"));
        assert_eq!(alice.attributes.first("description"), Some("curated"));

        fx.source
            .put(
                Entry::new(format!("uid=alice,{}", SOURCE_BASE))
                    .with("objectClass", ["inetOrgPerson"])
                    .with("uid", ["alice"]),
            )
            .unwrap();
        let report = fx.cycle().await;
        assert_eq!(actions(&report), [Action::Update]);
        let alice = fx.person_by_uid("alice").unwrap();
        assert!(!alice.attributes.contains("mail"));
        assert_eq!(alice.attributes.first("description"), Some("curated"));

        assert_eq!(actions(&fx.cycle().await), [Action::Retain]);
    }

    #[tokio::test]
    async fn duplicate_and_unkeyable_records_are_rejected() {
        let mut fx = Fixture::new(&[("alice", "a@x.com")]);
        fx.source
            .put(
                Entry::new(format!("cn=nouid,{}", SOURCE_BASE))
                    .with("objectClass", ["inetOrgPerson"])
                    .with("mail", ["n@x.com"]),
            )
            .unwrap();
        let second = Arc::new(MemoryDirectory::with_entries([
            person("ALICE", "other@x.com"),
            person("carol", "c@x.com"),
        ]));
        fx.config
            .source_configs
            .push(ldap("second", SOURCE_BASE));
        let mut stores = fx.stores();
        stores.sources.push(SourceDirectory::new(
            &fx.config.source_configs[1],
            Arc::clone(&second) as Arc<dyn Directory>,
        ));

        let engine = ReconciliationEngine::new(fx.config.clone(), stores).unwrap();
        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.count(Action::Create), 2);
        assert_eq!(report.summary.rejected, 2);
        assert!(report.errors.iter().any(|e| matches!(
            e,
            CycleError::DuplicateKeyConflict { name, first, .. }
                if name == "second" && first == &format!("uid=alice,{}", SOURCE_BASE)
        )));
        assert!(report.errors.iter().any(|e| matches!(
            e,
            CycleError::UnkeyableRecord { attribute, .. } if attribute == "uid"
        )));
        assert_eq!(
            fx.person_by_uid("alice").unwrap().attributes.first("mail"),
            Some("a@x.com")
        );
    }

    #[tokio::test]
    async fn unavailable_source_defers_orphans() {
        let mut fx = Fixture::new(&[("alice", "a@x.com"), ("bob", "b@x.com")]);
        fx.cycle().await;

        let mut broken = MockDirectory::new();
        broken
            .expect_search()
            .returning(|_, _, _, _| Err(errors::bad_request("connection refused")));
        fx.config.source_configs.push(ldap("broken", SOURCE_BASE));
        fx.source
            .remove(&format!("uid=bob,{}", SOURCE_BASE))
            .await
            .unwrap();
        let mut stores = fx.stores();
        stores.sources.push(SourceDirectory::new(
            &fx.config.source_configs[1],
            Arc::new(broken),
        ));

        let engine = ReconciliationEngine::new(fx.config.clone(), stores).unwrap();
        let report = engine.run_cycle().await.unwrap();
        assert!(report.orphans_deferred);
        assert_eq!(actions(&report), [Action::Retain]);
        assert!(matches!(
            &report.errors[0],
            CycleError::SourceUnavailable { name, .. } if name == "broken"
        ));
        assert_eq!(fx.persons().len(), 2);
    }

    #[tokio::test]
    async fn size_limited_source_defers_orphans() {
        let people = [
            ("u1", "1@x.com"),
            ("u2", "2@x.com"),
            ("u3", "3@x.com"),
            ("u4", "4@x.com"),
            ("u5", "5@x.com"),
        ];
        let mut fx = Fixture::new(&people);
        assert_eq!(fx.cycle().await.summary.created, 5);

        fx.config.use_search_limit = true;
        fx.config.ldap_search_size_limit = 3;
        let report = fx.cycle().await;
        assert_eq!(report.summary.retained, 3);
        assert_eq!(report.summary.deleted, 0);
        assert!(report.orphans_deferred);
        assert_eq!(report.truncated_sources, ["source"]);
        assert!(report.errors.is_empty());
        assert_eq!(fx.persons().len(), 5);
        assert!(fx.maps().await.iter().all(|m| m.active));

        fx.config.ldap_search_size_limit = 10;
        let report = fx.cycle().await;
        assert_eq!(report.summary.retained, 5);
        assert!(!report.orphans_deferred);
        assert!(report.truncated_sources.is_empty());
    }

    #[tokio::test]
    async fn vds_repeats_the_same_plan() {
        let mut fx = Fixture::new(&[("alice", "a@x.com"), ("bob", "b@x.com")]);
        fx.config.update_method = UpdateMethod::Vds;

        let first = fx.cycle().await;
        let second = fx.cycle().await;
        assert_eq!(actions(&first), [Action::Create, Action::Create]);
        assert_eq!(actions(&second), actions(&first));
        assert!(second.decisions.iter().all(|d| d.outcome == Outcome::Planned));
        assert!(fx.persons().is_empty());
        assert!(fx.maps().await.is_empty());
    }

    /// Memory target that refuses to add entries carrying a given uid.
    #[derive(Debug)]
    struct Refusing {
        inner: MemoryDirectory,
        uid: String,
    }

    #[async_trait]
    impl Directory for Refusing {
        async fn find(&self, dn: &str) -> Result<Option<Entry>> {
            self.inner.find(dn).await
        }
        async fn search(
            &self,
            base_dn: &str,
            filter: &Filter,
            attributes: &[String],
            size_limit: Option<usize>,
        ) -> Result<Vec<Entry>> {
            self.inner.search(base_dn, filter, attributes, size_limit).await
        }
        async fn persist(&self, entry: &Entry) -> Result<()> {
            if entry.attributes.first("uid") == Some(self.uid.as_str()) {
                return Err(errors::bad_request("constraint violation"));
            }
            self.inner.persist(entry).await
        }
        async fn merge(&self, dn: &str, changes: &[Modification]) -> Result<()> {
            self.inner.merge(dn, changes).await
        }
        async fn remove(&self, dn: &str) -> Result<()> {
            self.inner.remove(dn).await
        }
        async fn contains(&self, dn: &str) -> Result<bool> {
            self.inner.contains(dn).await
        }
    }

    #[tokio::test]
    async fn failed_write_is_isolated_and_retried_next_cycle() {
        let fx = Fixture::new(&[("alice", "a@x.com"), ("bob", "b@x.com")]);
        let refusing = Arc::new(Refusing {
            inner: MemoryDirectory::new(),
            uid: "bob".to_owned(),
        });
        let mut stores = fx.stores();
        stores.target = Arc::clone(&refusing) as Arc<dyn Directory>;

        let engine = ReconciliationEngine::new(fx.config.clone(), stores.clone()).unwrap();
        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.summary.created, 1);
        assert_eq!(report.summary.failed, 1);
        assert!(matches!(
            &report.errors[..],
            [CycleError::TargetWriteFailure { action: Action::Create, .. }]
        ));
        assert_eq!(refusing.inner.len(), 1);
        let bob_inum = report
            .decisions
            .iter()
            .find(|d| d.outcome == Outcome::Failed)
            .and_then(|d| d.inum.clone())
            .unwrap();

        stores.target = Arc::new(MemoryDirectory::with_entries(refusing.inner.entries().unwrap()));
        let engine = ReconciliationEngine::new(fx.config.clone(), stores).unwrap();
        let report = engine.run_cycle().await.unwrap();
        let create: Vec<_> = report
            .decisions
            .iter()
            .filter(|d| d.action == Action::Create)
            .collect();
        assert_eq!(create.len(), 1);
        assert_eq!(create[0].inum.as_deref(), Some(bob_inum.as_str()));
        assert_eq!(report.count(Action::Retain), 1);
        assert_eq!(fx.maps().await.len(), 2);
    }

    #[tokio::test]
    async fn vds_never_writes() {
        let mut fx = Fixture::new(&[("alice", "a@x.com"), ("bob", "b@x.com")]);
        fx.config.update_method = UpdateMethod::Vds;

        let mut target = MockDirectory::new();
        target.expect_search().times(1).returning(|_, _, _, _| {
            Ok(vec![Entry::new(format!("inum=LOCAL,{}", TARGET_BASE))
                .with("objectClass", ["gluuPerson"])
                .with("inum", ["LOCAL"])])
        });
        let mut inum = MockDirectory::new();
        inum.expect_search()
            .times(1)
            .returning(|_, _, _, _| Ok(Vec::new()));

        let mut stores = fx.stores();
        stores.target = Arc::new(target);
        stores.inum = Arc::new(inum);
        let engine = ReconciliationEngine::new(fx.config.clone(), stores).unwrap();
        assert!(engine.snapshots().is_none());

        let report = engine.run_cycle().await.unwrap();
        assert_eq!(
            actions(&report),
            [Action::Create, Action::Create, Action::Delete]
        );
        assert!(report.decisions.iter().all(|d| d.outcome == Outcome::Planned));
        assert_eq!(report.summary.created, 2);
        assert_eq!(report.writes(), 0);
        assert!(report.snapshot.is_none());
        assert_eq!(fx.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn invalid_configuration_touches_no_directory() {
        let mut fx = Fixture::new(&[("alice", "a@x.com")]);
        fx.config.key_attributes.clear();
        let stores = Stores {
            sources: vec![SourceDirectory::new(
                &fx.config.source_configs[0],
                Arc::new(MockDirectory::new()),
            )],
            inum: Arc::new(MockDirectory::new()),
            target: Arc::new(MockDirectory::new()),
        };
        let err = ReconciliationEngine::new(fx.config.clone(), stores).unwrap_err();
        assert!(matches!(err.code(), Code::ConfigurationInvalid(_)));
    }

    #[tokio::test]
    async fn unreadable_target_fails_cycle() {
        let fx = Fixture::new(&[("alice", "a@x.com")]);
        let mut target = MockDirectory::new();
        target
            .expect_search()
            .returning(|_, _, _, _| Err(errors::bad_request("no such server")));
        let mut stores = fx.stores();
        stores.target = Arc::new(target);
        let engine = ReconciliationEngine::new(fx.config.clone(), stores).unwrap();
        assert!(engine.run_cycle().await.is_err());
        assert!(fx.maps().await.is_empty());
    }

    #[tokio::test]
    async fn snapshots_are_bounded() {
        let mut fx = Fixture::new(&[("alice", "a@x.com")]);
        fx.config.snapshot_max_count = 2;
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(fx.cycle().await.snapshot.unwrap());
        }
        assert_eq!(fx.snapshot_count(), 2);
        let engine = fx.engine();
        let listed = engine.snapshots().unwrap().list().await.unwrap();
        assert_eq!(listed, ids[1..].to_vec());
    }

    #[tokio::test]
    async fn constant_and_key_transforms_stay_idempotent() {
        let mut fx = Fixture::new(&[("alice", "a@x.com"), ("bob", "b@x.com")]);
        fx.config.attribute_mapping.extend([
            AttributeMapping::constant("gluuStatus", vec!["active".to_owned()]),
            AttributeMapping::key("oxExternalUid"),
        ]);
        let first = fx.cycle().await;
        assert_eq!(first.summary.created, 2);
        let alice = fx.person_by_uid("alice").unwrap();
        assert_eq!(alice.attributes.first("gluuStatus"), Some("active"));
        assert_eq!(alice.attributes.first("oxExternalUid"), Some("alice"));
        let second = fx.cycle().await;
        assert_eq!(second.summary.retained, 2);
        assert_eq!(second.writes(), 0);
    }
}

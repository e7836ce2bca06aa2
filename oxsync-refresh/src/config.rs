use std::{collections::HashSet, fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use validator::Validate;

use oxsync_slo::{
    errors,
    regexp::{check_attribute_names, check_inum},
    Result,
};
use oxsync_storage::{fold, normalize_dn, Filter, LdapConfig};

use crate::{
    mapping::{AttributeMapping, Transform},
    snapshot::SnapshotManager,
};

/// Attributes the engine writes itself; mappings may not target them.
pub(crate) const MANAGED_ATTRIBUTES: [&str; 2] = ["inum", "objectClass"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UpdateMethod {
    /// Correlate only; the target is never written.
    #[default]
    Vds,
    /// Materialize entries in the target and snapshot every cycle.
    Copy,
}

impl UpdateMethod {
    pub fn value(&self) -> &'static str {
        match self {
            Self::Vds => "vds",
            Self::Copy => "copy",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Vds => "VDS",
            Self::Copy => "Copy",
        }
    }
}

impl fmt::Display for UpdateMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for UpdateMethod {
    type Err = errors::WithBacktrace;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vds" => Ok(Self::Vds),
            "copy" => Ok(Self::Copy),
            other => Err(errors::configuration_invalid(&format!(
                "unknown update method {}",
                other
            ))),
        }
    }
}

impl Serialize for UpdateMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.value())
    }
}

impl<'de> Deserialize<'de> for UpdateMethod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// How key values are compared when correlating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyCasePolicy {
    #[default]
    IgnoreCase,
    Exact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheRefreshConfiguration {
    pub source_configs: Vec<LdapConfig>,
    pub inum_config: Option<LdapConfig>,
    pub target_config: Option<LdapConfig>,
    pub ldap_search_size_limit: usize,
    pub use_search_limit: bool,
    #[validate(length(min = 1), custom(function = "check_attribute_names"))]
    pub key_attributes: Vec<String>,
    #[validate(custom(function = "check_attribute_names"))]
    pub key_object_classes: Vec<String>,
    #[validate(custom(function = "check_attribute_names"))]
    pub source_attributes: Vec<String>,
    pub custom_ldap_filter: Option<String>,
    pub update_method: UpdateMethod,
    pub keep_external_person: bool,
    pub attribute_mapping: Vec<AttributeMapping>,
    pub snapshot_folder: Option<PathBuf>,
    pub snapshot_max_count: usize,
    pub org_inum: String,
    #[validate(length(min = 1), custom(function = "check_attribute_names"))]
    pub target_object_classes: Vec<String>,
    pub key_case_policy: KeyCasePolicy,
    #[validate(range(min = 1))]
    pub source_timeout_secs: u64,
}

impl Default for CacheRefreshConfiguration {
    fn default() -> Self {
        Self {
            source_configs: Vec::new(),
            inum_config: None,
            target_config: None,
            ldap_search_size_limit: 0,
            use_search_limit: false,
            key_attributes: Vec::new(),
            key_object_classes: Vec::new(),
            source_attributes: Vec::new(),
            custom_ldap_filter: None,
            update_method: UpdateMethod::default(),
            keep_external_person: false,
            attribute_mapping: Vec::new(),
            snapshot_folder: None,
            snapshot_max_count: 0,
            org_inum: String::new(),
            target_object_classes: vec!["top".to_owned(), "gluuPerson".to_owned()],
            key_case_policy: KeyCasePolicy::default(),
            source_timeout_secs: 30,
        }
    }
}

impl CacheRefreshConfiguration {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| errors::configuration_invalid(&e))
    }

    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            errors::configuration_invalid(&format!("read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Rejects configurations that make correlation or writes undefined.
    /// Runs before any directory is contacted.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| errors::configuration_invalid(&e))?;

        if self.key_attributes.iter().any(|a| a.trim().is_empty()) {
            return Err(invalid("keyAttributes contains a blank name"));
        }
        if self.use_search_limit && self.ldap_search_size_limit == 0 {
            return Err(invalid(
                "useSearchLimit requires a positive ldapSearchSizeLimit",
            ));
        }
        if let Some(custom) = self.custom_filter()? {
            tracing::debug!("custom source filter {}", custom);
        }

        let sources = self.enabled_sources().collect::<Vec<_>>();
        if sources.is_empty() {
            return Err(invalid("no enabled sourceConfigs"));
        }
        for source in sources {
            check_connection("sourceConfigs", source)?;
        }
        let target = self
            .target_config
            .as_ref()
            .ok_or_else(|| invalid("targetConfig is missing"))?;
        check_connection("targetConfig", target)?;
        let inum = self
            .inum_config
            .as_ref()
            .ok_or_else(|| invalid("inumConfig is missing"))?;
        check_connection("inumConfig", inum)?;
        // maps and persons share the `inum=<inum>` RDN
        if inum.base_dn().map(normalize_dn) == target.base_dn().map(normalize_dn) {
            return Err(invalid(
                "inumConfig and targetConfig need different base DNs",
            ));
        }

        self.check_mapping()?;

        if self.update_method == UpdateMethod::Copy {
            if self.snapshot_folder.is_none() {
                return Err(invalid("COPY requires snapshotFolder"));
            }
            if self.snapshot_max_count == 0 {
                return Err(invalid("COPY requires snapshotMaxCount of at least 1"));
            }
            if self.org_inum.trim().is_empty() {
                return Err(invalid("COPY requires orgInum"));
            }
        }
        if !self.org_inum.is_empty() {
            check_inum(&self.org_inum).map_err(|_| invalid("orgInum is malformed"))?;
        }
        Ok(())
    }

    fn check_mapping(&self) -> Result<()> {
        let mut destinations = HashSet::new();
        for mapping in &self.attribute_mapping {
            let destination = mapping.destination.trim();
            if destination.is_empty() {
                return Err(invalid("attributeMapping has a blank destination"));
            }
            if MANAGED_ATTRIBUTES
                .iter()
                .any(|m| m.eq_ignore_ascii_case(destination))
            {
                return Err(invalid(&format!(
                    "attributeMapping may not write {}",
                    destination
                )));
            }
            if !destinations.insert(fold(destination)) {
                return Err(invalid(&format!(
                    "attributeMapping destination {} is not unique",
                    destination
                )));
            }
            match &mapping.transform {
                Transform::Copy if mapping.source.trim().is_empty() => {
                    return Err(invalid(&format!(
                        "attributeMapping {} needs a source",
                        destination
                    )));
                }
                Transform::Constant { values } if values.is_empty() => {
                    return Err(invalid(&format!(
                        "attributeMapping {} has no constant values",
                        destination
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &LdapConfig> {
        self.source_configs.iter().filter(|s| s.enabled)
    }

    pub fn custom_filter(&self) -> Result<Option<Filter>> {
        match self.custom_ldap_filter.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => Filter::parse(raw)
                .map(Some)
                .map_err(|e| invalid(&format!("customLdapFilter: {}", e))),
        }
    }

    /// `sourceAttributes` plus the key attributes, without duplicates.
    pub fn requested_attributes(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.source_attributes
            .iter()
            .chain(self.key_attributes.iter())
            .filter(|a| seen.insert(fold(a)))
            .cloned()
            .collect()
    }

    pub fn size_limit(&self) -> Option<usize> {
        self.use_search_limit.then_some(self.ldap_search_size_limit)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }

    /// Snapshots are only kept for COPY.
    pub fn snapshot_manager(&self) -> Option<SnapshotManager> {
        match self.update_method {
            UpdateMethod::Copy => self
                .snapshot_folder
                .as_ref()
                .map(|folder| SnapshotManager::new(folder.clone(), self.snapshot_max_count)),
            UpdateMethod::Vds => None,
        }
    }
}

fn invalid<S: ToString + ?Sized>(msg: &S) -> errors::WithBacktrace {
    errors::configuration_invalid(msg)
}

fn check_connection(field: &str, config: &LdapConfig) -> Result<()> {
    if config.urls().is_empty() {
        return Err(invalid(&format!(
            "{} {} has no servers",
            field, config.config_id
        )));
    }
    if config.base_dn().is_none() {
        return Err(invalid(&format!(
            "{} {} has no baseDNs",
            field, config.config_id
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use oxsync_slo::errors::Code;

    use super::*;

    pub(crate) fn ldap(id: &str, base: &str) -> LdapConfig {
        LdapConfig {
            config_id: id.to_owned(),
            servers: vec!["localhost:1636".to_owned()],
            base_dns: vec![base.to_owned()],
            ..Default::default()
        }
    }

    pub(crate) fn copy_config(folder: &std::path::Path) -> CacheRefreshConfiguration {
        CacheRefreshConfiguration {
            source_configs: vec![ldap("source", "ou=people,o=source")],
            target_config: Some(ldap("target", "ou=people,o=gluu")),
            inum_config: Some(ldap("inum", "ou=people,o=site")),
            key_attributes: vec!["uid".to_owned()],
            key_object_classes: vec!["inetOrgPerson".to_owned()],
            source_attributes: vec!["uid".to_owned(), "mail".to_owned()],
            attribute_mapping: vec![
                AttributeMapping::copy("uid", "uid"),
                AttributeMapping::copy("mail", "mail"),
            ],
            update_method: UpdateMethod::Copy,
            snapshot_folder: Some(folder.to_path_buf()),
            snapshot_max_count: 10,
            org_inum: "@!1111".to_owned(),
            ..Default::default()
        }
    }

    fn assert_invalid(config: &CacheRefreshConfiguration) {
        let err = config.check().unwrap_err();
        assert!(
            matches!(err.code(), Code::ConfigurationInvalid(_)),
            "{:?}",
            err
        );
    }

    #[test]
    fn parse_json() {
        let config = CacheRefreshConfiguration::from_json(
            r#"{
                "sourceConfigs": [{
                    "configId": "ad",
                    "bindDN": "cn=admin",
                    "bindPassword": "pw",
                    "servers": ["ad:636"],
                    "useSSL": true,
                    "baseDNs": ["ou=people,dc=corp"]
                }],
                "targetConfig": {"servers": ["gluu:1636"], "baseDNs": ["ou=people,o=gluu"]},
                "inumConfig": {"servers": ["gluu:1636"], "baseDNs": ["ou=people,o=site"]},
                "ldapSearchSizeLimit": 500,
                "useSearchLimit": true,
                "keyAttributes": ["uid"],
                "keyObjectClasses": ["person"],
                "sourceAttributes": ["uid", "mail", "cn"],
                "customLdapFilter": "(mail=*)",
                "updateMethod": "COPY",
                "keepExternalPerson": true,
                "attributeMapping": [
                    {"source": "uid", "destination": "uid"},
                    {"source": "cn", "destination": "displayName", "transform": {"type": "copy"}},
                    {"destination": "gluuStatus", "transform": {"type": "constant", "values": ["active"]}}
                ],
                "snapshotFolder": "/var/ox/snapshots",
                "snapshotMaxCount": 5,
                "orgInum": "@!1111",
                "unknownKey": 1
            }"#,
        )
        .unwrap();
        assert_eq!(config.update_method, UpdateMethod::Copy);
        assert_eq!(config.size_limit(), Some(500));
        assert_eq!(config.source_timeout(), Duration::from_secs(30));
        assert_eq!(config.target_object_classes, vec!["top", "gluuPerson"]);
        assert_eq!(config.key_case_policy, KeyCasePolicy::IgnoreCase);
        assert_eq!(config.requested_attributes(), vec!["uid", "mail", "cn"]);
        config.check().unwrap();
    }

    #[test]
    fn update_method_boundary() {
        assert_eq!("Vds".parse::<UpdateMethod>().unwrap(), UpdateMethod::Vds);
        assert!("mirror".parse::<UpdateMethod>().is_err());
        assert_eq!(UpdateMethod::Copy.to_string(), "Copy");
        assert_eq!(
            serde_json::to_string(&UpdateMethod::Copy).unwrap(),
            r#""copy""#
        );
    }

    #[test]
    fn empty_key_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = copy_config(dir.path());
        config.check().unwrap();
        config.key_attributes.clear();
        assert_invalid(&config);
    }

    #[test]
    fn mapping_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = copy_config(dir.path());
        config
            .attribute_mapping
            .push(AttributeMapping::copy("cn", "MAIL"));
        assert_invalid(&config);

        let mut config = copy_config(dir.path());
        config
            .attribute_mapping
            .push(AttributeMapping::copy("uid", "inum"));
        assert_invalid(&config);

        let mut config = copy_config(dir.path());
        config.attribute_mapping.push(AttributeMapping {
            source: String::new(),
            destination: "cn".to_owned(),
            transform: Transform::Copy,
        });
        assert_invalid(&config);
    }

    #[test]
    fn copy_requirements() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = copy_config(dir.path());
        config.snapshot_max_count = 0;
        assert_invalid(&config);

        let mut config = copy_config(dir.path());
        config.snapshot_folder = None;
        assert_invalid(&config);

        config.update_method = UpdateMethod::Vds;
        config.check().unwrap();
    }

    #[test]
    fn sources_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = copy_config(dir.path());
        config.use_search_limit = true;
        assert_invalid(&config);

        let mut config = copy_config(dir.path());
        config.source_configs[0].enabled = false;
        assert_invalid(&config);

        let mut config = copy_config(dir.path());
        config.custom_ldap_filter = Some("(&(uid=a)".to_owned());
        assert_invalid(&config);

        let mut config = copy_config(dir.path());
        config.custom_ldap_filter =
            Some("(!(userAccountControl:1.2.840.113556.1.4.803:=2))".to_owned());
        config.check().unwrap();

        let mut config = copy_config(dir.path());
        config.inum_config = None;
        assert_invalid(&config);

        let mut config = copy_config(dir.path());
        config.inum_config = Some(ldap("inum", "OU=People, o=gluu"));
        assert_invalid(&config);
    }
}

use std::{collections::HashSet, fmt, time::Duration};

use async_trait::async_trait;
use ldap3::{
    adapters::{Adapter, EntriesOnly, PagedResults},
    Ldap, LdapConnAsync, LdapConnSettings, LdapResult, Mod, Scope, SearchEntry,
    SearchOptions, SearchResult,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use oxsync_slo::{errors, Result};

use crate::{Directory, Entry, Filter, Modification};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_SIZE: i32 = 500;

const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_ALREADY_EXISTS: u32 = 68;

fn enabled() -> bool {
    true
}

/// Connection parameters of one LDAP server group (source, inum or target).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LdapConfig {
    #[serde(default)]
    pub config_id: String,
    #[serde(rename = "bindDN", default)]
    pub bind_dn: String,
    #[serde(default)]
    pub bind_password: String,
    /// `host:port` pairs, tried in order until one accepts the bind.
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(rename = "useSSL", default)]
    pub use_ssl: bool,
    #[serde(rename = "baseDNs", default)]
    pub base_dns: Vec<String>,
    #[serde(default)]
    pub use_anonymous_bind: bool,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            config_id: String::new(),
            bind_dn: String::new(),
            bind_password: String::new(),
            servers: Vec::new(),
            use_ssl: false,
            base_dns: Vec::new(),
            use_anonymous_bind: false,
            enabled: true,
        }
    }
}

impl fmt::Debug for LdapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapConfig")
            .field("config_id", &self.config_id)
            .field("bind_dn", &self.bind_dn)
            .field("servers", &self.servers)
            .field("use_ssl", &self.use_ssl)
            .field("base_dns", &self.base_dns)
            .field("use_anonymous_bind", &self.use_anonymous_bind)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl LdapConfig {
    /// The first configured base DN, used for searches and writes.
    pub fn base_dn(&self) -> Option<&str> {
        self.base_dns
            .iter()
            .map(|dn| dn.trim())
            .find(|dn| !dn.is_empty())
    }

    pub fn urls(&self) -> Vec<String> {
        let scheme = if self.use_ssl { "ldaps" } else { "ldap" };
        self.servers
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| format!("{}://{}", scheme, s))
            .collect()
    }
}

/// `Directory` backed by an LDAP server. The bound handle is cached and
/// dropped after a transport error so the next call reconnects.
pub struct LdapDirectory {
    config: LdapConfig,
    handle: Mutex<Option<Ldap>>,
}

impl fmt::Debug for LdapDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapDirectory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LdapDirectory {
    pub fn new(config: LdapConfig) -> Self {
        Self {
            config,
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LdapConfig {
        &self.config
    }

    async fn connection(&self) -> Result<Ldap> {
        let mut handle = self.handle.lock().await;
        if let Some(ldap) = handle.as_ref() {
            return Ok(ldap.clone());
        }
        let ldap = self.connect().await?;
        *handle = Some(ldap.clone());
        Ok(ldap)
    }

    async fn invalidate(&self) {
        self.handle.lock().await.take();
    }

    async fn connect(&self) -> Result<Ldap> {
        let mut last = None;
        for url in self.config.urls() {
            match self.open(&url).await {
                Ok(ldap) => {
                    tracing::debug!(url, "ldap connection established");
                    return Ok(ldap);
                }
                Err(err) => {
                    tracing::warn!(url, "ldap server rejected connection, {}", err);
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            errors::configuration_invalid(&format!(
                "{} has no servers",
                self.config.config_id
            ))
        }))
    }

    async fn open(&self, url: &str) -> Result<Ldap> {
        let settings = LdapConnSettings::new().set_conn_timeout(CONNECT_TIMEOUT);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, url)
            .await
            .map_err(errors::any)?;
        tokio::spawn(async move {
            if let Err(err) = conn.drive().await {
                tracing::warn!("ldap connection driver stopped, {}", err);
            }
        });
        if !self.config.use_anonymous_bind {
            ldap.simple_bind(&self.config.bind_dn, &self.config.bind_password)
                .await
                .map_err(errors::any)?
                .success()
                .map_err(errors::any)?;
        }
        Ok(ldap)
    }

    async fn base_search(&self, dn: &str) -> Result<Option<Entry>> {
        let mut ldap = self.connection().await?;
        let result = ldap
            .search(dn, Scope::Base, "(objectClass=*)", vec!["*"])
            .await;
        let SearchResult(entries, res) = match result {
            Ok(found) => found,
            Err(err) => {
                self.invalidate().await;
                return Err(errors::any(err));
            }
        };
        if res.rc == RC_NO_SUCH_OBJECT {
            return Ok(None);
        }
        res.success().map_err(errors::any)?;
        Ok(entries.into_iter().next().map(into_entry))
    }
}

fn into_entry(raw: ldap3::ResultEntry) -> Entry {
    let raw = SearchEntry::construct(raw);
    Entry {
        dn: raw.dn,
        attributes: raw.attrs.into_iter().collect(),
    }
}

/// Outcome of a finished subtree search: `Ok(true)` keeps the returned
/// entries, `Ok(false)` means the base does not exist. Hitting the server's
/// size limit is only acceptable when the caller asked for a limit,
/// otherwise the result would silently be partial.
fn search_done(res: LdapResult, size_limit: Option<usize>) -> Result<bool> {
    match res.rc {
        RC_SIZE_LIMIT_EXCEEDED if size_limit.is_some() => Ok(true),
        RC_SIZE_LIMIT_EXCEEDED => Err(errors::bad_request(&format!(
            "search hit the server size limit, results are incomplete: {}",
            res.text
        ))),
        RC_NO_SUCH_OBJECT => Ok(false),
        _ => {
            res.success().map_err(errors::any)?;
            Ok(true)
        }
    }
}

fn value_set(values: &[String]) -> HashSet<String> {
    values.iter().cloned().collect()
}

#[async_trait]
impl Directory for LdapDirectory {
    #[tracing::instrument(skip(self), fields(directory = %self.config.config_id))]
    async fn find(&self, dn: &str) -> Result<Option<Entry>> {
        self.base_search(dn).await
    }

    #[tracing::instrument(skip(self, filter, attributes), fields(directory = %self.config.config_id, filter = %filter))]
    async fn search(
        &self,
        base_dn: &str,
        filter: &Filter,
        attributes: &[String],
        size_limit: Option<usize>,
    ) -> Result<Vec<Entry>> {
        let mut ldap = self.connection().await?;
        let attrs: Vec<&str> = if attributes.is_empty() {
            vec!["*"]
        } else {
            attributes.iter().map(String::as_str).collect()
        };
        if let Some(limit) = size_limit {
            ldap.with_search_options(
                SearchOptions::new().sizelimit(i32::try_from(limit).unwrap_or(i32::MAX)),
            );
        }
        let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResults::new(PAGE_SIZE)),
        ];
        let filter = filter.to_string();
        let mut stream = match ldap
            .streaming_search_with(adapters, base_dn, Scope::Subtree, &filter, attrs)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                self.invalidate().await;
                return Err(errors::any(err));
            }
        };

        let limit = size_limit.unwrap_or(usize::MAX);
        let mut entries = Vec::new();
        loop {
            match stream.next().await {
                Ok(Some(raw)) if entries.len() < limit => entries.push(into_entry(raw)),
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    self.invalidate().await;
                    return Err(errors::any(err));
                }
            }
        }
        let res = stream.finish().await;
        if res.rc == RC_SIZE_LIMIT_EXCEEDED {
            tracing::debug!(returned = entries.len(), "search truncated by size limit");
        }
        if !search_done(res, size_limit)? {
            tracing::debug!("search base {} does not exist", base_dn);
            return Ok(Vec::new());
        }
        Ok(entries)
    }

    #[tracing::instrument(skip(self, entry), fields(directory = %self.config.config_id, dn = %entry.dn))]
    async fn persist(&self, entry: &Entry) -> Result<()> {
        let mut ldap = self.connection().await?;
        let attrs: Vec<(String, HashSet<String>)> = entry
            .attributes
            .iter()
            .map(|(name, values)| (name.to_owned(), value_set(values)))
            .collect();
        let res = match ldap.add(&entry.dn, attrs).await {
            Ok(res) => res,
            Err(err) => {
                self.invalidate().await;
                return Err(errors::any(err));
            }
        };
        if res.rc == RC_ALREADY_EXISTS {
            return Err(errors::conflict(&format!(
                "entry {} already exists",
                entry.dn
            )));
        }
        res.success().map_err(errors::any)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, changes), fields(directory = %self.config.config_id, changes = changes.len()))]
    async fn merge(&self, dn: &str, changes: &[Modification]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut ldap = self.connection().await?;
        let mods: Vec<Mod<String>> = changes
            .iter()
            .map(|change| match change {
                Modification::Replace { name, values } => {
                    Mod::Replace(name.clone(), value_set(values))
                }
                Modification::Clear { name } => {
                    Mod::Replace(name.clone(), HashSet::new())
                }
            })
            .collect();
        let res = match ldap.modify(dn, mods).await {
            Ok(res) => res,
            Err(err) => {
                self.invalidate().await;
                return Err(errors::any(err));
            }
        };
        if res.rc == RC_NO_SUCH_OBJECT {
            return Err(errors::not_found(&format!("entry {}", dn)));
        }
        res.success().map_err(errors::any)?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(directory = %self.config.config_id))]
    async fn remove(&self, dn: &str) -> Result<()> {
        let mut ldap = self.connection().await?;
        let res = match ldap.delete(dn).await {
            Ok(res) => res,
            Err(err) => {
                self.invalidate().await;
                return Err(errors::any(err));
            }
        };
        if res.rc == RC_NO_SUCH_OBJECT {
            return Err(errors::not_found(&format!("entry {}", dn)));
        }
        res.success().map_err(errors::any)?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(directory = %self.config.config_id))]
    async fn contains(&self, dn: &str) -> Result<bool> {
        Ok(self.base_search(dn).await?.is_some())
    }
}

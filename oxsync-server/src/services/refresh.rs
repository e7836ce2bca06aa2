use std::{fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;

use oxsync_job::Job;
use oxsync_refresh::{
    Action, CacheRefreshConfiguration, CycleReport, ReconciliationEngine, SourceDirectory, Stores,
};
use oxsync_slo::{errors, Result};
use oxsync_storage::{Directory, LdapConfig, LdapDirectory};

use crate::{
    var::{CACHE_REFRESH_CYCLES_TOTAL, CACHE_REFRESH_DECISIONS_TOTAL},
    ReportStore,
};

/// Opens the directory described by a connection block.
pub type Connector = Arc<dyn Fn(&LdapConfig) -> Arc<dyn Directory> + Send + Sync>;

pub fn ldap_connector() -> Connector {
    Arc::new(|config: &LdapConfig| Arc::new(LdapDirectory::new(config.clone())) as Arc<dyn Directory>)
}

/// One scheduled cache refresh: reload the configuration, connect, reconcile.
pub struct RefreshJob {
    config_path: PathBuf,
    connector: Connector,
    reports: Arc<ReportStore>,
}

impl fmt::Debug for RefreshJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshJob")
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

impl RefreshJob {
    pub fn new(config_path: PathBuf, connector: Connector, reports: Arc<ReportStore>) -> Self {
        Self {
            config_path,
            connector,
            reports,
        }
    }

    fn stores(&self, config: &CacheRefreshConfiguration) -> Result<Stores> {
        let required = |c: Option<&LdapConfig>, name: &str| {
            c.map(|c| (self.connector)(c))
                .ok_or_else(|| errors::configuration_invalid(&format!("{} is required", name)))
        };
        Ok(Stores {
            sources: config
                .source_configs
                .iter()
                .map(|c| SourceDirectory::new(c, (self.connector)(c)))
                .collect(),
            inum: required(config.inum_config.as_ref(), "inumConfig")?,
            target: required(config.target_config.as_ref(), "targetConfig")?,
        })
    }

    pub async fn refresh(&self) -> Result<CycleReport> {
        let config = CacheRefreshConfiguration::load(&self.config_path).await?;
        config.check()?;
        let stores = self.stores(&config)?;
        ReconciliationEngine::new(config, stores)?.run_cycle().await
    }
}

#[async_trait]
impl Job for RefreshJob {
    async fn run(&self) -> Result<()> {
        match self.refresh().await {
            Ok(report) => {
                CACHE_REFRESH_CYCLES_TOTAL.with_label_values(&["success"]).inc();
                for action in Action::ALL {
                    CACHE_REFRESH_DECISIONS_TOTAL
                        .with_label_values(&[action.as_str()])
                        .inc_by(report.count(action) as u64);
                }
                self.reports.record(report)
            }
            Err(err) => {
                tracing::error!("cache refresh cycle failed, {}", err);
                CACHE_REFRESH_CYCLES_TOTAL.with_label_values(&["failure"]).inc();
                self.reports.fail(err.to_string())?;
                Err(err)
            }
        }
    }
}

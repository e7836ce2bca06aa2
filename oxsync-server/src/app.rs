use std::{ops::Deref, sync::Arc, sync::RwLock};

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use tracing::info;

use oxsync_job::Scheduler;
use oxsync_refresh::CycleReport;
use oxsync_slo::{errors, Result};

use crate::{services::refresh::Connector, AppConfig, RefreshJob};

pub struct App {
    pub config: AppConfig,
    pub reports: Arc<ReportStore>,
    pub scheduler: Scheduler<RefreshJob>,
}

impl App {
    pub fn new(config: AppConfig, connector: Connector) -> Self {
        info!("initializing cache refresh scheduler...");
        let reports = Arc::new(ReportStore::default());
        let job = RefreshJob::new(
            config.cache_refresh_config.clone(),
            connector,
            Arc::clone(&reports),
        );
        Self {
            config,
            reports,
            scheduler: Scheduler::new(job),
        }
    }
}

/// Outcome of the most recent cycle, shared between the job and the API.
#[derive(Debug, Default)]
pub struct ReportStore {
    last: RwLock<Option<CycleReport>>,
    error: RwLock<Option<String>>,
}

impl ReportStore {
    pub fn record(&self, report: CycleReport) -> Result<()> {
        *self.last.write().map_err(errors::any)? = Some(report);
        *self.error.write().map_err(errors::any)? = None;
        Ok(())
    }

    /// A cycle that never produced a report.
    pub fn fail(&self, reason: String) -> Result<()> {
        *self.error.write().map_err(errors::any)? = Some(reason);
        Ok(())
    }

    pub fn last(&self) -> Result<Option<CycleReport>> {
        Ok(self.last.read().map_err(errors::any)?.clone())
    }

    pub fn last_error(&self) -> Result<Option<String>> {
        Ok(self.error.read().map_err(errors::any)?.clone())
    }
}

#[derive(Clone)]
pub struct AppState(pub Arc<App>);

// deref so you can still access the inner fields easily
impl Deref for AppState {
    type Target = App;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AppState
where
    Self: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = errors::WithBacktrace;
    async fn from_request_parts(
        _: &mut Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self::from_ref(state))
    }
}

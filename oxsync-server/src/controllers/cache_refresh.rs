use axum::{routing::get, routing::post, Json, Router};
use http::StatusCode;
use serde::Serialize;

use oxsync_job::Fire;
use oxsync_refresh::{CacheRefreshConfiguration, CycleReport, SnapshotId, UpdateMethod};
use oxsync_slo::{errors, Result};

use crate::AppState;

pub fn new_router(state: AppState) -> Router {
    Router::new()
        .route("/cache-refresh/status", get(status))
        .route("/cache-refresh/trigger", post(trigger))
        .route("/cache-refresh/snapshots", get(snapshots))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Status {
    running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<CycleReport>,
    /// Set when the latest cycle failed before producing a report.
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

async fn status(app: AppState) -> Result<Json<Status>> {
    let report = app.reports.last()?;
    let last_error = app.reports.last_error()?;
    if report.is_none() && last_error.is_none() {
        return Err(errors::not_found("no cache refresh cycle has run yet"));
    }
    Ok(Status {
        running: app.scheduler.is_running(),
        report,
        last_error,
    }
    .into())
}

#[derive(Debug, Serialize)]
struct Triggered {
    started: bool,
}

async fn trigger(app: AppState) -> Result<(StatusCode, Json<Triggered>)> {
    match app.scheduler.fire() {
        Fire::Started(_) => {
            tracing::info!("cache refresh cycle triggered manually");
            Ok((StatusCode::ACCEPTED, Triggered { started: true }.into()))
        }
        Fire::Skipped => Err(errors::conflict("a cache refresh cycle is already running")),
    }
}

#[derive(Debug, Serialize)]
struct Snapshots {
    update_method: UpdateMethod,
    /// Newest first.
    snapshots: Vec<SnapshotId>,
}

async fn snapshots(app: AppState) -> Result<Json<Snapshots>> {
    let config = CacheRefreshConfiguration::load(&app.config.cache_refresh_config).await?;
    let mut snapshots = match config.snapshot_manager() {
        Some(manager) => manager.list().await?,
        None => Vec::new(),
    };
    snapshots.reverse();
    Ok(Snapshots {
        update_method: config.update_method,
        snapshots,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::body::{to_bytes, Body};
    use clap::Parser;
    use http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::{services::refresh::tests::setup, App, AppConfig};

    use super::*;

    fn state(setup: &crate::services::refresh::tests::Setup) -> AppState {
        let config = AppConfig::parse_from([
            "server",
            "--cache-refresh-config",
            setup.path.to_str().unwrap(),
        ]);
        AppState(Arc::new(App::new(config, Arc::clone(&setup.connector))))
    }

    async fn call(state: &AppState, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = new_router(state.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn settle(state: &AppState) {
        while state.scheduler.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn status_before_and_after_a_cycle() {
        let setup = setup();
        let state = state(&setup);

        let (code, _) = call(&state, "GET", "/cache-refresh/status").await;
        assert_eq!(code, StatusCode::NOT_FOUND);

        let (code, body) = call(&state, "POST", "/cache-refresh/trigger").await;
        assert_eq!(code, StatusCode::ACCEPTED);
        assert_eq!(body["started"], true);
        settle(&state).await;

        let (code, body) = call(&state, "GET", "/cache-refresh/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["running"], false);
        assert_eq!(body["report"]["summary"]["created"], 2);
        assert_eq!(body["report"]["update_method"], "copy");
        assert_eq!(setup.target.len(), 2);
    }

    #[tokio::test]
    async fn snapshots_newest_first() {
        let setup = setup();
        let state = state(&setup);
        let (_, body) = call(&state, "GET", "/cache-refresh/snapshots").await;
        assert_eq!(body["snapshots"], Value::Array(Vec::new()));

        for _ in 0..2 {
            call(&state, "POST", "/cache-refresh/trigger").await;
            settle(&state).await;
        }
        let (code, body) = call(&state, "GET", "/cache-refresh/snapshots").await;
        assert_eq!(code, StatusCode::OK);
        let ids: Vec<u64> = body["snapshots"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_u64().unwrap())
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] > ids[1]);
        assert!(setup.dir.path().join("snapshots").is_dir());
    }
}

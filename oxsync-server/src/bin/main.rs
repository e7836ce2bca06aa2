use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oxsync_job::{Fire, Interval};

use oxsync_server::{
    ldap_connector, load, shutdown_signal, version, App, AppConfig, AppRouter,
    AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = env::args().collect::<Vec<_>>();
    let config =
        if args.len() == 3 && (args[1] == "-c" || args[1] == "--config") {
            load(&args[2])?
        } else {
            AppConfig::parse()
        };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.rust_log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    debug!("{:#?}", &config);
    info!("{}", version());
    let app = Arc::new(App::new(config.clone(), ldap_connector()));
    if config.run_once {
        return run_once(app).await;
    }
    run_server(app, config).await
}

async fn run_once(app: Arc<App>) -> Result<()> {
    info!("running a single cache refresh cycle...");
    if let Fire::Started(handle) = app.scheduler.fire() {
        handle.await.context("cache refresh cycle panicked")?;
    }
    if let Some(err) = app.reports.last_error()? {
        bail!("cache refresh cycle failed: {}", err);
    }
    Ok(())
}

async fn run_server(app: Arc<App>, config: AppConfig) -> Result<()> {
    let interval = Interval::from_secs(config.refresh_interval)
        .context("invalid refresh interval")?;
    schedule(Arc::clone(&app), interval);

    let router = AppRouter::build(AppState(app))
        .context("could not initialize application routes")?;
    let host = format!("{}:{}", config.endpoint, config.port);
    let listener = TcpListener::bind(&host)
        .await
        .context("could not bind to endpoint")?;

    info!("api server, listening on {}", host);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("error while starting API server")?;

    Ok(())
}

fn schedule(app: Arc<App>, interval: Interval) {
    tokio::spawn(async move {
        info!(
            "cache refresh every {}s, first cycle now",
            interval.period().as_secs()
        );
        let _ = app.scheduler.fire();
        if let Err(err) = app.scheduler.run(interval, shutdown_signal()).await {
            error!("{}", err);
        }
        info!("cache refresh scheduler stopped");
    });
}

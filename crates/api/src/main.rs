use std::sync::Arc;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use predsync_core::push::hub::PushHub;
use predsync_core::watch::{ChangedAspect, FileWatcher, WatchTarget, WatcherOptions};

mod routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = predsync_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let predictions_dir = settings.require_predictions_dir()?;
    let hub = Arc::new(PushHub::default());

    let mut targets = vec![WatchTarget::new(&predictions_dir, ChangedAspect::Prediction)];
    if let Some(dir) = &settings.sentiment_dir {
        targets.push(WatchTarget::new(dir, ChangedAspect::Sentiment));
    }
    if let Some(dir) = &settings.market_data_dir {
        targets.push(WatchTarget::new(dir, ChangedAspect::MarketData));
    }

    let (notify_tx, notify_rx) = mpsc::channel(256);
    let watcher = FileWatcher::start(targets, WatcherOptions::from_env(), notify_tx)?;
    let forwarder = tokio::spawn(routes::forward_notifications(notify_rx, hub.clone()));

    let app = routes::router(routes::AppState {
        predictions_dir,
        hub,
    });

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    watcher.stop().await;
    // The watcher's sender is gone, so the forwarder drains and exits.
    if let Err(e) = forwarder.await {
        tracing::warn!(error = %e, "push forwarder ended abnormally");
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &predsync_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

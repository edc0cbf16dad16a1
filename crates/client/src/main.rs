use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use predsync_core::cache::{SnapshotCache, DEFAULT_NAMESPACE};
use predsync_core::domain::thresholds::ThresholdTable;
use predsync_core::poll::{DirectorySnapshotFetcher, HttpSnapshotFetcher, SnapshotFetcher};
use predsync_core::push::client::PushClient;
use predsync_core::session::{secs_to_duration, SyncEngine, SyncOptions, SyncSession};

mod report;

#[derive(Debug, Parser)]
#[command(name = "predsync_client")]
struct Args {
    /// Backend base URL. Overrides SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,

    /// Push-channel URL. Defaults to the server URL with a ws scheme and `/ws`.
    #[arg(long)]
    ws_url: Option<String>,

    /// Read snapshots straight from a predictions directory instead of HTTP.
    /// Disables the push channel.
    #[arg(long, conflicts_with = "server_url")]
    local_dir: Option<PathBuf>,

    /// Snapshot cache directory. Overrides CACHE_DIR; no cache when unset.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[arg(long)]
    poll_secs: Option<f64>,

    #[arg(long)]
    simulate_secs: Option<f64>,

    /// Ask the server for these tickers only (repeatable).
    #[arg(long = "subscribe")]
    subscribe: Vec<String>,
}

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

    let result = run(Args::parse(), settings).await;
    if let Err(err) = &result {
        sentry_anyhow::capture_anyhow(err);
        tracing::error!(error = %format!("{err:#}"), "sync client failed");
    }
    result
}

async fn run(args: Args, mut settings: predsync_core::config::Settings) -> anyhow::Result<()> {
    if args.server_url.is_some() {
        settings.server_url = args.server_url.clone();
    }
    if args.ws_url.is_some() {
        settings.ws_url = args.ws_url.clone();
    }

    let mut options = SyncOptions::from_env()?;
    if let Some(secs) = args.poll_secs {
        options.poll_interval = secs_to_duration("--poll-secs", secs)?;
    }
    if let Some(secs) = args.simulate_secs {
        options.simulate_interval = secs_to_duration("--simulate-secs", secs)?;
    }
    options.validate()?;

    let cache_dir = args
        .cache_dir
        .clone()
        .or_else(|| settings.cache_dir.as_deref().map(PathBuf::from));
    let cache = match cache_dir {
        Some(dir) => Some(SnapshotCache::new(dir, DEFAULT_NAMESPACE)?),
        None => None,
    };

    let mut engine = SyncEngine::from_options(&options, ThresholdTable::from_env()?)?;
    if let Some(cache) = &cache {
        engine.seed_from_cache(cache).await;
    }

    let (fetcher, push): (Arc<dyn SnapshotFetcher>, Option<PushClient>) = match &args.local_dir {
        Some(dir) => (Arc::new(DirectorySnapshotFetcher::new(dir)), None),
        None => {
            let fetcher = HttpSnapshotFetcher::from_settings(&settings, options.http_timeout)?;
            let push = PushClient::new(settings.resolve_ws_url()?, options.reconnect_delay)
                .with_subscriptions(args.subscribe.iter().cloned());
            (Arc::new(fetcher), Some(push))
        }
    };
    tracing::info!(source = fetcher.source_name(), ?options, "starting sync session");

    let session = SyncSession::start(options, engine, fetcher, push, cache)?;
    let mut views = session.subscribe();
    let mut last = views.borrow().clone();
    tracing::info!(records = last.records.len(), "initial view");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = views.borrow_and_update().clone();
                for change in report::diff_views(&last, &next) {
                    report::log_change(&change);
                }
                last = next;
            }
        }
    }

    session.stop().await;
    let summary = serde_json::to_string(&session.snapshot())?;
    println!("{summary}");
    Ok(())
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

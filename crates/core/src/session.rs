use crate::cache::SnapshotCache;
use crate::config::env_parse;
use crate::domain::prediction::PredictionRecord;
use crate::domain::thresholds::ThresholdTable;
use crate::normalize::{Normalizer, DEFAULT_MAX_ARTICLE_COUNT};
use crate::poll::SnapshotFetcher;
use crate::push::client::{ChannelEvent, ConnectionState, PushClient, DEFAULT_RECONNECT_DELAY};
use crate::push::protocol::InboundEvent;
use crate::reconcile::{reconcile, Incoming, SourceKind};
use crate::simulate::{Simulator, DEFAULT_MAGNITUDE};
use crate::store::SnapshotResponse;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Upper bound for every configured interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub simulate_interval: Duration,
    /// Must be strictly slower than `simulate_interval`.
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_article_count: u32,
    pub simulate_magnitude: f64,
    pub http_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            simulate_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(30),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_article_count: DEFAULT_MAX_ARTICLE_COUNT,
            simulate_magnitude: DEFAULT_MAGNITUDE,
            http_timeout: Duration::from_secs(crate::poll::DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl SyncOptions {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut out = Self::default();
        if let Some(secs) = env_parse::<f64>("SIMULATE_INTERVAL_SECS") {
            out.simulate_interval = secs_to_duration("SIMULATE_INTERVAL_SECS", secs)?;
        }
        if let Some(secs) = env_parse::<f64>("POLL_INTERVAL_SECS") {
            out.poll_interval = secs_to_duration("POLL_INTERVAL_SECS", secs)?;
        }
        if let Some(secs) = env_parse::<f64>("RECONNECT_DELAY_SECS") {
            out.reconnect_delay = secs_to_duration("RECONNECT_DELAY_SECS", secs)?;
        }
        if let Some(secs) = env_parse::<f64>("HTTP_TIMEOUT_SECS") {
            out.http_timeout = secs_to_duration("HTTP_TIMEOUT_SECS", secs)?;
        }
        if let Some(n) = env_parse::<u32>("MAX_ARTICLE_COUNT") {
            out.max_article_count = n;
        }
        if let Some(m) = env_parse::<f64>("SIMULATE_MAGNITUDE") {
            out.simulate_magnitude = m;
        }
        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("simulate interval", self.simulate_interval),
            ("poll interval", self.poll_interval),
            ("reconnect delay", self.reconnect_delay),
            ("http timeout", self.http_timeout),
        ] {
            anyhow::ensure!(!value.is_zero(), "{name} must be positive");
            anyhow::ensure!(
                value <= MAX_INTERVAL,
                "{name} ({value:?}) exceeds the maximum of {MAX_INTERVAL:?}"
            );
        }
        anyhow::ensure!(
            self.poll_interval > self.simulate_interval,
            "poll interval ({:?}) must be strictly slower than the simulate interval ({:?})",
            self.poll_interval,
            self.simulate_interval
        );
        anyhow::ensure!(self.max_article_count > 0, "MAX_ARTICLE_COUNT must be >= 1");
        Ok(())
    }
}

pub fn secs_to_duration(key: &str, secs: f64) -> anyhow::Result<Duration> {
    anyhow::ensure!(secs > 0.0, "{key} must be a positive number of seconds (got {secs})");
    Duration::try_from_secs_f64(secs).with_context(|| format!("{key} is out of range (got {secs})"))
}

/// What consumers render.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncView {
    pub records: Vec<PredictionRecord>,
    pub connection: ConnectionState,
    /// Cleared only when the push channel opens again.
    pub push_error: Option<String>,
    /// Cleared only by the next successful poll.
    pub poll_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncView {
    pub fn is_degraded(&self) -> bool {
        self.push_error.is_some() || self.poll_error.is_some()
    }
}

#[derive(Debug)]
pub struct SyncEngine {
    normalizer: Normalizer,
    simulator: Simulator,
    records: Vec<PredictionRecord>,
    connection: ConnectionState,
    push_error: Option<String>,
    poll_error: Option<String>,
    last_synced_at: Option<DateTime<Utc>>,
}

impl SyncEngine {
    pub fn new(normalizer: Normalizer, simulator: Simulator) -> Self {
        Self {
            normalizer,
            simulator,
            records: Vec::new(),
            connection: ConnectionState::Disconnected,
            push_error: None,
            poll_error: None,
            last_synced_at: None,
        }
    }

    pub fn from_options(options: &SyncOptions, thresholds: ThresholdTable) -> anyhow::Result<Self> {
        let normalizer = Normalizer::new(thresholds, options.max_article_count);
        let simulator = Simulator::new(thresholds, options.max_article_count, options.simulate_magnitude)?;
        Ok(Self::new(normalizer, simulator))
    }

    /// Seeds the collection from a non-empty cached snapshot. Returns whether
    /// anything was loaded.
    pub async fn seed_from_cache(&mut self, cache: &SnapshotCache) -> bool {
        let Some(cached) = cache.load().await else {
            return false;
        };
        tracing::info!(count = cached.predictions.len(), saved_at = %cached.saved_at, "seeded from snapshot cache");
        self.records = reconcile(&self.records, Incoming::Snapshot(cached.predictions), SourceKind::Cache);
        true
    }

    pub fn records(&self) -> &[PredictionRecord] {
        &self.records
    }

    pub fn view(&self) -> SyncView {
        SyncView {
            records: self.records.clone(),
            connection: self.connection,
            push_error: self.push_error.clone(),
            poll_error: self.poll_error.clone(),
            last_synced_at: self.last_synced_at,
        }
    }

    pub fn apply(&mut self, incoming: Incoming, source: SourceKind, now: DateTime<Utc>) {
        if incoming.is_empty() && !matches!(incoming, Incoming::Snapshot(_)) {
            return;
        }
        self.records = reconcile(&self.records, incoming, source);
        if source.is_authoritative() {
            self.last_synced_at = Some(now);
        }
    }

    pub fn dispatch(&mut self, event: ChannelEvent, now: DateTime<Utc>) {
        match event {
            ChannelEvent::State(state) => {
                if state == ConnectionState::Open {
                    self.push_error = None;
                }
                self.connection = state;
            }
            ChannelEvent::Error(message) => {
                self.push_error = Some(message);
            }
            ChannelEvent::Inbound(InboundEvent::PredictionUpdated { ticker, prediction }) => {
                let payload = with_ticker(prediction, &ticker);
                match self.normalizer.normalize_update(&payload, now) {
                    Some(update) => self.apply(Incoming::One(update), SourceKind::Push, now),
                    None => tracing::warn!(%ticker, "prediction_updated payload could not be normalized"),
                }
            }
            ChannelEvent::Inbound(InboundEvent::PredictionsRefresh { predictions }) => {
                let records = self.normalizer.normalize_all(&predictions, now);
                self.apply(Incoming::Snapshot(records), SourceKind::Push, now);
            }
            ChannelEvent::Inbound(InboundEvent::Connected) => {
                self.connection = ConnectionState::Open;
                self.push_error = None;
            }
            ChannelEvent::Inbound(InboundEvent::Unknown { kind }) => {
                tracing::trace!(%kind, "ignoring push event of unknown type");
            }
        }
    }

    /// Failures keep the collection and raise the poll error flag.
    pub fn apply_poll(&mut self, result: anyhow::Result<SnapshotResponse>, source: SourceKind, now: DateTime<Utc>) {
        match result {
            Ok(snapshot) => {
                let records = self.normalizer.normalize_all(&snapshot.predictions, now);
                tracing::debug!(count = records.len(), ?source, "applying snapshot");
                self.apply(Incoming::Snapshot(records), source, now);
                self.poll_error = None;
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(error = %message, "snapshot poll failed; keeping last-known collection");
                self.poll_error = Some(message);
            }
        }
    }

    pub fn simulate_tick(&mut self, now: DateTime<Utc>) {
        if self.records.is_empty() {
            return;
        }
        let perturbed = self.simulator.perturb(&self.records, now);
        self.apply(Incoming::Batch(perturbed), SourceKind::Simulator, now);
    }
}

fn with_ticker(prediction: Value, ticker: &str) -> Value {
    match prediction {
        Value::Object(mut map) => {
            let has_ticker = ["ticker", "symbol"]
                .iter()
                .any(|k| map.get(*k).and_then(Value::as_str).is_some_and(|s| !s.trim().is_empty()));
            if !has_ticker {
                map.insert("ticker".to_string(), Value::String(ticker.to_string()));
            }
            Value::Object(map)
        }
        other => other,
    }
}

/// The collection actor, the push connection, the cache writer and the
/// three timers, all torn down by one cancellation token.
pub struct SyncSession {
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    view: watch::Receiver<SyncView>,
}

impl SyncSession {
    /// Must be called from within a tokio runtime. The first poll runs
    /// immediately and counts as the initial load.
    pub fn start(
        options: SyncOptions,
        engine: SyncEngine,
        fetcher: Arc<dyn SnapshotFetcher>,
        push: Option<PushClient>,
        cache: Option<SnapshotCache>,
    ) -> anyhow::Result<Self> {
        options.validate()?;

        let cancel = CancellationToken::new();
        let (view_tx, view_rx) = watch::channel(engine.view());
        let (channel_tx, channel_rx) = mpsc::channel::<ChannelEvent>(256);

        let mut tasks = Vec::with_capacity(3);
        if let Some(push) = push {
            tracing::info!(url = %push.url(), "starting push channel");
            tasks.push(tokio::spawn(push.run(channel_tx, cancel.clone())));
        } else {
            drop(channel_tx);
        }
        if let Some(cache) = cache {
            tasks.push(tokio::spawn(run_cache_writer(cache, view_rx.clone(), cancel.clone())));
        }
        tasks.push(tokio::spawn(run_actor(
            options,
            engine,
            fetcher,
            channel_rx,
            view_tx,
            cancel.clone(),
        )));

        Ok(Self {
            cancel,
            tasks: Mutex::new(tasks),
            view: view_rx,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncView> {
        self.view.clone()
    }

    pub fn snapshot(&self) -> SyncView {
        self.view.borrow().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels every task and waits for them. Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "sync task ended abnormally");
            }
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// Authoritative input queued before a simulator tick is applied first (`biased`).
async fn run_actor(
    options: SyncOptions,
    mut engine: SyncEngine,
    fetcher: Arc<dyn SnapshotFetcher>,
    mut channel_rx: mpsc::Receiver<ChannelEvent>,
    view_tx: watch::Sender<SyncView>,
    cancel: CancellationToken,
) {
    let (poll_tx, mut poll_rx) = mpsc::channel::<anyhow::Result<SnapshotResponse>>(1);

    let mut simulate_tick = tokio::time::interval_at(
        tokio::time::Instant::now() + options.simulate_interval,
        options.simulate_interval,
    );
    simulate_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut poll_tick = tokio::time::interval(options.poll_interval);
    poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut in_flight: Option<JoinHandle<()>> = None;
    let mut initial_load = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(event) = channel_rx.recv() => {
                engine.dispatch(event, Utc::now());
            }
            Some(result) = poll_rx.recv() => {
                in_flight = None;
                let source = if initial_load { SourceKind::InitialLoad } else { SourceKind::Poll };
                initial_load = false;
                engine.apply_poll(result, source, Utc::now());
            }
            _ = poll_tick.tick() => {
                if in_flight.is_some() {
                    tracing::debug!("previous snapshot fetch still in flight; skipping tick");
                    continue;
                }
                in_flight = Some(spawn_fetch(fetcher.clone(), poll_tx.clone(), cancel.clone()));
                continue;
            }
            _ = simulate_tick.tick() => {
                engine.simulate_tick(Utc::now());
            }
        }
        view_tx.send_replace(engine.view());
    }

    if let Some(task) = in_flight {
        task.abort();
    }
    tracing::info!("sync session stopped");
}

fn spawn_fetch(
    fetcher: Arc<dyn SnapshotFetcher>,
    results: mpsc::Sender<anyhow::Result<SnapshotResponse>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = fetcher.fetch_snapshot() => result,
        };
        let _ = results.send(result).await;
    })
}

// Saves the latest collection whenever it changes, off the actor's path.
// Bursts coalesce into one write; the final state is flushed on stop.
async fn run_cache_writer(cache: SnapshotCache, mut views: watch::Receiver<SyncView>, cancel: CancellationToken) {
    let mut saved = views.borrow_and_update().records.clone();
    loop {
        let stopping = tokio::select! {
            _ = cancel.cancelled() => true,
            changed = views.changed() => changed.is_err(),
        };
        let records = views.borrow_and_update().records.clone();
        if records != saved {
            match cache.save(&records, Utc::now()).await {
                Ok(()) => saved = records,
                Err(err) => tracing::warn!(error = %format!("{err:#}"), "snapshot cache save failed"),
            }
        }
        if stopping {
            break;
        }
    }
}

use crate::config::env_parse;
use crate::store::{read_record_dir, read_record_file, ticker_from_path};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangedAspect {
    Prediction,
    Sentiment,
    MarketData,
}

impl ChangedAspect {
    pub fn file_suffix(self) -> &'static str {
        match self {
            Self::Prediction => "_prediction.json",
            Self::Sentiment => "_sentiment.json",
            Self::MarketData => "_market_data.json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub dir: PathBuf,
    pub aspect: ChangedAspect,
}

impl WatchTarget {
    pub fn new(dir: impl Into<PathBuf>, aspect: ChangedAspect) -> Self {
        Self {
            dir: dir.into(),
            aspect,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchNotification {
    /// One settled file, already parsed.
    Changed {
        ticker: String,
        aspect: ChangedAspect,
        payload: Value,
    },
    /// Every current prediction file, emitted on the slow fallback cadence.
    FullSnapshot { predictions: Vec<Value> },
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherOptions {
    /// A file settles after this long without further writes.
    pub quiet_period: Duration,
    /// How often pending files are re-checked for stability.
    pub poll_interval: Duration,
    pub full_snapshot_interval: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
            full_snapshot_interval: Duration::from_secs(120),
        }
    }
}

impl WatcherOptions {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        if let Some(ms) = env_parse::<u64>("WATCH_QUIET_MS") {
            out.quiet_period = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("WATCH_POLL_MS") {
            out.poll_interval = Duration::from_millis(ms.max(10));
        }
        if let Some(secs) = env_parse::<u64>("WATCH_FULL_SNAPSHOT_SECS") {
            out.full_snapshot_interval = Duration::from_secs(secs.max(1));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl Fingerprint {
    pub async fn read(path: &Path) -> Option<Self> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        Some(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

#[derive(Debug)]
struct PendingWrite {
    aspect: ChangedAspect,
    last_change: Instant,
    fingerprint: Option<Fingerprint>,
}

/// Tracks files with in-flight writes until they have been stable for the
/// quiet period.
#[derive(Debug)]
pub struct Debouncer {
    quiet_period: Duration,
    pending: HashMap<PathBuf, PendingWrite>,
}

impl Debouncer {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            pending: HashMap::new(),
        }
    }

    pub fn touch(&mut self, path: PathBuf, aspect: ChangedAspect, now: Instant) {
        let entry = self.pending.entry(path).or_insert(PendingWrite {
            aspect,
            last_change: now,
            fingerprint: None,
        });
        entry.last_change = now;
    }

    /// Returns files that settled. A fingerprint change restarts the quiet
    /// period; files that vanished are dropped.
    pub fn poll(
        &mut self,
        now: Instant,
        mut stat: impl FnMut(&Path) -> Option<Fingerprint>,
    ) -> Vec<(PathBuf, ChangedAspect)> {
        let mut settled = Vec::new();
        let quiet = self.quiet_period;
        self.pending.retain(|path, pending| {
            let Some(fp) = stat(path) else {
                return false;
            };
            if pending.fingerprint != Some(fp) {
                pending.fingerprint = Some(fp);
                pending.last_change = now;
                return true;
            }
            if now.saturating_duration_since(pending.last_change) >= quiet {
                settled.push((path.clone(), pending.aspect));
                return false;
            }
            true
        });
        settled.sort();
        settled
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_paths(&self) -> Vec<PathBuf> {
        self.pending.keys().cloned().collect()
    }
}

pub struct FileWatcher {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileWatcher {
    /// Must be called from within a tokio runtime.
    pub fn start(
        targets: Vec<WatchTarget>,
        options: WatcherOptions,
        notifications: mpsc::Sender<WatchNotification>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!targets.is_empty(), "file watcher needs at least one target");

        let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>(1024);
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.blocking_send(res);
            },
            NotifyConfig::default().with_poll_interval(options.poll_interval),
        )?;

        // Resolved once here so event matching is a plain path comparison.
        let mut targets = targets;
        for target in &mut targets {
            if let Err(err) = std::fs::create_dir_all(&target.dir) {
                tracing::warn!(dir = %target.dir.display(), error = %err, "cannot create watch dir");
            }
            if let Ok(resolved) = std::fs::canonicalize(&target.dir) {
                target.dir = resolved;
            }
            match watcher.watch(&target.dir, RecursiveMode::NonRecursive) {
                Ok(()) => tracing::info!(dir = %target.dir.display(), aspect = ?target.aspect, "watching"),
                Err(err) => {
                    tracing::warn!(dir = %target.dir.display(), error = %err, "failed to watch; relying on full snapshots")
                }
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_watch_loop(
            targets,
            options,
            event_rx,
            notifications,
            cancel.clone(),
        ));

        Ok(Self {
            cancel,
            task: Mutex::new(Some(task)),
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Stops the notify backend and the loop. Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(watcher);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "file watcher task ended abnormally");
            }
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_watch_loop(
    targets: Vec<WatchTarget>,
    options: WatcherOptions,
    mut events: mpsc::Receiver<notify::Result<Event>>,
    notifications: mpsc::Sender<WatchNotification>,
    cancel: CancellationToken,
) {
    let mut debouncer = Debouncer::new(options.quiet_period);

    let mut settle_tick = tokio::time::interval(options.poll_interval);
    settle_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut full_tick = tokio::time::interval_at(
        tokio::time::Instant::now() + options.full_snapshot_interval,
        options.full_snapshot_interval,
    );
    full_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                match event {
                    Some(Ok(event)) => track_event(&targets, &mut debouncer, event),
                    Some(Err(err)) => tracing::warn!(error = %err, "file watcher backend error"),
                    None => break,
                }
            }
            _ = settle_tick.tick() => {
                if debouncer.pending_len() == 0 {
                    continue;
                }
                let mut stats = HashMap::new();
                for path in debouncer.pending_paths() {
                    let fp = Fingerprint::read(&path).await;
                    stats.insert(path, fp);
                }
                let settled = debouncer.poll(Instant::now(), |path| stats.get(path).copied().flatten());
                for (path, aspect) in settled {
                    let Some(notification) = settled_notification(&path, aspect).await else {
                        continue;
                    };
                    if notifications.send(notification).await.is_err() {
                        tracing::debug!("notification receiver gone; stopping watcher");
                        return;
                    }
                }
            }
            _ = full_tick.tick() => {
                let predictions = full_snapshot(&targets).await;
                tracing::debug!(count = predictions.len(), "emitting fallback full snapshot");
                if notifications.send(WatchNotification::FullSnapshot { predictions }).await.is_err() {
                    return;
                }
            }
        }
    }
    tracing::info!("file watcher stopped");
}

fn track_event(targets: &[WatchTarget], debouncer: &mut Debouncer, event: Event) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }
    let now = Instant::now();
    for path in event.paths {
        let Some(parent) = path.parent() else {
            continue;
        };
        let target = targets
            .iter()
            .find(|t| t.dir == parent && ticker_from_path(&path, t.aspect).is_some());
        if let Some(target) = target {
            debouncer.touch(path.clone(), target.aspect, now);
        }
    }
}

async fn settled_notification(path: &Path, aspect: ChangedAspect) -> Option<WatchNotification> {
    let ticker = ticker_from_path(path, aspect)?;
    match read_record_file(path).await {
        Ok(payload) => {
            tracing::info!(%ticker, ?aspect, "record file settled");
            Some(WatchNotification::Changed {
                ticker,
                aspect,
                payload,
            })
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "dropping unparsable record file");
            None
        }
    }
}

async fn full_snapshot(targets: &[WatchTarget]) -> Vec<Value> {
    let mut out = Vec::new();
    for target in targets.iter().filter(|t| t.aspect == ChangedAspect::Prediction) {
        match read_record_dir(&target.dir, target.aspect).await {
            Ok(mut values) => out.append(&mut values),
            Err(err) => {
                tracing::warn!(dir = %target.dir.display(), error = %format!("{err:#}"), "full snapshot read failed")
            }
        }
    }
    out
}

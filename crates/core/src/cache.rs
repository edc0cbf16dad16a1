use crate::domain::prediction::PredictionRecord;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_NAMESPACE: &str = "predsync.predictions";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedSnapshot {
    pub predictions: Vec<PredictionRecord>,
    pub saved_at: DateTime<Utc>,
}

/// One namespaced key-value slot backed by a JSON file.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    path: PathBuf,
}

impl SnapshotCache {
    pub fn new(dir: impl AsRef<Path>, namespace: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !namespace.is_empty()
                && namespace
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')),
            "cache namespace must be non-empty and filesystem-safe (got {namespace:?})"
        );
        Ok(Self {
            path: dir.as_ref().join(format!("{namespace}.json")),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached records, or `None` when the slot is missing, empty or unparsable.
    pub async fn load(&self) -> Option<CachedSnapshot> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "snapshot cache unreadable; ignoring");
                return None;
            }
        };

        match serde_json::from_slice::<CachedSnapshot>(&bytes) {
            Ok(snapshot) if snapshot.predictions.is_empty() => None,
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "snapshot cache corrupt; treating as miss");
                None
            }
        }
    }

    pub async fn save(&self, predictions: &[PredictionRecord], saved_at: DateTime<Utc>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create cache dir {} failed", parent.display()))?;
        }

        let body = serde_json::to_vec(&CachedSnapshotRef {
            predictions,
            saved_at,
        })
        .context("serialize snapshot cache failed")?;

        // Write-then-rename so a crash mid-write leaves the previous slot intact.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("write {} failed", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename into {} failed", self.path.display()))?;
        Ok(())
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {} failed", self.path.display())),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CachedSnapshotRef<'a> {
    predictions: &'a [PredictionRecord],
    saved_at: DateTime<Utc>,
}

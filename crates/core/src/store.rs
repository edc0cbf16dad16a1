use crate::watch::ChangedAspect;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Body of `GET /predictions/daily`. Predictions keep their on-disk shape;
/// clients normalize them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub predictions: Vec<Value>,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

impl SnapshotResponse {
    pub fn new(predictions: Vec<Value>, timestamp: DateTime<Utc>) -> Self {
        Self {
            count: predictions.len(),
            predictions,
            timestamp,
        }
    }
}

/// `AAPL_prediction.json` -> `AAPL` for the prediction aspect.
pub fn ticker_from_path(path: &Path, aspect: ChangedAspect) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let ticker = name.strip_suffix(aspect.file_suffix())?;
    let valid = !ticker.is_empty()
        && ticker
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^'));
    valid.then(|| ticker.to_ascii_uppercase())
}

pub fn record_path(dir: &Path, ticker: &str, aspect: ChangedAspect) -> PathBuf {
    dir.join(format!("{}{}", ticker.to_ascii_uppercase(), aspect.file_suffix()))
}

pub async fn read_record_file(path: &Path) -> anyhow::Result<Value> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {} failed", path.display()))?;
    serde_json::from_slice::<Value>(&bytes)
        .with_context(|| format!("{} is not valid JSON", path.display()))
}

/// One ticker's raw record, `None` when the file does not exist.
pub async fn read_record(dir: &Path, ticker: &str, aspect: ChangedAspect) -> anyhow::Result<Option<Value>> {
    let path = record_path(dir, ticker, aspect);
    match tokio::fs::try_exists(&path).await {
        Ok(true) => read_record_file(&path).await.map(Some),
        Ok(false) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("stat {} failed", path.display())),
    }
}

/// Every parsable record file in `dir`, ordered by file name. A missing
/// directory is an empty snapshot; unparsable files are logged and skipped.
pub async fn read_record_dir(dir: &Path, aspect: ChangedAspect) -> anyhow::Result<Vec<Value>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read_dir {} failed", dir.display())),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("iterate {} failed", dir.display()))?
    {
        let path = entry.path();
        if ticker_from_path(&path, aspect).is_some() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        match read_record_file(&path).await {
            Ok(value) => out.push(value),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "skipping unreadable record file");
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_ticker_from_file_name() {
        let p = Path::new("/data/aapl_prediction.json");
        assert_eq!(ticker_from_path(p, ChangedAspect::Prediction), Some("AAPL".to_string()));
        assert_eq!(ticker_from_path(p, ChangedAspect::Sentiment), None);
        assert_eq!(
            ticker_from_path(Path::new("BRK.B_sentiment.json"), ChangedAspect::Sentiment),
            Some("BRK.B".to_string())
        );
        assert_eq!(ticker_from_path(Path::new("_prediction.json"), ChangedAspect::Prediction), None);
        assert_eq!(ticker_from_path(Path::new("summary.json"), ChangedAspect::Prediction), None);
    }

    #[tokio::test]
    async fn missing_directory_is_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let out = read_record_dir(&dir.path().join("nope"), ChangedAspect::Prediction)
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn reads_sorted_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("TSLA_prediction.json"), json!({"ticker": "TSLA"}).to_string()).unwrap();
        std::fs::write(dir.path().join("AAPL_prediction.json"), json!({"ticker": "AAPL"}).to_string()).unwrap();
        std::fs::write(dir.path().join("BAD_prediction.json"), "{oops").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();

        let out = read_record_dir(dir.path(), ChangedAspect::Prediction).await.unwrap();
        let tickers: Vec<_> = out.iter().map(|v| v["ticker"].as_str().unwrap()).collect();
        assert_eq!(tickers, vec!["AAPL", "TSLA"]);

        let one = read_record(dir.path(), "aapl", ChangedAspect::Prediction).await.unwrap();
        assert_eq!(one.unwrap()["ticker"], "AAPL");
        assert!(read_record(dir.path(), "MSFT", ChangedAspect::Prediction).await.unwrap().is_none());
    }
}

use crate::config::Settings;
use crate::store::{read_record_dir, SnapshotResponse};
use crate::watch::ChangedAspect;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PATH: &str = "/predictions/daily";

#[async_trait::async_trait]
pub trait SnapshotFetcher: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn fetch_snapshot(&self) -> Result<SnapshotResponse>;
}

#[derive(Debug, Clone)]
pub struct HttpSnapshotFetcher {
    http: reqwest::Client,
    base_url: String,
    path: String,
}

impl HttpSnapshotFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build snapshot http client")?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            path: DEFAULT_PATH.to_string(),
        })
    }

    pub fn from_settings(settings: &Settings, timeout: Duration) -> Result<Self> {
        Self::new(settings.require_server_url()?, timeout)
    }

    pub fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.path)
    }
}

#[async_trait::async_trait]
impl SnapshotFetcher for HttpSnapshotFetcher {
    fn source_name(&self) -> &'static str {
        "http"
    }

    async fn fetch_snapshot(&self) -> Result<SnapshotResponse> {
        let res = self
            .http
            .get(self.url())
            .send()
            .await
            .context("snapshot request failed")?;

        let status = res.status();
        let text = res.text().await.context("failed to read snapshot response")?;
        if !status.is_success() {
            anyhow::bail!("snapshot endpoint HTTP {status}: {text}");
        }

        serde_json::from_str::<SnapshotResponse>(&text)
            .with_context(|| format!("snapshot response has unexpected shape: {text}"))
    }
}

/// Reads the record directory directly, for clients colocated with the data.
#[derive(Debug, Clone)]
pub struct DirectorySnapshotFetcher {
    dir: PathBuf,
}

impl DirectorySnapshotFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait::async_trait]
impl SnapshotFetcher for DirectorySnapshotFetcher {
    fn source_name(&self) -> &'static str {
        "directory"
    }

    async fn fetch_snapshot(&self) -> Result<SnapshotResponse> {
        let predictions = read_record_dir(&self.dir, ChangedAspect::Prediction).await?;
        Ok(SnapshotResponse::new(predictions, chrono::Utc::now()))
    }
}

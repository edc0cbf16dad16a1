pub mod cache;
pub mod domain;
pub mod normalize;
pub mod poll;
pub mod push;
pub mod reconcile;
pub mod session;
pub mod simulate;
pub mod store;
pub mod watch;

pub mod config {
    use anyhow::Context;
    use std::path::PathBuf;
    use std::str::FromStr;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub sentry_dsn: Option<String>,
        pub predictions_dir: Option<String>,
        pub sentiment_dir: Option<String>,
        pub market_data_dir: Option<String>,
        pub server_url: Option<String>,
        pub ws_url: Option<String>,
        pub cache_dir: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                sentry_dsn: non_empty_var("SENTRY_DSN"),
                predictions_dir: non_empty_var("PREDICTIONS_DIR"),
                sentiment_dir: non_empty_var("SENTIMENT_DIR"),
                market_data_dir: non_empty_var("MARKET_DATA_DIR"),
                server_url: non_empty_var("SERVER_URL"),
                ws_url: non_empty_var("WS_URL"),
                cache_dir: non_empty_var("CACHE_DIR"),
            })
        }

        pub fn require_predictions_dir(&self) -> anyhow::Result<PathBuf> {
            self.predictions_dir
                .as_deref()
                .map(PathBuf::from)
                .context("PREDICTIONS_DIR is required")
        }

        pub fn require_server_url(&self) -> anyhow::Result<&str> {
            self.server_url
                .as_deref()
                .context("SERVER_URL is required")
        }

        /// Push-channel URL, defaulting to the server URL with a ws scheme and `/ws` path.
        pub fn resolve_ws_url(&self) -> anyhow::Result<String> {
            if let Some(url) = &self.ws_url {
                return Ok(url.clone());
            }
            let base = self.require_server_url()?.trim_end_matches('/');
            let swapped = if let Some(rest) = base.strip_prefix("https://") {
                format!("wss://{rest}")
            } else if let Some(rest) = base.strip_prefix("http://") {
                format!("ws://{rest}")
            } else {
                anyhow::bail!("SERVER_URL must start with http:// or https:// (got {base})");
            };
            Ok(format!("{swapped}/ws"))
        }
    }

    fn non_empty_var(key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|s| !s.trim().is_empty())
    }

    pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
        std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
    }

}

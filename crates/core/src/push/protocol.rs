use crate::watch::ChangedAspect;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-to-client push events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// One ticker's new record, in its on-disk shape.
    PredictionUpdated { ticker: String, prediction: Value },
    /// Every current record.
    PredictionsRefresh { predictions: Vec<Value> },
    /// Greeting sent right after the upgrade.
    Connected,
    /// Sentiment or market-data file change. Sync clients ignore it.
    DataUpdated {
        ticker: String,
        aspect: ChangedAspect,
        data: Value,
    },
}

impl ServerEvent {
    /// Ticker the event is scoped to, if any.
    pub fn ticker(&self) -> Option<&str> {
        match self {
            Self::PredictionUpdated { ticker, .. } | Self::DataUpdated { ticker, .. } => Some(ticker.as_str()),
            Self::PredictionsRefresh { .. } | Self::Connected => None,
        }
    }
}

/// Client-to-server commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    Subscribe { ticker: String },
}

/// What a sync client makes of an inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    PredictionUpdated { ticker: String, prediction: Value },
    PredictionsRefresh { predictions: Vec<Value> },
    Connected,
    Unknown { kind: String },
}

/// Decodes one text frame. Unknown `type`s decode to [`InboundEvent::Unknown`];
/// malformed JSON or a known type with missing fields is an error.
pub fn decode_inbound(text: &str) -> anyhow::Result<InboundEvent> {
    let value: Value = serde_json::from_str(text).context("push message is not valid JSON")?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .context("push message has no string `type`")?;

    match kind {
        // `prediction_update` / `data` is the older server spelling.
        "prediction_updated" | "prediction_update" => {
            let prediction = value
                .get("prediction")
                .or_else(|| value.get("data"))
                .filter(|v| v.is_object())
                .cloned()
                .context("prediction_updated without an object `prediction`")?;
            let ticker = value
                .get("ticker")
                .and_then(Value::as_str)
                .or_else(|| prediction.get("ticker").and_then(Value::as_str))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .context("prediction_updated without a ticker")?
                .to_ascii_uppercase();
            Ok(InboundEvent::PredictionUpdated { ticker, prediction })
        }
        "predictions_refresh" => {
            let predictions = value
                .get("predictions")
                .and_then(Value::as_array)
                .cloned()
                .context("predictions_refresh without a `predictions` array")?;
            Ok(InboundEvent::PredictionsRefresh { predictions })
        }
        "connected" => Ok(InboundEvent::Connected),
        other => Ok(InboundEvent::Unknown {
            kind: other.to_string(),
        }),
    }
}

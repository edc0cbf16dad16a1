use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical prediction record shared by the server, the cache and every
/// client-side component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionRecord {
    pub ticker: String,
    pub display_name: String,
    pub timestamp: DateTime<Utc>,
    pub article_count: u32,
    pub sentiment: f64,
    pub signal: Signal,
    pub direction: Direction,
    pub confidence_level: ConfidenceLevel,
    pub score: f64,
    pub reasoning: String,
}

impl PredictionRecord {
    /// True once the record carries a name other than its own ticker.
    pub fn has_real_name(&self) -> bool {
        let name = self.display_name.trim();
        !name.is_empty() && !name.eq_ignore_ascii_case(&self.ticker)
    }
}

/// Which freshness-sensitive fields a payload actually carried. Fields the
/// normalizer had to default are `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentFields {
    pub score: bool,
    pub sentiment: bool,
    pub article_count: bool,
    pub signal: bool,
    pub direction: bool,
    pub confidence_level: bool,
    pub reasoning: bool,
}

impl PresentFields {
    pub const ALL: Self = Self {
        score: true,
        sentiment: true,
        article_count: true,
        signal: true,
        direction: true,
        confidence_level: true,
        reasoning: true,
    };
}

/// A normalized record plus the mask of what its payload supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialRecord {
    pub record: PredictionRecord,
    pub present: PresentFields,
}

impl From<PredictionRecord> for PartialRecord {
    fn from(record: PredictionRecord) -> Self {
        Self {
            record,
            present: PresentFields::ALL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl Signal {
    /// Lenient parse for upstream payloads ("STRONG_BUY", "strong buy", "Strong-Buy").
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        let key: String = raw
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match key.as_str() {
            "STRONGBUY" => Some(Self::StrongBuy),
            "BUY" => Some(Self::Buy),
            "HOLD" | "NEUTRAL" => Some(Self::Hold),
            "SELL" => Some(Self::Sell),
            "STRONGSELL" => Some(Self::StrongSell),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StrongBuy => "STRONG_BUY",
            Self::Buy => "BUY",
            Self::Hold => "HOLD",
            Self::Sell => "SELL",
            Self::StrongSell => "STRONG_SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

impl Direction {
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BULLISH" | "UP" => Some(Self::Bullish),
            "BEARISH" | "DOWN" => Some(Self::Bearish),
            "NEUTRAL" | "FLAT" => Some(Self::Neutral),
            _ => None,
        }
    }

    pub fn from_signal(signal: Signal) -> Self {
        match signal {
            Signal::StrongBuy | Signal::Buy => Self::Bullish,
            Signal::StrongSell | Signal::Sell => Self::Bearish,
            Signal::Hold => Self::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LOW" => Some(Self::Low),
            "MEDIUM" | "MED" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            _ => None,
        }
    }
}

use crate::config::env_parse;
use crate::domain::prediction::{ConfidenceLevel, Direction, Signal};

/// The one score/article-count threshold table. The normalizer and the
/// simulator both derive `signal`, `direction` and `confidenceLevel` through it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdTable {
    /// score >= this is STRONG_BUY.
    pub strong_buy: f64,
    /// score >= this is BUY.
    pub buy: f64,
    /// score <= this is SELL.
    pub sell: f64,
    /// score <= this is STRONG_SELL.
    pub strong_sell: f64,
    pub high_confidence_articles: u32,
    pub medium_confidence_articles: u32,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            strong_buy: 0.55,
            buy: 0.15,
            sell: -0.15,
            strong_sell: -0.55,
            high_confidence_articles: 30,
            medium_confidence_articles: 15,
        }
    }
}

impl ThresholdTable {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();
        let table = Self {
            strong_buy: env_parse("SIGNAL_STRONG_BUY").unwrap_or(d.strong_buy),
            buy: env_parse("SIGNAL_BUY").unwrap_or(d.buy),
            sell: env_parse("SIGNAL_SELL").unwrap_or(d.sell),
            strong_sell: env_parse("SIGNAL_STRONG_SELL").unwrap_or(d.strong_sell),
            high_confidence_articles: env_parse("CONFIDENCE_HIGH_ARTICLES")
                .unwrap_or(d.high_confidence_articles),
            medium_confidence_articles: env_parse("CONFIDENCE_MEDIUM_ARTICLES")
                .unwrap_or(d.medium_confidence_articles),
        };
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.strong_sell < self.sell && self.sell < self.buy && self.buy < self.strong_buy,
            "signal thresholds must satisfy strong_sell < sell < buy < strong_buy (got {} / {} / {} / {})",
            self.strong_sell,
            self.sell,
            self.buy,
            self.strong_buy
        );
        anyhow::ensure!(
            self.medium_confidence_articles <= self.high_confidence_articles,
            "medium confidence article threshold must not exceed the high one"
        );
        Ok(())
    }

    pub fn derive_signal(&self, score: f64) -> Signal {
        if score >= self.strong_buy {
            Signal::StrongBuy
        } else if score >= self.buy {
            Signal::Buy
        } else if score <= self.strong_sell {
            Signal::StrongSell
        } else if score <= self.sell {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }

    pub fn derive_direction(&self, score: f64) -> Direction {
        Direction::from_signal(self.derive_signal(score))
    }

    pub fn derive_confidence(&self, article_count: u32) -> ConfidenceLevel {
        if article_count >= self.high_confidence_articles {
            ConfidenceLevel::High
        } else if article_count >= self.medium_confidence_articles {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

/// Reasoning text used when an authoritative payload did not supply one.
pub fn default_reasoning(signal: Signal, article_count: u32) -> String {
    let polarity = match Direction::from_signal(signal) {
        Direction::Bullish => "Bullish",
        Direction::Bearish => "Bearish",
        Direction::Neutral => "Neutral",
    };
    let noun = if article_count == 1 { "article" } else { "articles" };
    format!(
        "{polarity} outlook ({}) based on {article_count} recent {noun}",
        signal.as_str()
    )
}

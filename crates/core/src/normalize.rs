use crate::domain::prediction::{
    ConfidenceLevel, Direction, PartialRecord, PredictionRecord, PresentFields, Signal,
};
use crate::domain::thresholds::{default_reasoning, ThresholdTable};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

pub const DEFAULT_MAX_ARTICLE_COUNT: u32 = 200;
pub const UNKNOWN_TICKER: &str = "N/A";

// Magnitudes above this are read as a -100..100 percentage scale.
const PERCENT_SCALE_CUTOFF: f64 = 1.5;

const TICKER_PATHS: &[&[&str]] = &[&["ticker"], &["symbol"]];
const NAME_PATHS: &[&[&str]] = &[
    &["displayName"],
    &["display_name"],
    &["company_name"],
    &["companyName"],
    &["name"],
];
const SCORE_PATHS: &[&[&str]] = &[
    &["score"],
    &["combined_score"],
    &["prediction", "combined_score"],
    &["prediction", "score"],
];
const PERCENT_SCORE_PATHS: &[&[&str]] = &[&["signal_strength"], &["prediction", "signal_strength"]];
const SENTIMENT_PATHS: &[&[&str]] = &[
    &["sentiment"],
    &["sentiment_score"],
    &["prediction", "sentiment"],
    &["prediction", "components", "general_sentiment", "score"],
];
const ARTICLE_PATHS: &[&[&str]] = &[
    &["articleCount"],
    &["article_count"],
    &["prediction", "article_count"],
];
const SIGNAL_PATHS: &[&[&str]] = &[
    &["signal"],
    &["final_signal"],
    &["prediction", "final_signal"],
    &["prediction", "signal"],
];
const DIRECTION_PATHS: &[&[&str]] = &[&["direction"], &["prediction", "direction"]];
const CONFIDENCE_PATHS: &[&[&str]] = &[
    &["confidenceLevel"],
    &["confidence_level"],
    &["prediction", "confidence_level"],
];
const REASONING_PATHS: &[&[&str]] = &[&["reasoning"], &["prediction", "reasoning"]];
const TIMESTAMP_PATHS: &[&[&str]] = &[
    &["timestamp"],
    &["generated_at"],
    &["prediction", "timestamp"],
];

#[derive(Debug, Clone)]
pub struct Normalizer {
    thresholds: ThresholdTable,
    max_article_count: u32,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(ThresholdTable::default(), DEFAULT_MAX_ARTICLE_COUNT)
    }
}

impl Normalizer {
    pub fn new(thresholds: ThresholdTable, max_article_count: u32) -> Self {
        Self {
            thresholds,
            max_article_count,
        }
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    pub fn max_article_count(&self) -> u32 {
        self.max_article_count
    }

    /// Returns `None` only when the payload is not a JSON object. `now` stamps
    /// records whose payload carries no parsable timestamp.
    pub fn normalize(&self, payload: &Value, now: DateTime<Utc>) -> Option<PredictionRecord> {
        self.normalize_update(payload, now).map(|partial| partial.record)
    }

    /// Like [`Normalizer::normalize`], also reporting which fields the payload
    /// supplied. Labels derived from a supplied score or article count count
    /// as supplied.
    pub fn normalize_update(&self, payload: &Value, now: DateTime<Utc>) -> Option<PartialRecord> {
        if !payload.is_object() {
            return None;
        }

        let ticker = first_string(payload, TICKER_PATHS)
            .map(|s| s.to_ascii_uppercase())
            .unwrap_or_else(|| UNKNOWN_TICKER.to_string());

        let display_name = first_string(payload, NAME_PATHS).unwrap_or_else(|| ticker.clone());

        let sentiment_raw = first_number(payload, SENTIMENT_PATHS).map(clamp_unit);
        let score_raw = first_number(payload, SCORE_PATHS)
            .map(|v| {
                if v.abs() > PERCENT_SCALE_CUTOFF {
                    v / 100.0
                } else {
                    v
                }
            })
            .or_else(|| first_number(payload, PERCENT_SCORE_PATHS).map(|v| v / 100.0))
            .or(sentiment_raw)
            .map(clamp_unit);
        let score = score_raw.unwrap_or(0.0);
        let sentiment = sentiment_raw.unwrap_or(score);

        let articles_raw = first_number(payload, ARTICLE_PATHS).or_else(|| data_source_articles(payload));
        let article_count = articles_raw.map(|v| self.clamp_articles(v)).unwrap_or(0);

        let explicit_signal = first_string(payload, SIGNAL_PATHS).and_then(|s| Signal::parse_lenient(&s));
        let signal = explicit_signal.unwrap_or_else(|| self.thresholds.derive_signal(score));
        let explicit_direction =
            first_string(payload, DIRECTION_PATHS).and_then(|s| Direction::parse_lenient(&s));
        let direction = explicit_direction.unwrap_or_else(|| Direction::from_signal(signal));
        let explicit_confidence =
            first_string(payload, CONFIDENCE_PATHS).and_then(|s| ConfidenceLevel::parse_lenient(&s));
        let confidence_level =
            explicit_confidence.unwrap_or_else(|| self.thresholds.derive_confidence(article_count));
        let explicit_reasoning = first_string(payload, REASONING_PATHS);
        let reasoning_present = explicit_reasoning.is_some();
        let reasoning = explicit_reasoning.unwrap_or_else(|| default_reasoning(signal, article_count));
        let timestamp = first_string(payload, TIMESTAMP_PATHS)
            .and_then(|s| parse_timestamp(&s))
            .unwrap_or(now);

        let signal_present = explicit_signal.is_some() || score_raw.is_some();
        let present = PresentFields {
            score: score_raw.is_some(),
            sentiment: sentiment_raw.is_some(),
            article_count: articles_raw.is_some(),
            signal: signal_present,
            direction: explicit_direction.is_some() || signal_present,
            confidence_level: explicit_confidence.is_some() || articles_raw.is_some(),
            reasoning: reasoning_present,
        };

        Some(PartialRecord {
            record: PredictionRecord {
                ticker,
                display_name,
                timestamp,
                article_count,
                sentiment,
                signal,
                direction,
                confidence_level,
                score,
                reasoning,
            },
            present,
        })
    }

    /// Normalizes every payload, logging and skipping the ones that are not objects.
    pub fn normalize_all(&self, payloads: &[Value], now: DateTime<Utc>) -> Vec<PredictionRecord> {
        let mut out = Vec::with_capacity(payloads.len());
        for (idx, payload) in payloads.iter().enumerate() {
            match self.normalize(payload, now) {
                Some(record) => out.push(record),
                None => tracing::warn!(idx, "skipping prediction payload that is not an object"),
            }
        }
        out
    }

    pub fn clamp_articles(&self, raw: f64) -> u32 {
        if !raw.is_finite() || raw <= 0.0 {
            return 0;
        }
        let rounded = raw.round();
        if rounded >= self.max_article_count as f64 {
            self.max_article_count
        } else {
            rounded as u32
        }
    }
}

pub fn clamp_unit(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// String-to-number coercion. Unparsable strings and non-finite values become 0;
/// `null`, arrays and objects count as absent.
pub fn tolerant_number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().unwrap_or(0.0),
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    Some(if n.is_finite() { n } else { 0.0 })
}

fn lookup<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = payload;
    for key in path {
        cur = cur.get(*key)?;
    }
    (!cur.is_null()).then_some(cur)
}

fn first_number(payload: &Value, paths: &[&[&str]]) -> Option<f64> {
    paths
        .iter()
        .find_map(|path| lookup(payload, path).and_then(tolerant_number))
}

fn first_string(payload: &Value, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| {
        lookup(payload, path)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn data_source_articles(payload: &Value) -> Option<f64> {
    let sources = lookup(payload, &["data_sources"])?;
    let general = sources.get("general_articles").and_then(tolerant_number);
    let financial = sources.get("financial_articles").and_then(tolerant_number);
    match (general, financial) {
        (None, None) => None,
        (g, f) => Some(g.unwrap_or(0.0) + f.unwrap_or(0.0)),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

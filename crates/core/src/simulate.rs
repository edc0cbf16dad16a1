use crate::domain::prediction::PredictionRecord;
use crate::domain::thresholds::{default_reasoning, ThresholdTable};
use crate::normalize::clamp_unit;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_MAGNITUDE: f64 = 0.15;
const MAX_ARTICLE_DRIFT: u32 = 2;

#[derive(Debug)]
pub struct Simulator {
    thresholds: ThresholdTable,
    max_article_count: u32,
    magnitude: f64,
    rng: StdRng,
}

impl Simulator {
    pub fn new(thresholds: ThresholdTable, max_article_count: u32, magnitude: f64) -> anyhow::Result<Self> {
        Self::with_rng(thresholds, max_article_count, magnitude, StdRng::from_entropy())
    }

    pub fn with_seed(
        thresholds: ThresholdTable,
        max_article_count: u32,
        magnitude: f64,
        seed: u64,
    ) -> anyhow::Result<Self> {
        Self::with_rng(thresholds, max_article_count, magnitude, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        thresholds: ThresholdTable,
        max_article_count: u32,
        magnitude: f64,
        rng: StdRng,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            magnitude.is_finite() && magnitude > 0.0 && magnitude <= 1.0,
            "simulation magnitude must be in (0, 1] (got {magnitude})"
        );
        Ok(Self {
            thresholds,
            max_article_count,
            magnitude,
            rng,
        })
    }

    /// Returns a perturbed copy of every record. Labels and reasoning are
    /// re-derived from the new score and article count; ticker and display
    /// name are carried through untouched.
    pub fn perturb(&mut self, records: &[PredictionRecord], now: DateTime<Utc>) -> Vec<PredictionRecord> {
        records
            .iter()
            .map(|record| self.perturb_one(record, now))
            .collect()
    }

    fn perturb_one(&mut self, record: &PredictionRecord, now: DateTime<Utc>) -> PredictionRecord {
        let m = self.magnitude;
        let score = clamp_unit(record.score + self.rng.gen_range(-m..=m));
        let sentiment = clamp_unit(record.sentiment + self.rng.gen_range(-m..=m));
        let drift = self.rng.gen_range(0..=MAX_ARTICLE_DRIFT);
        let article_count = record
            .article_count
            .saturating_add(drift)
            .min(self.max_article_count);

        let signal = self.thresholds.derive_signal(score);
        PredictionRecord {
            ticker: record.ticker.clone(),
            display_name: record.display_name.clone(),
            timestamp: now,
            article_count,
            sentiment,
            signal,
            direction: self.thresholds.derive_direction(score),
            confidence_level: self.thresholds.derive_confidence(article_count),
            score,
            reasoning: default_reasoning(signal, article_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::prediction::Direction;
    use crate::normalize::{Normalizer, DEFAULT_MAX_ARTICLE_COUNT};
    use crate::reconcile::{reconcile, Incoming, SourceKind};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn seed_records() -> Vec<PredictionRecord> {
        let now = Utc.with_ymd_and_hms(2026, 1, 27, 10, 0, 0).unwrap();
        Normalizer::default().normalize_all(
            &[
                json!({"ticker": "AAPL", "company_name": "Apple Inc.", "score": 0.98, "sentiment": -0.99, "article_count": 199}),
                json!({"ticker": "TSLA", "score": -0.95, "sentiment": 0.97, "article_count": 0}),
                json!({"ticker": "MSFT", "score": 0.0, "article_count": 15}),
            ],
            now,
        )
    }

    #[test]
    fn bounds_hold_over_many_ticks() {
        let table = ThresholdTable::default();
        let mut sim = Simulator::with_seed(table, DEFAULT_MAX_ARTICLE_COUNT, 0.2, 7).unwrap();
        let start = Utc.with_ymd_and_hms(2026, 1, 27, 10, 0, 0).unwrap();
        let mut records = seed_records();

        for tick in 1..=500 {
            let now = start + Duration::seconds(5 * tick);
            let perturbed = sim.perturb(&records, now);
            records = reconcile(&records, Incoming::Batch(perturbed), SourceKind::Simulator);

            for r in &records {
                assert!((-1.0..=1.0).contains(&r.score), "score out of range: {}", r.score);
                assert!((-1.0..=1.0).contains(&r.sentiment), "sentiment out of range: {}", r.sentiment);
                assert!(r.article_count <= DEFAULT_MAX_ARTICLE_COUNT);
                assert_eq!(r.signal, table.derive_signal(r.score));
                assert_eq!(r.direction, Direction::from_signal(r.signal));
                assert_eq!(r.confidence_level, table.derive_confidence(r.article_count));
                assert_eq!(r.timestamp, now);
            }
        }
    }

    #[test]
    fn never_changes_identity_or_membership() {
        let mut sim = Simulator::with_seed(ThresholdTable::default(), DEFAULT_MAX_ARTICLE_COUNT, 0.15, 1).unwrap();
        let records = seed_records();
        let now = Utc.with_ymd_and_hms(2026, 1, 27, 10, 0, 5).unwrap();
        let out = sim.perturb(&records, now);
        assert_eq!(out.len(), records.len());
        for (before, after) in records.iter().zip(&out) {
            assert_eq!(before.ticker, after.ticker);
            assert_eq!(before.display_name, after.display_name);
            assert!((after.score - before.score).abs() <= 0.15 + 1e-12);
        }
    }

    #[test]
    fn rejects_out_of_range_magnitude() {
        let t = ThresholdTable::default();
        assert!(Simulator::new(t, 200, 0.0).is_err());
        assert!(Simulator::new(t, 200, 1.5).is_err());
        assert!(Simulator::new(t, 200, f64::NAN).is_err());
    }
}

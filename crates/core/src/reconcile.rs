//! Merges incoming records into the visible collection.
//!
//! `ticker` is identity. `displayName` never regresses to a bare ticker and the
//! simulator never touches it. Every other field belongs to whoever last
//! supplied it.

use crate::domain::prediction::{PartialRecord, PredictionRecord};
use crate::domain::thresholds::default_reasoning;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    InitialLoad,
    Cache,
    Poll,
    Push,
    Simulator,
}

impl SourceKind {
    pub fn is_authoritative(self) -> bool {
        matches!(self, Self::InitialLoad | Self::Poll | Self::Push)
    }
}

#[derive(Debug, Clone)]
pub enum Incoming {
    /// A single partial update (push `prediction_updated`). Fields its
    /// payload did not carry keep their current values.
    One(PartialRecord),
    /// Several partial updates; unseen tickers are appended, nothing reorders.
    Batch(Vec<PredictionRecord>),
    /// A full authoritative snapshot. Its order becomes the visible order;
    /// known tickers missing from it are kept after the snapshot's own.
    Snapshot(Vec<PredictionRecord>),
}

impl Incoming {
    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Batch(v) | Self::Snapshot(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn reconcile(
    current: &[PredictionRecord],
    incoming: Incoming,
    source: SourceKind,
) -> Vec<PredictionRecord> {
    match incoming {
        Incoming::One(update) => merge_in_place(current, vec![update], source),
        Incoming::Batch(records) => {
            merge_in_place(current, records.into_iter().map(PartialRecord::from).collect(), source)
        }
        Incoming::Snapshot(records) => replace_with_snapshot(current, records, source),
    }
}

fn merge_in_place(
    current: &[PredictionRecord],
    updates: Vec<PartialRecord>,
    source: SourceKind,
) -> Vec<PredictionRecord> {
    let mut out = current.to_vec();
    let mut index: HashMap<String, usize> = out
        .iter()
        .enumerate()
        .map(|(i, r)| (r.ticker.clone(), i))
        .collect();

    for update in updates {
        match index.get(&update.record.ticker) {
            Some(&i) => {
                out[i] = merge_record(&out[i], update, source);
            }
            None => {
                if source == SourceKind::Simulator {
                    // The simulator only perturbs tickers it was handed.
                    tracing::debug!(ticker = %update.record.ticker, "dropping simulated record for unknown ticker");
                    continue;
                }
                index.insert(update.record.ticker.clone(), out.len());
                out.push(update.record);
            }
        }
    }

    out
}

fn replace_with_snapshot(
    current: &[PredictionRecord],
    records: Vec<PredictionRecord>,
    source: SourceKind,
) -> Vec<PredictionRecord> {
    let existing: HashMap<&str, &PredictionRecord> =
        current.iter().map(|r| (r.ticker.as_str(), r)).collect();

    let mut out: Vec<PredictionRecord> = Vec::with_capacity(current.len().max(records.len()));
    let mut index: HashMap<String, usize> = HashMap::with_capacity(records.len());

    for record in records {
        if let Some(&i) = index.get(&record.ticker) {
            out[i] = merge_record(&out[i], record.into(), source);
            continue;
        }
        let merged = match existing.get(record.ticker.as_str()) {
            Some(prev) => merge_record(prev, record.into(), source),
            None if source == SourceKind::Simulator => continue,
            None => record,
        };
        index.insert(merged.ticker.clone(), out.len());
        out.push(merged);
    }

    // Retained: a transient backend gap must not make a ticker disappear.
    for prev in current {
        if !index.contains_key(&prev.ticker) {
            index.insert(prev.ticker.clone(), out.len());
            out.push(prev.clone());
        }
    }

    out
}

fn merge_record(existing: &PredictionRecord, update: PartialRecord, source: SourceKind) -> PredictionRecord {
    let PartialRecord {
        record: incoming,
        present,
    } = update;

    let display_name = if source != SourceKind::Simulator && incoming.has_real_name() {
        incoming.display_name
    } else {
        existing.display_name.clone()
    };

    let article_count = if present.article_count {
        incoming.article_count
    } else {
        existing.article_count
    };
    let signal = if present.signal {
        incoming.signal
    } else {
        existing.signal
    };
    let reasoning = if present.reasoning {
        incoming.reasoning
    } else if present.signal || present.article_count {
        default_reasoning(signal, article_count)
    } else {
        existing.reasoning.clone()
    };

    PredictionRecord {
        ticker: existing.ticker.clone(),
        display_name,
        timestamp: incoming.timestamp,
        article_count,
        sentiment: if present.sentiment {
            incoming.sentiment
        } else {
            existing.sentiment
        },
        signal,
        direction: if present.direction {
            incoming.direction
        } else {
            existing.direction
        },
        confidence_level: if present.confidence_level {
            incoming.confidence_level
        } else {
            existing.confidence_level
        },
        score: if present.score {
            incoming.score
        } else {
            existing.score
        },
        reasoning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::prediction::{ConfidenceLevel, Direction, Signal};
    use crate::normalize::Normalizer;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    fn rec(v: Value) -> PredictionRecord {
        Normalizer::default().normalize(&v, now()).unwrap()
    }

    fn update(v: Value) -> PartialRecord {
        Normalizer::default().normalize_update(&v, now()).unwrap()
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 27, 10, 0, 0).unwrap()
    }

    fn tickers(records: &[PredictionRecord]) -> Vec<&str> {
        records.iter().map(|r| r.ticker.as_str()).collect()
    }

    #[test]
    fn push_into_empty_collection_creates_one_record() {
        let incoming = update(json!({
            "ticker": "AAPL",
            "prediction": {
                "final_signal": "BUY",
                "direction": "BULLISH",
                "combined_score": 0.3,
                "confidence_level": "MEDIUM",
                "reasoning": "x"
            }
        }));
        let out = reconcile(&[], Incoming::One(incoming), SourceKind::Push);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ticker, "AAPL");
        assert_eq!(out[0].signal.as_str(), "BUY");
    }

    #[test]
    fn poll_snapshot_updates_and_appends_in_order() {
        let current = vec![rec(json!({"ticker": "MSFT", "score": 0.2}))];
        let snapshot = vec![
            rec(json!({"ticker": "MSFT", "score": 0.5})),
            rec(json!({"ticker": "TSLA", "score": -0.7})),
        ];
        let out = reconcile(&current, Incoming::Snapshot(snapshot), SourceKind::Poll);
        assert_eq!(tickers(&out), vec!["MSFT", "TSLA"]);
        assert_eq!(out[0].score, 0.5);
        assert_eq!(out[1].signal.as_str(), "STRONG_SELL");
    }

    #[test]
    fn snapshot_omitting_a_ticker_retains_it_at_the_end() {
        let current = vec![
            rec(json!({"ticker": "A", "score": 0.1})),
            rec(json!({"ticker": "B", "score": 0.1})),
            rec(json!({"ticker": "C", "score": 0.1})),
        ];
        let snapshot = vec![rec(json!({"ticker": "C", "score": 0.3})), rec(json!({"ticker": "B"}))];
        let out = reconcile(&current, Incoming::Snapshot(snapshot), SourceKind::Poll);
        assert_eq!(tickers(&out), vec!["C", "B", "A"]);
        assert_eq!(out[2], current[0]);
    }

    #[test]
    fn partial_updates_keep_positions_and_append_unseen() {
        let current = vec![rec(json!({"ticker": "A"})), rec(json!({"ticker": "B"}))];
        let batch = vec![rec(json!({"ticker": "C"})), rec(json!({"ticker": "A", "score": 0.9}))];
        let out = reconcile(&current, Incoming::Batch(batch), SourceKind::Push);
        assert_eq!(tickers(&out), vec!["A", "B", "C"]);
        assert_eq!(out[0].score, 0.9);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let current = vec![
            rec(json!({"ticker": "A", "company_name": "Alpha", "score": 0.1})),
            rec(json!({"ticker": "B", "score": -0.2})),
        ];
        let cases = vec![
            Incoming::One(update(json!({"ticker": "B", "score": 0.4}))),
            Incoming::Batch(vec![
                rec(json!({"ticker": "A"})),
                rec(json!({"ticker": "D", "company_name": "Delta"})),
                rec(json!({"ticker": "D", "score": 0.7})),
            ]),
            Incoming::Snapshot(vec![
                rec(json!({"ticker": "C", "score": 0.3})),
                rec(json!({"ticker": "A", "score": 0.6})),
                rec(json!({"ticker": "C", "company_name": "Charlie"})),
            ]),
            Incoming::Snapshot(vec![]),
        ];
        for incoming in cases {
            for source in [SourceKind::Poll, SourceKind::Push, SourceKind::Simulator] {
                let once = reconcile(&current, incoming.clone(), source);
                let twice = reconcile(&once, incoming.clone(), source);
                assert_eq!(once, twice, "not idempotent for {source:?}");
            }
        }
    }

    #[test]
    fn display_name_never_regresses_to_ticker() {
        let current = vec![rec(json!({"ticker": "AAPL", "company_name": "Apple Inc."}))];
        let out = reconcile(
            &current,
            Incoming::One(update(json!({"ticker": "AAPL", "score": 0.3}))),
            SourceKind::Push,
        );
        assert_eq!(out[0].display_name, "Apple Inc.");

        let out = reconcile(
            &out,
            Incoming::One(update(json!({"ticker": "AAPL", "company_name": "Apple"}))),
            SourceKind::Poll,
        );
        assert_eq!(out[0].display_name, "Apple");
    }

    #[test]
    fn simulator_cannot_rename_or_invent_tickers() {
        let current = vec![rec(json!({"ticker": "AAPL", "company_name": "Apple Inc."}))];
        let mut perturbed = current[0].clone();
        perturbed.display_name = "Something Else".to_string();
        perturbed.score = -0.9;
        let stranger = rec(json!({"ticker": "ZZZ"}));
        let out = reconcile(
            &current,
            Incoming::Batch(vec![perturbed, stranger]),
            SourceKind::Simulator,
        );
        assert_eq!(tickers(&out), vec!["AAPL"]);
        assert_eq!(out[0].display_name, "Apple Inc.");
        assert_eq!(out[0].score, -0.9);
    }

    #[test]
    fn authoritative_update_overwrites_simulated_values() {
        let current = vec![rec(json!({"ticker": "AAPL", "score": 0.2}))];
        let mut simulated = current[0].clone();
        simulated.score = 0.35;
        let after_sim = reconcile(&current, Incoming::One(simulated.into()), SourceKind::Simulator);
        assert_eq!(after_sim[0].score, 0.35);

        let after_poll = reconcile(
            &after_sim,
            Incoming::Snapshot(vec![rec(json!({"ticker": "AAPL", "score": 0.1}))]),
            SourceKind::Poll,
        );
        assert_eq!(after_poll[0].score, 0.1);
    }

    #[test]
    fn partial_push_keeps_fields_it_did_not_carry() {
        let current = vec![rec(json!({
            "ticker": "AAPL",
            "company_name": "Apple Inc.",
            "score": -0.3,
            "sentiment": -0.4,
            "article_count": 40,
            "reasoning": "analyst note"
        }))];
        assert_eq!(current[0].confidence_level, ConfidenceLevel::High);

        let out = reconcile(
            &current,
            Incoming::One(update(json!({"ticker": "AAPL", "prediction": {"combined_score": 0.35}}))),
            SourceKind::Push,
        );
        let merged = &out[0];
        assert_eq!(merged.score, 0.35);
        assert_eq!(merged.signal, Signal::Buy);
        assert_eq!(merged.direction, Direction::Bullish);
        assert_eq!(merged.article_count, 40);
        assert_eq!(merged.sentiment, -0.4);
        assert_eq!(merged.confidence_level, ConfidenceLevel::High);
        assert_eq!(merged.reasoning, default_reasoning(Signal::Buy, 40));
        assert_eq!(merged.display_name, "Apple Inc.");

        let twice = reconcile(
            &out,
            Incoming::One(update(json!({"ticker": "AAPL", "prediction": {"combined_score": 0.35}}))),
            SourceKind::Push,
        );
        assert_eq!(twice, out);
    }

    #[test]
    fn article_only_push_rederives_confidence_and_keeps_score() {
        let current = vec![rec(json!({"ticker": "MSFT", "score": 0.6, "article_count": 40, "reasoning": "x"}))];
        let out = reconcile(
            &current,
            Incoming::One(update(json!({"ticker": "MSFT", "articleCount": 5}))),
            SourceKind::Push,
        );
        assert_eq!(out[0].score, 0.6);
        assert_eq!(out[0].signal, Signal::StrongBuy);
        assert_eq!(out[0].article_count, 5);
        assert_eq!(out[0].confidence_level, ConfidenceLevel::Low);
        assert_eq!(out[0].reasoning, default_reasoning(Signal::StrongBuy, 5));
    }
}

//! Evaluation summaries
//!
//! Per-row scores are aggregated leaf by leaf. Boolean leaves become
//! `{true_count, true_fraction}`, numeric leaves become `{mean}`, and nested scores keep
//! their shape. A row contributes to a leaf only if it produced a value for it, so
//! failed scorers shrink the denominator instead of counting as `false`.

use crate::score::ScoreValue;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Reserved summary keys
pub const MODEL_SUCCESS: &str = "model_success";
pub const MODEL_LATENCY: &str = "model_latency";

/// Aggregate of one score leaf (or subtree) across rows
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Aggregate {
    Bool { true_count: usize, true_fraction: f64 },
    Numeric { mean: f64 },
    Nested(BTreeMap<String, Aggregate>),
}

impl Aggregate {
    pub fn of_bools(values: impl IntoIterator<Item = bool>) -> Option<Self> {
        let (mut count, mut true_count) = (0usize, 0usize);
        for v in values {
            count += 1;
            true_count += usize::from(v);
        }
        (count > 0).then(|| Aggregate::Bool {
            true_count,
            true_fraction: true_count as f64 / count as f64,
        })
    }

    pub fn of_numbers(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let (mut count, mut sum) = (0usize, 0.0);
        for v in values {
            count += 1;
            sum += v;
        }
        (count > 0).then(|| Aggregate::Numeric {
            mean: sum / count as f64,
        })
    }

    /// Aggregate the values one key produced across rows.
    ///
    /// The first value decides the leaf kind; values of another kind are ignored.
    pub fn of_scores(values: &[&ScoreValue]) -> Option<Self> {
        let first = values.first()?;
        let aggregate = match first {
            ScoreValue::Bool(_) => Self::of_bools(values.iter().filter_map(|v| v.as_bool())),
            ScoreValue::Number(_) => Self::of_numbers(values.iter().filter_map(|v| v.as_f64())),
            ScoreValue::Nested(_) => {
                let maps: Vec<&BTreeMap<String, ScoreValue>> = values
                    .iter()
                    .filter_map(|v| match v {
                        ScoreValue::Nested(map) => Some(map),
                        _ => None,
                    })
                    .collect();
                let keys: BTreeSet<&String> = maps.iter().flat_map(|m| m.keys()).collect();

                let nested: BTreeMap<String, Aggregate> = keys
                    .into_iter()
                    .filter_map(|key| {
                        let leaf: Vec<&ScoreValue> =
                            maps.iter().filter_map(|m| m.get(key)).collect();
                        Self::of_scores(&leaf).map(|agg| (key.clone(), agg))
                    })
                    .collect();
                Some(Aggregate::Nested(nested))
            }
        };

        let kept = match &aggregate {
            Some(Aggregate::Bool { .. }) => values.iter().filter(|v| v.as_bool().is_some()).count(),
            Some(Aggregate::Numeric { .. }) => {
                values.iter().filter(|v| v.as_f64().is_some()).count()
            }
            _ => values
                .iter()
                .filter(|v| matches!(v, ScoreValue::Nested(_)))
                .count(),
        };
        if kept < values.len() {
            debug!(
                "Ignoring {} score values of a different kind",
                values.len() - kept
            );
        }
        aggregate
    }

    pub fn true_count(&self) -> Option<usize> {
        match self {
            Aggregate::Bool { true_count, .. } => Some(*true_count),
            _ => None,
        }
    }

    pub fn true_fraction(&self) -> Option<f64> {
        match self {
            Aggregate::Bool { true_fraction, .. } => Some(*true_fraction),
            _ => None,
        }
    }

    pub fn mean(&self) -> Option<f64> {
        match self {
            Aggregate::Numeric { mean } => Some(*mean),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Aggregate> {
        match self {
            Aggregate::Nested(map) => map.get(key),
            _ => None,
        }
    }
}

/// What the summarizer needs from one evaluated row
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowScores {
    pub model_success: bool,

    /// `None` when the model never ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_latency: Option<f64>,

    /// Successful scores by scorer name
    pub scores: BTreeMap<String, ScoreValue>,
}

/// Aggregated statistics for one evaluation run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationSummary {
    /// Aggregates by scorer name
    #[serde(flatten)]
    pub scorers: BTreeMap<String, Aggregate>,

    pub model_success: Aggregate,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_latency: Option<Aggregate>,
}

impl EvaluationSummary {
    pub fn scorer(&self, name: &str) -> Option<&Aggregate> {
        self.scorers.get(name)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Aggregate per-row results into a summary
pub fn summarize<'a>(rows: impl IntoIterator<Item = &'a RowScores>) -> EvaluationSummary {
    let rows: Vec<&RowScores> = rows.into_iter().collect();

    let model_success = Aggregate::of_bools(rows.iter().map(|r| r.model_success)).unwrap_or(
        Aggregate::Bool {
            true_count: 0,
            true_fraction: 0.0,
        },
    );
    let model_latency = Aggregate::of_numbers(rows.iter().filter_map(|r| r.model_latency));

    let names: BTreeSet<&String> = rows.iter().flat_map(|r| r.scores.keys()).collect();
    let scorers = names
        .into_iter()
        .filter_map(|name| {
            let values: Vec<&ScoreValue> = rows.iter().filter_map(|r| r.scores.get(name)).collect();
            Aggregate::of_scores(&values).map(|agg| (name.clone(), agg))
        })
        .collect();

    EvaluationSummary {
        scorers,
        model_success,
        model_latency,
    }
}

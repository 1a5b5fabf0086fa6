//! Score values produced by scorers

use crate::error::{EvalError, EvalResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Output of one scorer on one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreValue {
    Bool(bool),
    Number(f64),
    Nested(BTreeMap<String, ScoreValue>),
}

impl ScoreValue {
    /// Convert arbitrary JSON into a score.
    ///
    /// Only booleans, numbers and objects of those are scores.
    pub fn from_json(value: Value) -> EvalResult<Self> {
        match value {
            Value::Bool(b) => Ok(ScoreValue::Bool(b)),
            Value::Number(n) => n
                .as_f64()
                .map(ScoreValue::Number)
                .ok_or_else(|| EvalError::Score(format!("number {} is not finite", n))),
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| {
                    Self::from_json(v)
                        .map(|score| (k.clone(), score))
                        .map_err(|e| EvalError::Score(format!("{}: {}", k, e)))
                })
                .collect::<EvalResult<BTreeMap<_, _>>>()
                .map(ScoreValue::Nested),
            other => Err(EvalError::Score(format!(
                "expected a boolean, number or object, got {}",
                other
            ))),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScoreValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScoreValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&ScoreValue> {
        match self {
            ScoreValue::Nested(map) => map.get(key),
            _ => None,
        }
    }
}

impl From<bool> for ScoreValue {
    fn from(b: bool) -> Self {
        ScoreValue::Bool(b)
    }
}

impl From<f64> for ScoreValue {
    fn from(n: f64) -> Self {
        ScoreValue::Number(n)
    }
}

impl From<i64> for ScoreValue {
    fn from(n: i64) -> Self {
        ScoreValue::Number(n as f64)
    }
}

impl<K: Into<String>, V: Into<ScoreValue>> FromIterator<(K, V)> for ScoreValue {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        ScoreValue::Nested(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

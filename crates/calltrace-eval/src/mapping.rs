//! Column mapping between dataset columns and model/scorer parameters

use crate::dataset::Row;
use crate::error::{EvalError, EvalResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Renames dataset columns to the parameter names models and scorers declare.
///
/// Keys are parameter names, values are column names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnMapping(BTreeMap<String, String>);

impl ColumnMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map parameter `param` to dataset column `column`
    pub fn map(mut self, param: impl Into<String>, column: impl Into<String>) -> Self {
        self.0.insert(param.into(), column.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Remap one row.
    ///
    /// Every mapped parameter takes its column's value and the source column is
    /// removed; unmapped columns pass through. A mapped column missing from the row is
    /// an error for that row only.
    pub fn apply(&self, row: &Row) -> EvalResult<Row> {
        if self.0.is_empty() {
            return Ok(row.clone());
        }

        let mut out = row.clone();
        for column in self.0.values() {
            out.remove(column);
        }
        for (param, column) in &self.0 {
            let value = row.get(column).ok_or_else(|| EvalError::Mapping {
                param: param.clone(),
                column: column.clone(),
            })?;
            out.insert(param.clone(), value.clone());
        }
        Ok(out)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ColumnMapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

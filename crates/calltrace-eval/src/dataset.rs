//! Datasets - ordered rows of attribute mappings

use crate::error::{EvalError, EvalResult};
use calltrace_core::{ObjectRef, TraceClient};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info};

/// One dataset row
pub type Row = Map<String, Value>;

/// An immutable, ordered collection of rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    name: Option<String>,
    id: Option<String>,
    rows: Vec<Row>,
}

impl Dataset {
    /// Build from JSON values; every row must be an object
    pub fn from_rows(rows: impl IntoIterator<Item = Value>) -> EvalResult<Self> {
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| match row {
                Value::Object(map) => Ok(map),
                other => Err(EvalError::Dataset(format!(
                    "row {} is not an object: {}",
                    i, other
                ))),
            })
            .collect::<EvalResult<Vec<_>>>()?;

        Ok(Self {
            name: None,
            id: None,
            rows,
        })
    }

    /// Load one row per line from a JSONL file, named after the file stem
    pub fn from_jsonl(path: &Path) -> EvalResult<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| EvalError::Dataset(format!("cannot open {}: {}", path.display(), e)))?;

        let mut rows = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| {
                EvalError::Dataset(format!("cannot read {}: {}", path.display(), e))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Value = serde_json::from_str(&line).map_err(|e| {
                EvalError::Dataset(format!("{}:{}: {}", path.display(), n + 1, e))
            })?;
            rows.push(row);
        }

        let mut dataset = Self::from_rows(rows)?;
        dataset.name = path.file_stem().map(|s| s.to_string_lossy().into_owned());
        info!("Loaded {} rows from {}", dataset.len(), path.display());
        Ok(dataset)
    }

    /// Load a dataset saved on the backend.
    ///
    /// The object is either an array of rows or an object with a `rows` array.
    pub async fn from_ref(client: &TraceClient, dataset_ref: &ObjectRef) -> EvalResult<Self> {
        let value = client.resolve_ref(dataset_ref).await?;
        let rows = match value {
            Value::Array(rows) => rows,
            Value::Object(mut obj) => match obj.remove("rows") {
                Some(Value::Array(rows)) => rows,
                _ => {
                    return Err(EvalError::Dataset(format!(
                        "{} has no rows array",
                        dataset_ref
                    )))
                }
            },
            other => {
                return Err(EvalError::Dataset(format!(
                    "{} is not a dataset: {}",
                    dataset_ref, other
                )))
            }
        };

        Ok(Self::from_rows(rows)?
            .with_name(dataset_ref.name.clone())
            .with_id(dataset_ref.digest.clone()))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn get(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether any top-level cell holds an object reference
    pub fn has_refs(&self) -> bool {
        self.rows
            .iter()
            .flat_map(|row| row.values())
            .any(|v| matches!(v, Value::String(s) if ObjectRef::is_ref_uri(s)))
    }

    /// Replace every top-level string cell holding a `calltrace:///` reference with the
    /// object it points at. Each distinct reference is resolved once.
    pub async fn resolve_refs(&self, client: &TraceClient) -> EvalResult<Self> {
        if !self.has_refs() {
            return Ok(self.clone());
        }

        let mut resolved: HashMap<String, Value> = HashMap::new();
        let mut rows = Vec::with_capacity(self.rows.len());

        for row in &self.rows {
            let mut out = Row::with_capacity(row.len());
            for (key, value) in row {
                let value = match value {
                    Value::String(uri) if ObjectRef::is_ref_uri(uri) => {
                        if let Some(cached) = resolved.get(uri) {
                            cached.clone()
                        } else {
                            let object_ref = ObjectRef::parse(uri)
                                .map_err(|e| EvalError::Dataset(e.to_string()))?;
                            debug!("Resolving {}", object_ref);
                            let object = client.resolve_ref(&object_ref).await?;
                            resolved.insert(uri.clone(), object.clone());
                            object
                        }
                    }
                    other => other.clone(),
                };
                out.insert(key.clone(), value);
            }
            rows.push(out);
        }

        Ok(Self {
            name: self.name.clone(),
            id: self.id.clone(),
            rows,
        })
    }
}

//! Models and scorers
//!
//! A model or scorer declares the shape of its input as a type implementing
//! `Deserialize`. The orchestrator binds each (column-mapped) row to that type by
//! explicit field lookup; a row that does not fit is a failure for that row only.
//!
//! Scorers see the row plus the model's output under the `output` key. When the row
//! already has an `output` column, the model output wins.

use crate::dataset::Row;
use crate::error::EvalError;
use crate::score::ScoreValue;
use anyhow::anyhow;
use async_trait::async_trait;
use calltrace_core::{Op, TracedFn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Key under which scorers receive the model output
pub const OUTPUT_KEY: &str = "output";

/// The function under evaluation
#[async_trait]
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    /// Op that already traces this model; the orchestrator wraps untraced models itself
    fn traced_op(&self) -> Option<&Arc<Op>> {
        None
    }

    async fn predict(&self, row: &Row) -> anyhow::Result<Value>;
}

/// A scoring function applied to each successful model output
#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;

    fn traced_op(&self) -> Option<&Arc<Op>> {
        None
    }

    async fn score(&self, row: &Row, output: &Value) -> anyhow::Result<ScoreValue>;
}

/// Bind a row to a declared input type
pub fn bind<I: DeserializeOwned>(row: &Row) -> Result<I, EvalError> {
    serde_json::from_value(Value::Object(row.clone())).map_err(|e| EvalError::Binding {
        target: std::any::type_name::<I>(),
        message: e.to_string(),
    })
}

/// Row plus model output, as scorers see it
pub fn scorer_input(row: &Row, output: &Value) -> Row {
    let mut input = row.clone();
    input.insert(OUTPUT_KEY.to_string(), output.clone());
    input
}

fn to_score<O: Serialize>(output: O) -> anyhow::Result<ScoreValue> {
    Ok(ScoreValue::from_json(serde_json::to_value(output)?)?)
}

/// A model built from an async closure over a typed input
pub struct FnModel<I, F> {
    name: String,
    func: F,
    _input: PhantomData<fn(I)>,
}

/// Model from an async function taking a typed row
pub fn model_fn<I, O, F, Fut>(name: impl Into<String>, func: F) -> FnModel<I, F>
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(I) -> Fut,
    Fut: Future<Output = anyhow::Result<O>>,
{
    FnModel {
        name: name.into(),
        func,
        _input: PhantomData,
    }
}

#[async_trait]
impl<I, O, F, Fut> Model for FnModel<I, F>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<O>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn predict(&self, row: &Row) -> anyhow::Result<Value> {
        let input: I = bind(row)?;
        let output = (self.func)(input).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// A scorer built from an async closure over a typed input
pub struct FnScorer<I, F> {
    name: String,
    func: F,
    _input: PhantomData<fn(I)>,
}

/// Scorer from an async function taking a typed row (with `output`)
pub fn scorer_fn<I, O, F, Fut>(name: impl Into<String>, func: F) -> FnScorer<I, F>
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(I) -> Fut,
    Fut: Future<Output = anyhow::Result<O>>,
{
    FnScorer {
        name: name.into(),
        func,
        _input: PhantomData,
    }
}

#[async_trait]
impl<I, O, F, Fut> Scorer for FnScorer<I, F>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<O>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn score(&self, row: &Row, output: &Value) -> anyhow::Result<ScoreValue> {
        let input: I = bind(&scorer_input(row, output))?;
        to_score((self.func)(input).await?)
    }
}

// Ops wrapped by the caller trace themselves

#[async_trait]
impl<I, F, Fut, T, E> Model for TracedFn<I, F>
where
    I: DeserializeOwned + Serialize + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Serialize + Send,
    E: fmt::Display + Send,
{
    fn name(&self) -> &str {
        self.op().name()
    }

    fn traced_op(&self) -> Option<&Arc<Op>> {
        Some(self.op())
    }

    async fn predict(&self, row: &Row) -> anyhow::Result<Value> {
        let input: I = bind(row)?;
        let output = self.call(input).await.map_err(|e| anyhow!("{}", e))?;
        Ok(serde_json::to_value(output)?)
    }
}

#[async_trait]
impl<I, F, Fut, T, E> Scorer for TracedFn<I, F>
where
    I: DeserializeOwned + Serialize + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Serialize + Send,
    E: fmt::Display + Send,
{
    fn name(&self) -> &str {
        self.op().name()
    }

    fn traced_op(&self) -> Option<&Arc<Op>> {
        Some(self.op())
    }

    async fn score(&self, row: &Row, output: &Value) -> anyhow::Result<ScoreValue> {
        let input: I = bind(&scorer_input(row, output))?;
        let score = self.call(input).await.map_err(|e| anyhow!("{}", e))?;
        to_score(score)
    }
}

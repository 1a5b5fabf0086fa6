//! Evaluation orchestrator
//!
//! Runs a model over every row of a dataset (optionally several trials per row), scores
//! each successful output with every scorer, and summarizes the results. Rows run
//! concurrently up to `max_concurrency`; a failing model, scorer or column mapping only
//! ever affects its own row.
//!
//! The whole run is traced: one `Evaluation.evaluate` root call, one
//! `Evaluation.predict_and_score` child per row and trial with the model and scorer
//! calls nested below it, and an `Evaluation.summarize` call.

use crate::dataset::{Dataset, Row};
use crate::error::{EvalError, EvalResult};
use crate::mapping::ColumnMapping;
use crate::model::{scorer_input, Model, Scorer};
use crate::score::ScoreValue;
use crate::summary::{summarize, EvaluationSummary, RowScores, MODEL_LATENCY, MODEL_SUCCESS};
use anyhow::anyhow;
use calltrace_core::config::EvaluationSettings;
use calltrace_core::{Op, TraceClient};
use futures_util::future::join_all;
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const EVALUATE_OP: &str = "Evaluation.evaluate";
const ROW_OP: &str = "Evaluation.predict_and_score";
const SUMMARIZE_OP: &str = "Evaluation.summarize";

/// Outcome of one row and trial
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowResult {
    pub row_index: usize,
    pub trial: usize,

    #[serde(flatten)]
    pub outcome: RowScores,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_error: Option<String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub scorer_errors: BTreeMap<String, String>,
}

impl RowResult {
    fn new(row_index: usize, trial: usize) -> Self {
        Self {
            row_index,
            trial,
            outcome: RowScores::default(),
            output: None,
            model_error: None,
            scorer_errors: BTreeMap::new(),
        }
    }

    pub fn model_success(&self) -> bool {
        self.outcome.model_success
    }

    pub fn score(&self, scorer: &str) -> Option<&ScoreValue> {
        self.outcome.scores.get(scorer)
    }
}

/// Summary plus per-row results of one evaluation
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub name: String,
    pub summary: EvaluationSummary,
    pub rows: Vec<RowResult>,
}

/// A scorer and the op tracing it
struct ScorerSlot {
    scorer: Arc<dyn Scorer>,
    op: Option<Op>,
}

/// An evaluation of models against one dataset
pub struct Evaluation {
    client: Arc<TraceClient>,
    dataset: Dataset,
    name: Option<String>,
    scorers: Vec<Arc<dyn Scorer>>,
    column_mapping: ColumnMapping,
    max_concurrency: usize,
    trials: usize,
}

impl Evaluation {
    pub fn new(client: Arc<TraceClient>, dataset: Dataset) -> Self {
        let settings = EvaluationSettings::default();
        Self {
            client,
            dataset,
            name: None,
            scorers: Vec::new(),
            column_mapping: ColumnMapping::new(),
            max_concurrency: settings.max_concurrency,
            trials: settings.trials,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn scorer(mut self, scorer: impl Scorer + 'static) -> Self {
        self.scorers.push(Arc::new(scorer));
        self
    }

    pub fn shared_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorers.push(scorer);
        self
    }

    pub fn column_mapping(mut self, mapping: ColumnMapping) -> Self {
        self.column_mapping = mapping;
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn trials(mut self, trials: usize) -> Self {
        self.trials = trials;
        self
    }

    /// Apply the `[evaluation]` section of the config file
    pub fn with_settings(self, settings: &EvaluationSettings) -> Self {
        self.max_concurrency(settings.max_concurrency)
            .trials(settings.trials)
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.dataset.name().map(|n| format!("{}-evaluation", n)))
            .unwrap_or_else(|| "evaluation".to_string())
    }

    fn validate(&self) -> EvalResult<()> {
        if self.max_concurrency == 0 {
            return Err(EvalError::Config("max_concurrency must be > 0".to_string()));
        }
        if self.trials == 0 {
            return Err(EvalError::Config("trials must be > 0".to_string()));
        }

        let mut seen = HashSet::new();
        for scorer in &self.scorers {
            let name = scorer.name();
            if name.is_empty() {
                return Err(EvalError::Config("scorer name cannot be empty".to_string()));
            }
            if name == MODEL_SUCCESS || name == MODEL_LATENCY {
                return Err(EvalError::Config(format!(
                    "scorer name '{}' is reserved",
                    name
                )));
            }
            if !seen.insert(name) {
                return Err(EvalError::Config(format!(
                    "duplicate scorer name '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Evaluate `model` over the dataset.
    ///
    /// Only configuration errors and unresolvable dataset references fail the run; row
    /// failures end up in the summary. Queued call events are delivered before this
    /// returns, whatever the outcome.
    pub async fn evaluate(&self, model: &dyn Model) -> EvalResult<EvaluationReport> {
        let result = self.run(model).await;
        self.client.wait_for_batch_processing().await;
        result
    }

    async fn run(&self, model: &dyn Model) -> EvalResult<EvaluationReport> {
        self.validate()?;
        let dataset = self.dataset.resolve_refs(&self.client).await?;
        let name = self.display_name();

        let model_op = match model.traced_op() {
            Some(_) => None,
            None => Some(Op::new(self.client.clone(), model.name())),
        };
        let slots: Vec<ScorerSlot> = self
            .scorers
            .iter()
            .map(|scorer| ScorerSlot {
                op: match scorer.traced_op() {
                    Some(_) => None,
                    None => Some(Op::new(self.client.clone(), scorer.name())),
                },
                scorer: scorer.clone(),
            })
            .collect();

        info!(
            "Evaluating {} on {} rows x {} trials with {} scorers",
            model.name(),
            dataset.len(),
            self.trials,
            slots.len()
        );

        let root = Op::new(self.client.clone(), EVALUATE_OP);
        let row_op = Op::new(self.client.clone(), ROW_OP);
        let summarize_op = Op::new(self.client.clone(), SUMMARIZE_OP);

        let inputs = json!({
            "name": name,
            "model": model.name(),
            "dataset": dataset.name(),
            "dataset_id": dataset.id(),
            "rows": dataset.len(),
            "trials": self.trials,
            "scorers": slots.iter().map(|s| s.scorer.name()).collect::<Vec<_>>(),
        });

        let mut rows: Vec<RowResult> = Vec::new();
        let summary = root
            .run(inputs, async {
                let jobs = (0..dataset.len())
                    .flat_map(|index| (0..self.trials).map(move |trial| (index, trial)));

                rows = futures_util::stream::iter(jobs)
                    .map(|(index, trial)| {
                        let row = dataset.get(index).cloned().unwrap_or_default();
                        self.traced_row(&row_op, model, model_op.as_ref(), &slots, index, trial, row)
                    })
                    .buffer_unordered(self.max_concurrency)
                    .collect()
                    .await;
                rows.sort_by_key(|r| (r.row_index, r.trial));

                summarize_op.run_sync(json!({ "rows": rows.len() }), || {
                    Ok::<_, Infallible>(summarize(rows.iter().map(|r| &r.outcome)))
                })
            })
            .await
            .unwrap_or_else(|never| match never {});

        info!(
            "Evaluation {} finished: {}/{} model calls succeeded",
            name,
            summary.model_success.true_count().unwrap_or(0),
            rows.len()
        );

        Ok(EvaluationReport {
            name,
            summary,
            rows,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn traced_row(
        &self,
        row_op: &Op,
        model: &dyn Model,
        model_op: Option<&Op>,
        slots: &[ScorerSlot],
        index: usize,
        trial: usize,
        row: Row,
    ) -> RowResult {
        let inputs = json!({ "row_index": index, "trial": trial, "row": row });
        row_op
            .run(inputs, async {
                Ok::<_, Infallible>(
                    self.predict_and_score(model, model_op, slots, index, trial, &row)
                        .await,
                )
            })
            .await
            .unwrap_or_else(|never| match never {})
    }

    async fn predict_and_score(
        &self,
        model: &dyn Model,
        model_op: Option<&Op>,
        slots: &[ScorerSlot],
        index: usize,
        trial: usize,
        row: &Row,
    ) -> RowResult {
        let mut result = RowResult::new(index, trial);

        let mapped = match self.column_mapping.apply(row) {
            Ok(mapped) => mapped,
            Err(e) => {
                warn!("Row {}: {}", index, e);
                result.model_error = Some(e.to_string());
                return result;
            }
        };

        let started = Instant::now();
        let predicted = match model_op {
            Some(op) => {
                op.run(Value::Object(mapped.clone()), guarded(model.predict(&mapped)))
                    .await
            }
            None => guarded(model.predict(&mapped)).await,
        };
        result.outcome.model_latency = Some(started.elapsed().as_secs_f64());

        let output = match predicted {
            Ok(output) => output,
            Err(e) => {
                debug!("Row {} trial {}: model failed: {:#}", index, trial, e);
                result.model_error = Some(format!("{:#}", e));
                return result;
            }
        };
        result.outcome.model_success = true;

        let scored = join_all(slots.iter().map(|slot| {
            let mapped = &mapped;
            let output = &output;
            async move {
                let score = match &slot.op {
                    Some(op) => {
                        op.run(
                            Value::Object(scorer_input(mapped, output)),
                            guarded(slot.scorer.score(mapped, output)),
                        )
                        .await
                    }
                    None => guarded(slot.scorer.score(mapped, output)).await,
                };
                (slot.scorer.name().to_string(), score)
            }
        }))
        .await;

        for (name, score) in scored {
            match score {
                Ok(score) => {
                    result.outcome.scores.insert(name, score);
                }
                Err(e) => {
                    debug!("Row {} trial {}: scorer {} failed: {:#}", index, trial, name, e);
                    result.scorer_errors.insert(name, format!("{:#}", e));
                }
            }
        }

        result.output = Some(output);
        result
    }
}

/// Evaluate `model` on `dataset` with default settings
pub async fn evaluate(
    client: Arc<TraceClient>,
    dataset: Dataset,
    model: &dyn Model,
    scorers: Vec<Arc<dyn Scorer>>,
    column_mapping: Option<ColumnMapping>,
) -> EvalResult<EvaluationSummary> {
    let evaluation = scorers.into_iter().fold(
        Evaluation::new(client, dataset).column_mapping(column_mapping.unwrap_or_default()),
        Evaluation::shared_scorer,
    );
    Ok(evaluation.evaluate(model).await?.summary)
}

/// Turn a panic in model or scorer code into an error for that row
async fn guarded<T>(fut: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(anyhow!("panicked: {}", panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{model_fn, scorer_fn};
    use calltrace_core::{ClientConfig, MemoryBackend, ObjectRef, RefKind};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct Item {
        id: i64,
        text: String,
    }

    #[derive(Debug, Deserialize)]
    struct Scored {
        id: i64,
        output: Prediction,
    }

    #[derive(Debug, Clone, Deserialize)]
    struct Prediction {
        length: usize,
    }

    fn setup() -> (Arc<MemoryBackend>, Arc<TraceClient>) {
        let backend = Arc::new(MemoryBackend::new());
        let client = TraceClient::new(backend.clone(), ClientConfig::default());
        (backend, client)
    }

    const TEXTS: [&str; 5] = ["a", "bb", "ccc", "dddd", "eeeee"];

    fn dataset() -> Dataset {
        Dataset::from_rows(
            TEXTS
                .iter()
                .enumerate()
                .map(|(id, text)| json!({ "id": id, "text": text })),
        )
        .unwrap()
        .with_name("words")
    }

    fn length_model() -> impl Model {
        model_fn("length_model", |item: Item| async move {
            Ok::<_, anyhow::Error>(json!({ "length": item.text.len() }))
        })
    }

    fn length_scorer() -> impl Scorer {
        scorer_fn("length_scorer", |input: Scored| async move {
            Ok::<_, anyhow::Error>(json!({ "length": input.output.length }))
        })
    }

    fn even_scorer() -> impl Scorer {
        scorer_fn("even_scorer", |input: Scored| async move {
            Ok::<_, anyhow::Error>(input.output.length % 2 == 0)
        })
    }

    #[tokio::test]
    async fn test_summary_over_five_rows() {
        let (_backend, client) = setup();
        let report = Evaluation::new(client, dataset())
            .scorer(length_scorer())
            .scorer(even_scorer())
            .evaluate(&length_model())
            .await
            .unwrap();

        let summary = &report.summary;
        assert_eq!(summary.model_success.true_fraction(), Some(1.0));
        assert_eq!(
            summary
                .scorer("length_scorer")
                .and_then(|a| a.get("length"))
                .and_then(|a| a.mean()),
            Some(3.0)
        );
        assert_eq!(summary.scorer("even_scorer").unwrap().true_count(), Some(2));
        assert_eq!(
            summary.scorer("even_scorer").unwrap().true_fraction(),
            Some(0.4)
        );
        assert!(summary.model_latency.as_ref().unwrap().mean().unwrap() >= 0.0);

        assert_eq!(report.name, "words-evaluation");
        let indices: Vec<usize> = report.rows.iter().map(|r| r.row_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(report.rows[2].output, Some(json!({ "length": 3 })));
    }

    #[tokio::test]
    async fn test_failures_are_contained_per_row() {
        let (_backend, client) = setup();
        let model = model_fn("flaky_model", |item: Item| async move {
            if item.id == 0 {
                anyhow::bail!("no answer for row 0");
            }
            Ok(json!({ "length": item.text.len() }))
        });
        let fragile = scorer_fn("fragile", |input: Scored| async move {
            if input.id == 3 {
                anyhow::bail!("cannot score row 3");
            }
            Ok(input.output.length > 2)
        });

        let report = Evaluation::new(client, dataset())
            .scorer(fragile)
            .scorer(length_scorer())
            .evaluate(&model)
            .await
            .unwrap();

        let summary = &report.summary;
        assert_eq!(summary.model_success.true_count(), Some(4));

        // rows 1, 2 and 4: lengths 2, 3, 5
        let fragile = summary.scorer("fragile").unwrap();
        assert_eq!(fragile.true_count(), Some(2));
        assert!((fragile.true_fraction().unwrap() - 2.0 / 3.0).abs() < 1e-9);

        // rows 1 to 4: lengths 2, 3, 4, 5
        let lengths = summary.scorer("length_scorer").unwrap().get("length").unwrap();
        assert_eq!(lengths.mean(), Some(3.5));

        assert!(!report.rows[0].model_success());
        assert!(report.rows[0].model_error.as_deref().unwrap().contains("row 0"));
        assert!(report.rows[0].outcome.scores.is_empty());
        assert!(report.rows[3].scorer_errors.contains_key("fragile"));
        assert!(report.rows[3].score("length_scorer").is_some());
    }

    #[tokio::test]
    async fn test_column_mapping_matches_unmapped_run() {
        let (_backend, client) = setup();
        let renamed = Dataset::from_rows(
            TEXTS
                .iter()
                .enumerate()
                .map(|(id, text)| json!({ "identifier": id, "description": text })),
        )
        .unwrap();
        let mapping: ColumnMapping = [("id", "identifier"), ("text", "description")]
            .into_iter()
            .collect();

        let plain = evaluate(
            client.clone(),
            dataset(),
            &length_model(),
            vec![Arc::new(length_scorer()), Arc::new(even_scorer())],
            None,
        )
        .await
        .unwrap();
        let mapped = evaluate(
            client,
            renamed,
            &length_model(),
            vec![Arc::new(length_scorer()), Arc::new(even_scorer())],
            Some(mapping),
        )
        .await
        .unwrap();

        assert_eq!(plain.scorers, mapped.scorers);
        assert_eq!(plain.model_success, mapped.model_success);
    }

    #[tokio::test]
    async fn test_invalid_mapping_fails_every_row_without_error() {
        let (_backend, client) = setup();
        let summary = evaluate(
            client,
            dataset(),
            &length_model(),
            vec![Arc::new(length_scorer())],
            Some(ColumnMapping::new().map("text", "missing_column")),
        )
        .await
        .unwrap();

        assert_eq!(summary.model_success.true_count(), Some(0));
        assert!(summary.model_latency.is_none());
        assert!(summary.scorer("length_scorer").is_none());
    }

    #[tokio::test]
    async fn test_trace_nesting() {
        let (backend, client) = setup();
        let traced_model = Op::new(client.clone(), "traced_length").wrap(|item: Value| async move {
            let text = item["text"].as_str().unwrap_or_default().to_string();
            Ok::<_, String>(json!({ "length": text.len() }))
        });

        let dataset = Dataset::from_rows(vec![json!({"text": "ab"}), json!({"text": "abc"})])
            .unwrap()
            .with_name("pairs")
            .with_id("v2");
        Evaluation::new(client.clone(), dataset)
            .scorer(even_scorer_untyped())
            .evaluate(&traced_model)
            .await
            .unwrap();

        let calls = backend.calls();
        let root = calls.iter().find(|c| c.op_name == EVALUATE_OP).unwrap();
        assert!(root.parent_id.is_none());
        assert!(root.is_finished());
        assert_eq!(root.inputs["dataset"], "pairs");
        assert_eq!(root.inputs["dataset_id"], "v2");

        let rows: Vec<_> = calls.iter().filter(|c| c.op_name == ROW_OP).collect();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.parent_id.as_deref(), Some(root.id.as_str()));
            assert_eq!(row.trace_id, root.trace_id);
        }

        let row_ids: HashSet<&str> = rows.iter().map(|c| c.id.as_str()).collect();
        for op_name in ["traced_length", "even"] {
            let nested: Vec<_> = calls.iter().filter(|c| c.op_name == op_name).collect();
            assert_eq!(nested.len(), 2, "{}", op_name);
            for call in nested {
                assert!(row_ids.contains(call.parent_id.as_deref().unwrap()));
            }
        }

        let summarize_call = calls.iter().find(|c| c.op_name == SUMMARIZE_OP).unwrap();
        assert_eq!(summarize_call.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(client.pending(), 0);
    }

    fn even_scorer_untyped() -> impl Scorer {
        scorer_fn("even", |input: Value| async move {
            Ok::<_, anyhow::Error>(input["output"]["length"].as_u64().unwrap_or(1) % 2 == 0)
        })
    }

    #[tokio::test]
    async fn test_trials_and_concurrency_bound() {
        let (_backend, client) = setup();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let model = {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            model_fn("slow", move |item: Item| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(item.id)
                }
            })
        };

        let report = Evaluation::new(client, dataset())
            .with_settings(&EvaluationSettings {
                max_concurrency: 2,
                trials: 3,
            })
            .evaluate(&model)
            .await
            .unwrap();

        assert_eq!(report.rows.len(), 15);
        assert_eq!(report.summary.model_success.true_count(), Some(15));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        let keys: Vec<(usize, usize)> = report.rows.iter().map(|r| (r.row_index, r.trial)).collect();
        assert_eq!(keys[..4], [(0, 0), (0, 1), (0, 2), (1, 0)]);
    }

    #[tokio::test]
    async fn test_panicking_model_is_a_row_failure() {
        let (_backend, client) = setup();
        let model = model_fn("panicky", |item: Item| async move {
            if item.id == 2 {
                panic!("boom");
            }
            Ok::<_, anyhow::Error>(item.id)
        });

        let report = Evaluation::new(client, dataset())
            .evaluate(&model)
            .await
            .unwrap();
        assert_eq!(report.summary.model_success.true_count(), Some(4));
        assert!(report.rows[2]
            .model_error
            .as_deref()
            .unwrap()
            .contains("boom"));
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_fatal() {
        let (_backend, client) = setup();

        let zero = Evaluation::new(client.clone(), dataset()).max_concurrency(0);
        assert!(matches!(
            zero.evaluate(&length_model()).await,
            Err(EvalError::Config(_))
        ));

        let no_trials = Evaluation::new(client.clone(), dataset()).trials(0);
        assert!(matches!(
            no_trials.evaluate(&length_model()).await,
            Err(EvalError::Config(_))
        ));

        let duplicate = Evaluation::new(client.clone(), dataset())
            .scorer(even_scorer())
            .scorer(even_scorer());
        assert!(matches!(
            duplicate.evaluate(&length_model()).await,
            Err(EvalError::Config(_))
        ));

        let reserved = Evaluation::new(client, dataset()).scorer(scorer_fn(
            MODEL_SUCCESS,
            |_: Value| async move { Ok::<_, anyhow::Error>(true) },
        ));
        assert!(matches!(
            reserved.evaluate(&length_model()).await,
            Err(EvalError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_reference_is_fatal() {
        let (backend, client) = setup();
        let missing = ObjectRef::new("e", "p", RefKind::Object, "gone", "0");
        let dataset = Dataset::from_rows(vec![json!({"id": 0, "text": missing.uri()})]).unwrap();

        let result = Evaluation::new(client, dataset)
            .evaluate(&length_model())
            .await;
        assert!(matches!(result, Err(EvalError::Backend(_))));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_referenced_cells_are_resolved_before_rows_run() {
        let (backend, client) = setup();
        let text = ObjectRef::new("e", "p", RefKind::Object, "long_text", "1");
        backend.put_object(&text, json!("resolved text"));
        let dataset = Dataset::from_rows(vec![json!({"id": 0, "text": text.uri()})]).unwrap();

        let report = Evaluation::new(client, dataset)
            .evaluate(&length_model())
            .await
            .unwrap();
        assert_eq!(report.rows[0].output, Some(json!({ "length": 13 })));
    }
}

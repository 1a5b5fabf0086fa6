//! calltrace-eval - dataset evaluations on top of calltrace
//!
//! Run a model over a dataset, score every output, and aggregate the scores into an
//! [`EvaluationSummary`]. Every step is traced through the same client as the
//! application's own ops.

pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod mapping;
pub mod model;
pub mod score;
pub mod summary;

pub use dataset::{Dataset, Row};
pub use error::{EvalError, EvalResult};
pub use evaluation::{evaluate, Evaluation, EvaluationReport, RowResult};
pub use mapping::ColumnMapping;
pub use model::{bind, model_fn, scorer_fn, FnModel, FnScorer, Model, Scorer, OUTPUT_KEY};
pub use score::ScoreValue;
pub use summary::{summarize, Aggregate, EvaluationSummary, RowScores};

//! # Pipeline Orchestrator
//!
//! Drives the strictly linear stage sequence
//!
//! ```text
//! Ingested → Imputed → Encoded → Screened → InteractionsBuilt → Selected
//!          → Split → Fitted → Evaluated
//! ```
//!
//! Each stage consumes the previous stage's immutable value and produces a
//! new one; nothing is mutated in place and no stage ever runs twice. A
//! failure at any stage terminates the run in the `Failed` terminal state,
//! which is represented as a `PipelineError` carrying the originating stage
//! and error.
//!
//! Every random decision in the run derives from the single configured seed:
//! imputation draws use `seed`, the full-data screen and moderation passes
//! use `seed + 1` and `seed + 2`, the train/test split uses `seed + 3`, and
//! the train-partition refit uses `seed + 4` and `seed + 5`. Two runs with
//! the same input and seed are bit-identical.

use crate::data::Dataset;
use crate::diagnostics::{self, CorrelationMatrix, MissingSummaryRow};
use crate::evaluate::{self, EvaluateError, EvaluationResult};
use crate::impute::{self, ImputationConfig, ImputeError};
use crate::lasso::{PredictorSet, SelectorConfig};
use crate::model::FittedModel;
use std::fmt;
use thiserror::Error;

/// The pipeline stages, in execution order. Used only to label progress and
/// failures; transitions are enforced by the call sequence itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ingest,
    Impute,
    Encode,
    Screen,
    BuildInteractions,
    Select,
    Split,
    Fit,
    Evaluate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Ingest => "ingest",
            Stage::Impute => "impute",
            Stage::Encode => "encode",
            Stage::Screen => "screen",
            Stage::BuildInteractions => "build-interactions",
            Stage::Select => "select",
            Stage::Split => "split",
            Stage::Fit => "fit",
            Stage::Evaluate => "evaluate",
        };
        f.write_str(name)
    }
}

/// The `Failed` terminal state: the stage that failed plus the originating
/// error.
#[derive(Error, Debug)]
#[error("The pipeline failed during the {stage} stage: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Impute(#[from] ImputeError),
    #[error(transparent)]
    Evaluate(#[from] EvaluateError),
}

/// The complete configuration surface. Every option is explicit; there are
/// no hidden defaults beyond the ones printed here.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of imputation draws (`m`).
    pub imputation_draws: usize,
    /// Chained-equation sweeps per draw (`maxit`).
    pub imputation_iterations: usize,
    /// Donor pool size for predictive mean matching.
    pub donors: usize,
    /// Cross-validation fold count for both selection passes.
    pub cv_folds: usize,
    /// Penalty grid size for both selection passes.
    pub n_lambda: usize,
    /// Training share of the evaluation split.
    pub train_fraction: f64,
    /// The single seed every random decision derives from.
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            imputation_draws: 5,
            imputation_iterations: 50,
            donors: 5,
            cv_folds: 10,
            n_lambda: 100,
            train_fraction: 0.8,
            seed: 0,
        }
    }
}

/// Everything the pipeline hands to reporting collaborators.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Missing-value census computed before imputation.
    pub missing_summary: Vec<MissingSummaryRow>,
    /// Correlations over continuous fields and the outcome, pre-imputation.
    pub correlations: CorrelationMatrix,
    /// Pass-1 predictor set from the full-data screen.
    pub screened: PredictorSet,
    /// Pass-2 predictor set from the full-data moderation fit.
    pub moderation: PredictorSet,
    /// The full-data final model (the deliverable artifact).
    pub model: FittedModel,
    /// Out-of-sample discrimination of the recipe, refit on the training
    /// partition and scored on the held-out partition.
    pub evaluation: EvaluationResult,
}

/// Runs the whole pipeline on an ingested dataset.
pub fn run_pipeline(
    dataset: &Dataset,
    config: &PipelineConfig,
) -> Result<PipelineReport, PipelineError> {
    // Ingested: the dataset arrives schema-validated; this stage emits the
    // pre-imputation artifacts.
    log::info!(
        "Pipeline starting: {} rows, {} fields, seed {}.",
        dataset.n_rows(),
        dataset.schema().num_fields(),
        config.seed
    );
    let missing_summary = diagnostics::missing_value_summary(dataset);
    let correlations = diagnostics::correlation_matrix(dataset);

    // Imputed: m completed draws; the pipeline continues on the first draw.
    let imputation_config = ImputationConfig {
        draws: config.imputation_draws,
        max_iterations: config.imputation_iterations,
        donors: config.donors,
        seed: config.seed,
    };
    let mut draws = impute::impute(dataset, &imputation_config).map_err(|e| PipelineError {
        stage: Stage::Impute,
        source: e.into(),
    })?;
    let completed = draws.remove(0);

    // Encoded through Selected: the full-data recipe produces the two
    // reported predictor sets and the deliverable model.
    let selector = SelectorConfig {
        cv_folds: config.cv_folds,
        n_lambda: config.n_lambda,
        seed: config.seed.wrapping_add(1),
    };
    let full_fit = evaluate::fit_recipe(&completed, &selector).map_err(|e| PipelineError {
        stage: recipe_stage(&e),
        source: e.into(),
    })?;

    // Split, Fitted, Evaluated: refit the recipe on the training partition
    // only, then score the held-out partition.
    let split = evaluate::split_rows(
        completed.n_rows(),
        config.train_fraction,
        config.seed.wrapping_add(3),
    );
    log::info!(
        "Split {} rows into {} train / {} test.",
        completed.n_rows(),
        split.train.len(),
        split.test.len()
    );
    let train = completed.select_rows(&split.train);
    let test = completed.select_rows(&split.test);

    let holdout_selector = SelectorConfig {
        seed: config.seed.wrapping_add(4),
        ..selector.clone()
    };
    let holdout_fit = evaluate::fit_recipe(&train, &holdout_selector).map_err(|e| PipelineError {
        stage: Stage::Fit,
        source: e.into(),
    })?;
    let evaluation = evaluate::evaluate_holdout(&holdout_fit.model, &test, train.n_rows())
        .map_err(|e| PipelineError {
            stage: Stage::Evaluate,
            source: e.into(),
        })?;

    log::info!(
        "Pipeline finished: screen kept {}, moderation kept {}, held-out AUC {:.4}.",
        full_fit.screened.predictor_set.len(),
        full_fit.moderation.predictor_set.len(),
        evaluation.auc
    );

    Ok(PipelineReport {
        missing_summary,
        correlations,
        screened: full_fit.screened.predictor_set,
        moderation: full_fit.moderation.predictor_set,
        model: full_fit.model,
        evaluation,
    })
}

/// Maps a recipe failure to the pipeline stage it belongs to.
fn recipe_stage(error: &EvaluateError) -> Stage {
    match error {
        EvaluateError::Encode(_) => Stage::Encode,
        EvaluateError::Select(_) => Stage::Screen,
        EvaluateError::Construction(_) => Stage::BuildInteractions,
        EvaluateError::Model(_) => Stage::Fit,
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FieldSpec, Schema};
    use ndarray::Array2;
    use rand::Rng;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    /// A small trial-shaped dataset: treatment `ba` works better for
    /// subjects with high `nmr`, and a sprinkling of entries is missing.
    pub(crate) fn synthetic_trial(n: usize, seed: u64, with_missing: bool) -> Dataset {
        let schema = Schema::new(
            "abst",
            ["ba", "var"],
            vec![
                FieldSpec::continuous("nmr"),
                FieldSpec::continuous("bdi_score"),
                FieldSpec::binary("antidepmed"),
                FieldSpec::ordinal("edu", vec![1, 2, 3]),
            ],
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut values = Array2::zeros((n, 7));
        for i in 0..n {
            let ba = (i % 2) as f64;
            let var = ((i / 2) % 2) as f64;
            let nmr: f64 = normal.sample(&mut rng);
            let bdi: f64 = normal.sample(&mut rng);
            let med = if rng.gen_range(0.0..1.0) < 0.3 { 1.0 } else { 0.0 };
            let edu = (1 + i % 3) as f64;
            let eta = -0.4 + 1.2 * ba * nmr + 0.8 * var + 0.5 * nmr;
            let prob = 1.0 / (1.0 + (-eta as f64).exp());
            let abst = if rng.gen_range(0.0..1.0) < prob { 1.0 } else { 0.0 };
            values[[i, 0]] = abst;
            values[[i, 1]] = ba;
            values[[i, 2]] = var;
            values[[i, 3]] = nmr;
            values[[i, 4]] = bdi;
            values[[i, 5]] = med;
            values[[i, 6]] = edu;
        }
        if with_missing {
            for i in 0..n {
                if rng.gen_range(0.0..1.0) < 0.1 {
                    values[[i, 3]] = f64::NAN;
                }
                if rng.gen_range(0.0..1.0) < 0.05 {
                    values[[i, 4]] = f64::NAN;
                }
            }
        }
        Dataset::new(schema, values).unwrap()
    }

    fn quick_config(seed: u64) -> PipelineConfig {
        PipelineConfig {
            imputation_draws: 2,
            imputation_iterations: 5,
            donors: 3,
            cv_folds: 5,
            n_lambda: 30,
            train_fraction: 0.8,
            seed,
        }
    }

    #[test]
    fn pipeline_runs_end_to_end_on_a_trial_shaped_dataset() {
        let dataset = synthetic_trial(250, 60, true);
        let report = run_pipeline(&dataset, &quick_config(60)).unwrap();
        assert!(report.evaluation.auc > 0.5 && report.evaluation.auc <= 1.0);
        assert_eq!(report.evaluation.n_train, 200);
        assert_eq!(report.evaluation.n_test, 50);
        assert!(!report.missing_summary.is_empty());
        assert_eq!(report.correlations.labels[0], "abst");
        // The model carries its own encoding and column list.
        assert_eq!(
            report.model.column_names.len(),
            report.model.coefficients.len()
        );
    }

    #[test]
    fn failure_carries_the_originating_stage() {
        // An entirely missing field fails during imputation.
        let schema = Schema::new(
            "abst",
            ["ba", "var"],
            vec![FieldSpec::continuous("nmr")],
        )
        .unwrap();
        let mut values = Array2::zeros((40, 4));
        for i in 0..40 {
            values[[i, 0]] = (i % 2) as f64;
            values[[i, 1]] = (i % 2) as f64;
            values[[i, 2]] = ((i / 2) % 2) as f64;
            values[[i, 3]] = f64::NAN;
        }
        let dataset = Dataset::new(schema, values).unwrap();
        let err = run_pipeline(&dataset, &quick_config(1)).unwrap_err();
        assert_eq!(err.stage, Stage::Impute);
        assert!(err.to_string().contains("impute"));
    }
}

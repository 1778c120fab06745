//! # Cross-Validated L1-Penalized Logistic Regression
//!
//! The predictor selector. Fits LASSO logistic regression by cyclic
//! coordinate descent on the iteratively reweighted least squares (IRLS)
//! quadratic approximation: the outer loop re-forms working responses and
//! weights at the current coefficients, the inner loop soft-thresholds one
//! coordinate at a time, and the intercept is never penalized.
//!
//! The penalty grid is geometric, from the smallest λ that zeroes every
//! coefficient down three decades, fit large-to-small with warm starts so
//! the path inherits the standard LASSO behavior of non-increasing support
//! as λ grows. λ* is chosen by k-fold cross-validation on mean held-out
//! binomial deviance; the final model is one refit on the full input at λ*.
//!
//! A fold whose held-out rows (or whose training complement) contain a
//! single outcome class cannot contribute a meaningful loss. Such folds are
//! excluded from the average with a warning; selection only fails if every
//! fold is degenerate.
//!
//! Penalties apply to the columns exactly as encoded: the encoder has
//! already standardized continuous fields, and 0/1 indicator columns are
//! left on their natural scale.

use crate::encode::NamedMatrix;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coefficients with magnitude at or below this are exactly zero for
/// selection purposes.
pub const COEF_ZERO_TOL: f64 = 1e-8;

/// Elastic-net mixing parameter. Fixed at pure L1; this is a property of the
/// method, not a configuration knob.
const ALPHA: f64 = 1.0;

const MAX_IRLS_ITERATIONS: usize = 100;
const MAX_CD_ITERATIONS: usize = 1000;
const CD_TOL: f64 = 1e-7;
const IRLS_TOL: f64 = 1e-8;
const MIN_IRLS_WEIGHT: f64 = 1e-5;
/// The grid spans three decades below the all-zero penalty.
const LAMBDA_RATIO: f64 = 1e-3;

/// Configuration for one selection pass.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Cross-validation fold count (k).
    pub cv_folds: usize,
    /// Number of grid points on the penalty path.
    pub n_lambda: usize,
    /// Seed for fold assignment.
    pub seed: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            cv_folds: 10,
            n_lambda: 100,
            seed: 0,
        }
    }
}

#[derive(Error, Debug)]
pub enum SelectError {
    #[error("The predictor matrix has {rows} rows but the outcome vector has {outcomes} entries.")]
    DimensionMismatch { rows: usize, outcomes: usize },
    #[error(
        "The outcome vector contains the value {value}; a binary outcome must be exactly 0 or 1."
    )]
    NonBinaryOutcome { value: f64 },
    #[error(
        "The outcome vector contains a single class, so no discriminative model can be selected."
    )]
    SingleClassOutcome,
    #[error("Cross-validation requires at least 2 folds; got {0}.")]
    TooFewFolds(usize),
    #[error(
        "Every cross-validation fold was excluded because its held-out rows or its training complement contained a single outcome class. The dataset is too small or too imbalanced for {folds}-fold selection."
    )]
    AllFoldsDegenerate { folds: usize },
}

/// One penalized fit: intercept, coefficient vector, and the penalty it was
/// fit at. The intercept is tracked separately and is never a selected
/// predictor.
#[derive(Debug, Clone)]
pub struct LassoFit {
    pub intercept: f64,
    pub beta: Array1<f64>,
    pub lambda: f64,
}

/// One selected predictor: column name and fitted coefficient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedPredictor {
    pub name: String,
    pub coefficient: f64,
}

/// The non-zero coefficients surviving a LASSO fit, in column order, plus
/// the penalty that produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorSet {
    pub predictors: Vec<SelectedPredictor>,
    pub lambda: f64,
}

impl PredictorSet {
    pub fn len(&self) -> usize {
        self.predictors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictors.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.predictors.iter().map(|p| p.name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predictors.iter().any(|p| p.name == name)
    }
}

/// The full result of one cross-validated selection pass.
#[derive(Debug, Clone)]
pub struct Selection {
    /// The refit on the full input at λ*.
    pub fit: LassoFit,
    /// Non-zero coefficients of `fit`.
    pub predictor_set: PredictorSet,
    /// The searched penalty grid, descending.
    pub lambda_grid: Vec<f64>,
    /// Mean held-out deviance per grid point, averaged over usable folds.
    pub cv_mean_deviance: Vec<f64>,
    /// Folds that contributed to the average.
    pub folds_used: usize,
}

/// Runs one full selection pass: grid construction, cross-validated λ*
/// choice, and the final refit.
pub fn select_predictors(
    matrix: &NamedMatrix,
    y: ArrayView1<'_, f64>,
    config: &SelectorConfig,
) -> Result<Selection, SelectError> {
    let x = matrix.values.view();
    let n = x.nrows();

    if y.len() != n {
        return Err(SelectError::DimensionMismatch {
            rows: n,
            outcomes: y.len(),
        });
    }
    for &v in y.iter() {
        if v != 0.0 && v != 1.0 {
            return Err(SelectError::NonBinaryOutcome { value: v });
        }
    }
    let positives = y.iter().filter(|&&v| v == 1.0).count();
    if positives == 0 || positives == n {
        return Err(SelectError::SingleClassOutcome);
    }
    if config.cv_folds < 2 {
        return Err(SelectError::TooFewFolds(config.cv_folds));
    }

    let grid = internal::lambda_grid(x, y, config.n_lambda);
    log::info!(
        "Selecting over a {}-point penalty grid ({:.4e} down to {:.4e}) with {}-fold cross-validation.",
        grid.len(),
        grid[0],
        grid[grid.len() - 1],
        config.cv_folds
    );

    let assignments = internal::fold_assignments(n, config.cv_folds, config.seed);

    // Each fold fits the whole path on its training complement and scores
    // the held-out rows; fold results are keyed by index so parallel
    // execution cannot reorder them.
    let fold_losses: Vec<Option<Vec<f64>>> = (0..config.cv_folds)
        .into_par_iter()
        .map(|fold| internal::fold_deviances(x, y, &assignments, fold, &grid))
        .collect();

    let folds_used = fold_losses.iter().filter(|f| f.is_some()).count();
    if folds_used == 0 {
        return Err(SelectError::AllFoldsDegenerate {
            folds: config.cv_folds,
        });
    }

    let mut cv_mean_deviance = vec![0.0; grid.len()];
    for losses in fold_losses.iter().flatten() {
        for (acc, loss) in cv_mean_deviance.iter_mut().zip(losses) {
            *acc += loss;
        }
    }
    for acc in &mut cv_mean_deviance {
        *acc /= folds_used as f64;
    }

    // Strict comparison keeps the earliest (largest, sparsest) λ on ties.
    let mut best = 0;
    for (i, &loss) in cv_mean_deviance.iter().enumerate() {
        if loss < cv_mean_deviance[best] {
            best = i;
        }
    }
    let lambda_star = grid[best];

    let path = internal::fit_path(x, y, &grid);
    let fit = path[best].clone();
    let predictor_set = predictor_set_from_fit(&fit, &matrix.column_names);

    log::info!(
        "Selected lambda {:.4e} ({} of {} folds usable); {} predictors survive.",
        lambda_star,
        folds_used,
        config.cv_folds,
        predictor_set.len()
    );

    Ok(Selection {
        fit,
        predictor_set,
        lambda_grid: grid,
        cv_mean_deviance,
        folds_used,
    })
}

/// Extracts the non-zero coefficients of a fit, in column order.
fn predictor_set_from_fit(fit: &LassoFit, column_names: &[String]) -> PredictorSet {
    let predictors = column_names
        .iter()
        .zip(fit.beta.iter())
        .filter(|&(_, &coef)| coef.abs() > COEF_ZERO_TOL)
        .map(|(name, &coef)| SelectedPredictor {
            name: name.clone(),
            coefficient: coef,
        })
        .collect();
    PredictorSet {
        predictors,
        lambda: fit.lambda,
    }
}

/// Predicted probabilities under a fit, with the same linear-predictor and
/// probability clamps used everywhere in this crate.
pub fn predict_probabilities(fit: &LassoFit, x: ArrayView2<'_, f64>) -> Array1<f64> {
    let eta = x.dot(&fit.beta) + fit.intercept;
    let mut probs = eta.mapv(internal::sigmoid);
    probs.mapv_inplace(|p| p.clamp(1e-8, 1.0 - 1e-8));
    probs
}

/// Mean binomial deviance, the cross-validation loss.
pub fn mean_deviance(y: ArrayView1<'_, f64>, probs: &Array1<f64>) -> f64 {
    let mut dev = 0.0;
    for (&yi, &pi) in y.iter().zip(probs.iter()) {
        let p = pi.clamp(1e-8, 1.0 - 1e-8);
        dev += yi * p.ln() + (1.0 - yi) * (1.0 - p).ln();
    }
    -2.0 * dev / y.len() as f64
}

/// Internal module for the solver machinery.
mod internal {
    use super::*;

    pub(super) fn sigmoid(eta: f64) -> f64 {
        let e = eta.clamp(-700.0, 700.0);
        1.0 / (1.0 + f64::exp(-e))
    }

    fn soft_threshold(value: f64, threshold: f64) -> f64 {
        if value > threshold {
            value - threshold
        } else if value < -threshold {
            value + threshold
        } else {
            0.0
        }
    }

    /// Geometric penalty grid, descending from the smallest λ that zeroes
    /// every coefficient.
    pub(super) fn lambda_grid(
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        n_lambda: usize,
    ) -> Vec<f64> {
        let n = x.nrows() as f64;
        let ybar = y.sum() / n;
        let mut lambda_max = 0.0f64;
        for j in 0..x.ncols() {
            let col = x.column(j);
            let mut score = 0.0;
            for (i, &v) in col.iter().enumerate() {
                score += v * (y[i] - ybar);
            }
            lambda_max = lambda_max.max((score / n).abs());
        }
        let lambda_max = (lambda_max / ALPHA).max(1e-10);

        if n_lambda < 2 {
            return vec![lambda_max];
        }
        (0..n_lambda)
            .map(|k| lambda_max * LAMBDA_RATIO.powf(k as f64 / (n_lambda - 1) as f64))
            .collect()
    }

    /// Fits the whole path large-to-small with warm starts.
    pub(super) fn fit_path(
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        grid: &[f64],
    ) -> Vec<LassoFit> {
        let mut fits = Vec::with_capacity(grid.len());
        let mut warm: Option<LassoFit> = None;
        for &lambda in grid {
            let fit = fit_at(x, y, lambda, warm.as_ref());
            fits.push(fit.clone());
            warm = Some(fit);
        }
        fits
    }

    /// One penalized fit at a fixed λ: IRLS outer loop, weighted cyclic
    /// coordinate descent inner loop, unpenalized intercept.
    pub(super) fn fit_at(
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        lambda: f64,
        warm: Option<&LassoFit>,
    ) -> LassoFit {
        let n = x.nrows();
        let p = x.ncols();
        let n_f = n as f64;

        let ybar = (y.sum() / n_f).clamp(1e-8, 1.0 - 1e-8);
        let mut beta = warm
            .map(|w| w.beta.clone())
            .unwrap_or_else(|| Array1::zeros(p));
        let mut intercept = warm
            .map(|w| w.intercept)
            .unwrap_or_else(|| (ybar / (1.0 - ybar)).ln());

        let mut eta = x.dot(&beta) + intercept;
        let mut last_deviance = f64::INFINITY;

        for _ in 0..MAX_IRLS_ITERATIONS {
            let mu = eta.mapv(sigmoid);
            let weights = mu.mapv(|m| (m * (1.0 - m)).max(MIN_IRLS_WEIGHT));

            // Working residual r = z - intercept - X beta, where the working
            // response is z = eta + (y - mu) / w.
            let mut residual = Array1::zeros(n);
            for i in 0..n {
                residual[i] = (y[i] - mu[i]) / weights[i];
            }

            let mut xtwx = vec![0.0; p];
            for j in 0..p {
                let col = x.column(j);
                let mut s = 0.0;
                for i in 0..n {
                    s += weights[i] * col[i] * col[i];
                }
                xtwx[j] = s / n_f;
            }
            let weight_mass = weights.sum() / n_f;

            for _ in 0..MAX_CD_ITERATIONS {
                let mut max_delta = 0.0f64;
                for j in 0..p {
                    let col = x.column(j);
                    let mut gradient = 0.0;
                    for i in 0..n {
                        gradient += weights[i] * col[i] * residual[i];
                    }
                    gradient /= n_f;
                    let numerator = gradient + xtwx[j] * beta[j];
                    let denominator = xtwx[j] + lambda * (1.0 - ALPHA);
                    let updated = if denominator > 0.0 {
                        soft_threshold(numerator, lambda * ALPHA) / denominator
                    } else {
                        0.0
                    };
                    let delta = updated - beta[j];
                    if delta != 0.0 {
                        for i in 0..n {
                            residual[i] -= delta * col[i];
                        }
                        beta[j] = updated;
                        max_delta = max_delta.max(delta.abs());
                    }
                }

                let mut intercept_gradient = 0.0;
                for i in 0..n {
                    intercept_gradient += weights[i] * residual[i];
                }
                let intercept_delta = intercept_gradient / n_f / weight_mass;
                if intercept_delta != 0.0 {
                    intercept += intercept_delta;
                    for i in 0..n {
                        residual[i] -= intercept_delta;
                    }
                    max_delta = max_delta.max(intercept_delta.abs());
                }

                if max_delta < CD_TOL {
                    break;
                }
            }

            eta = x.dot(&beta) + intercept;
            let probs = eta.mapv(|e| sigmoid(e).clamp(1e-8, 1.0 - 1e-8));
            let mut deviance = 0.0;
            for i in 0..n {
                deviance += y[i] * probs[i].ln() + (1.0 - y[i]) * (1.0 - probs[i]).ln();
            }
            let deviance = -2.0 * deviance;
            if (last_deviance - deviance).abs() < IRLS_TOL * (deviance.abs() + 0.1) {
                break;
            }
            last_deviance = deviance;
        }

        LassoFit {
            intercept,
            beta,
            lambda,
        }
    }

    /// Shuffled round-robin fold assignment, one fold index per row.
    pub(super) fn fold_assignments(n: usize, k: usize, seed: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..n).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
        let mut fold_of = vec![0; n];
        for (pos, &row) in order.iter().enumerate() {
            fold_of[row] = pos % k;
        }
        fold_of
    }

    fn has_both_classes(y: ArrayView1<'_, f64>, rows: &[usize]) -> bool {
        let mut saw_zero = false;
        let mut saw_one = false;
        for &i in rows {
            if y[i] == 1.0 {
                saw_one = true;
            } else {
                saw_zero = true;
            }
        }
        saw_zero && saw_one
    }

    /// Path deviances for one fold, or None if the fold is degenerate.
    pub(super) fn fold_deviances(
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        assignments: &[usize],
        fold: usize,
        grid: &[f64],
    ) -> Option<Vec<f64>> {
        let n = x.nrows();
        let train_rows: Vec<usize> = (0..n).filter(|&i| assignments[i] != fold).collect();
        let test_rows: Vec<usize> = (0..n).filter(|&i| assignments[i] == fold).collect();

        if !has_both_classes(y, &train_rows) || !has_both_classes(y, &test_rows) {
            log::warn!(
                "Excluding cross-validation fold {fold}: a partition contains a single outcome class."
            );
            return None;
        }

        let x_train = x.select(Axis(0), &train_rows);
        let y_train = y.select(Axis(0), &train_rows);
        let x_test = x.select(Axis(0), &test_rows);
        let y_test = y.select(Axis(0), &test_rows);

        let path = fit_path(x_train.view(), y_train.view(), grid);
        Some(
            path.iter()
                .map(|fit| {
                    let probs = predict_probabilities(fit, x_test.view());
                    mean_deviance(y_test.view(), &probs)
                })
                .collect(),
        )
    }
}

//! # Out-of-Sample Evaluation
//!
//! Splits the completed data into train and test partitions, fits the whole
//! modeling recipe (encoder, both selection passes, interaction design) on
//! the training partition only, and quantifies discrimination on the held
//! out rows via ROC/AUC.
//!
//! The split is a seeded shuffled permutation cut at
//! `floor(n * train_fraction)`, so the partition sizes are exact. There is
//! no stratification: a very imbalanced outcome can land unevenly across the
//! cut. That is a documented limitation, not a failure mode — downstream,
//! degenerate partitions surface through the selector's fold handling.

use crate::construction::{self, ConstructionError};
use crate::data::CompletedDataset;
use crate::encode::{EncodeError, EncodingSpec};
use crate::lasso::{self, SelectError, Selection, SelectorConfig};
use crate::model::{FittedModel, ModelError};
use ndarray::{Array1, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Predictions closer than this are treated as the same threshold when
/// sweeping the ROC curve and ranking for AUC.
const TIE_TOL: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum EvaluateError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// One point of the ROC curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RocPoint {
    pub fpr: f64,
    pub tpr: f64,
}

/// The evaluation artifact: discrimination summary plus the partition sizes
/// that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub auc: f64,
    pub roc: Vec<RocPoint>,
    pub n_train: usize,
    pub n_test: usize,
}

/// Row indices of one train/test partition, each sorted ascending.
#[derive(Debug, Clone)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Partitions `0..n` by seeded shuffle: exactly `floor(n * train_fraction)`
/// training rows, the rest test.
pub fn split_rows(n: usize, train_fraction: f64, seed: u64) -> SplitIndices {
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);
    let n_train = (((n as f64) * train_fraction).floor() as usize).min(n);
    let mut train = order[..n_train].to_vec();
    let mut test = order[n_train..].to_vec();
    train.sort_unstable();
    test.sort_unstable();
    SplitIndices { train, test }
}

/// The model-fitting recipe applied to one partition: both selection passes
/// plus the assembled final model.
#[derive(Debug, Clone)]
pub struct RecipeFit {
    pub model: FittedModel,
    /// Pass 1: main-effects screen.
    pub screened: Selection,
    /// Pass 2: moderation model over the full design.
    pub moderation: Selection,
}

/// Fits the complete recipe on one partition. The encoder, both
/// cross-validated selection passes, and the interaction design all see only
/// this partition; pass 2 derives its fold seed from pass 1's so the two
/// passes draw distinct fold assignments from the one pipeline seed.
pub fn fit_recipe(
    train: &CompletedDataset,
    selector: &SelectorConfig,
) -> Result<RecipeFit, EvaluateError> {
    let treatments = train.schema().treatments();
    let spec = EncodingSpec::fit(train)?;
    let encoded = spec.encode(train)?;
    let y = train.outcome();

    let screened = lasso::select_predictors(&encoded, y.view(), selector)?;
    log::info!(
        "Main-effects screen kept {} of {} columns.",
        screened.predictor_set.len(),
        encoded.n_cols()
    );

    let (design, terms) = construction::build_design(&encoded, treatments, &screened.predictor_set)?;
    let moderation_config = SelectorConfig {
        seed: selector.seed.wrapping_add(1),
        ..selector.clone()
    };
    let moderation = lasso::select_predictors(&design, y.view(), &moderation_config)?;

    let model = FittedModel::from_fit(&moderation.fit, &design, spec, terms);
    Ok(RecipeFit {
        model,
        screened,
        moderation,
    })
}

/// Scores a fitted model on a held-out partition and summarizes
/// discrimination.
pub fn evaluate_holdout(
    model: &FittedModel,
    test: &CompletedDataset,
    n_train: usize,
) -> Result<EvaluationResult, EvaluateError> {
    let probs = model.predict(test)?;
    let y = test.outcome();
    let roc = roc_curve(y.view(), &probs);
    let auc = auc(y.view(), &probs);
    log::info!(
        "Evaluated on {} held-out rows: AUC {:.4}.",
        test.n_rows(),
        auc
    );
    Ok(EvaluationResult {
        auc,
        roc,
        n_train,
        n_test: test.n_rows(),
    })
}

/// The ROC curve, sweeping every distinct predicted probability as a
/// threshold from the highest down. Starts at (0, 0) and ends at (1, 1); a
/// single-class outcome yields the two anchor points and an AUC of 0.5 by
/// convention.
pub fn roc_curve(y: ArrayView1<'_, f64>, probs: &Array1<f64>) -> Vec<RocPoint> {
    let n = y.len();
    let n_pos = y.iter().filter(|&&v| v > 0.5).count();
    let n_neg = n - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return vec![
            RocPoint { fpr: 0.0, tpr: 0.0 },
            RocPoint { fpr: 1.0, tpr: 1.0 },
        ];
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    let mut points = vec![RocPoint { fpr: 0.0, tpr: 0.0 }];
    let mut true_positives = 0usize;
    let mut false_positives = 0usize;
    let mut i = 0;
    while i < n {
        let threshold = probs[order[i]];
        let mut j = i;
        while j < n && (probs[order[j]] - threshold).abs() < TIE_TOL {
            if y[order[j]] > 0.5 {
                true_positives += 1;
            } else {
                false_positives += 1;
            }
            j += 1;
        }
        points.push(RocPoint {
            fpr: false_positives as f64 / n_neg as f64,
            tpr: true_positives as f64 / n_pos as f64,
        });
        i = j;
    }
    points
}

/// AUC by the Mann-Whitney rank statistic with midrank tie handling: the
/// probability that a random positive scores higher than a random negative,
/// which equals the area under the threshold-swept ROC curve.
pub fn auc(y: ArrayView1<'_, f64>, probs: &Array1<f64>) -> f64 {
    let n = y.len();
    let n_pos = y.iter().filter(|&&v| v > 0.5).count() as f64;
    let n_neg = n as f64 - n_pos;
    if n_pos == 0.0 || n_neg == 0.0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        probs[a]
            .partial_cmp(&probs[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // Midranks: tied predictions share the average of their rank range.
    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && (probs[order[j]] - probs[order[i]]).abs() < TIE_TOL {
            j += 1;
        }
        let midrank = (i + j - 1) as f64 / 2.0 + 1.0;
        for k in i..j {
            ranks[order[k]] = midrank;
        }
        i = j;
    }

    let mut positive_rank_sum = 0.0;
    for i in 0..n {
        if y[i] > 0.5 {
            positive_rank_sum += ranks[i];
        }
    }
    (positive_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg)
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::Rng;

    #[test]
    fn split_of_300_at_80_percent_is_exactly_240_and_60() {
        let split = split_rows(300, 0.8, 123);
        assert_eq!(split.train.len(), 240);
        assert_eq!(split.test.len(), 60);
        let mut all: Vec<usize> = split.train.iter().chain(split.test.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..300).collect::<Vec<_>>());
    }

    #[test]
    fn split_is_deterministic_for_a_fixed_seed() {
        let a = split_rows(100, 0.8, 7);
        let b = split_rows(100, 0.8, 7);
        assert_eq!(a.train, b.train);
        assert_eq!(a.test, b.test);
        let c = split_rows(100, 0.8, 8);
        assert_ne!(a.train, c.train);
    }

    #[test]
    fn auc_is_one_under_perfect_separation() {
        let y = array![0.0, 0.0, 1.0, 1.0];
        let p = array![0.1, 0.2, 0.8, 0.9];
        assert_abs_diff_eq!(auc(y.view(), &p), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn auc_is_zero_under_perfect_inversion() {
        let y = array![1.0, 1.0, 0.0, 0.0];
        let p = array![0.1, 0.2, 0.8, 0.9];
        assert_abs_diff_eq!(auc(y.view(), &p), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn fully_tied_predictions_give_half() {
        let y = array![0.0, 1.0, 0.0, 1.0];
        let p = array![0.5, 0.5, 0.5, 0.5];
        assert_abs_diff_eq!(auc(y.view(), &p), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn roc_is_anchored_and_monotone() {
        let y = array![0.0, 1.0, 1.0, 0.0, 1.0, 0.0];
        let p = array![0.2, 0.9, 0.6, 0.4, 0.6, 0.1];
        let roc = roc_curve(y.view(), &p);
        let first = roc.first().unwrap();
        let last = roc.last().unwrap();
        assert_eq!((first.fpr, first.tpr), (0.0, 0.0));
        assert_eq!((last.fpr, last.tpr), (1.0, 1.0));
        for window in roc.windows(2) {
            assert!(window[1].fpr >= window[0].fpr);
            assert!(window[1].tpr >= window[0].tpr);
        }
        // Five distinct thresholds plus the origin.
        assert_eq!(roc.len(), 6);
    }

    #[test]
    fn single_class_outcome_degrades_to_the_anchors() {
        let y = array![1.0, 1.0, 1.0];
        let p = array![0.2, 0.5, 0.9];
        assert_eq!(roc_curve(y.view(), &p).len(), 2);
        assert_abs_diff_eq!(auc(y.view(), &p), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn label_independent_predictions_score_near_half() {
        let mut rng = StdRng::seed_from_u64(99);
        let n = 600;
        let mut y = Array1::zeros(n);
        let mut p = Array1::zeros(n);
        for i in 0..n {
            y[i] = if rng.gen_range(0.0..1.0) < 0.5 { 1.0 } else { 0.0 };
            p[i] = rng.gen_range(0.0..1.0);
        }
        let value = auc(y.view(), &p);
        assert!(
            (0.4..=0.6).contains(&value),
            "null-model AUC {value} strayed outside [0.4, 0.6]"
        );
    }

    #[test]
    fn auc_equals_trapezoid_area_under_the_roc() {
        let y = array![0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let p = array![0.15, 0.85, 0.6, 0.4, 0.7, 0.35, 0.5, 0.55];
        let roc = roc_curve(y.view(), &p);
        let mut area = 0.0;
        for window in roc.windows(2) {
            let width = window[1].fpr - window[0].fpr;
            area += width * (window[0].tpr + window[1].tpr) / 2.0;
        }
        assert_abs_diff_eq!(auc(y.view(), &p), area, epsilon = 1e-12);
    }
}

//! # Pre-Model Dataset Diagnostics
//!
//! The two tabular artifacts handed to external reporting collaborators
//! before any modeling happens: the missing-value summary and the
//! correlation matrix over continuous fields and the outcome. Both are
//! computed on the raw (pre-imputation) dataset; correlations use pairwise
//! complete observations so missingness reduces the sample behind a cell
//! instead of poisoning it.

use crate::data::{Dataset, FieldKind};
use itertools::Itertools;
use ndarray::Array2;
use serde::Serialize;

/// One row of the missing-value summary.
#[derive(Debug, Clone, Serialize)]
pub struct MissingSummaryRow {
    pub field: String,
    pub missing: usize,
    pub total: usize,
    pub percent: f64,
}

/// Per-field missingness, sorted most-affected first (ties keep canonical
/// field order). Fields with no missing entries are included so the summary
/// is a complete census.
pub fn missing_value_summary(dataset: &Dataset) -> Vec<MissingSummaryRow> {
    let mask = dataset.missingness();
    let total = dataset.n_rows();
    (0..dataset.schema().num_fields())
        .map(|idx| {
            let missing = mask.field_missing_count(idx);
            MissingSummaryRow {
                field: dataset.schema().name_at(idx).to_string(),
                missing,
                total,
                percent: if total == 0 {
                    0.0
                } else {
                    100.0 * missing as f64 / total as f64
                },
            }
        })
        .sorted_by(|a, b| b.missing.cmp(&a.missing))
        .collect()
}

/// A symmetric labeled correlation matrix.
#[derive(Debug, Clone)]
pub struct CorrelationMatrix {
    pub labels: Vec<String>,
    /// Shape `[labels.len(), labels.len()]`; a cell with fewer than two
    /// pairwise-complete observations is NaN.
    pub values: Array2<f64>,
}

/// Pearson correlations over the outcome and every continuous baseline
/// field, using pairwise complete observations.
pub fn correlation_matrix(dataset: &Dataset) -> CorrelationMatrix {
    let schema = dataset.schema();
    let mut labels = vec![schema.outcome().to_string()];
    labels.extend(
        schema
            .baseline()
            .iter()
            .filter(|f| f.kind == FieldKind::Continuous)
            .map(|f| f.name.clone()),
    );

    let columns: Vec<Vec<f64>> = labels
        .iter()
        .map(|name| {
            dataset
                .column(name)
                .map(|c| c.to_vec())
                .unwrap_or_default()
        })
        .collect();

    let k = labels.len();
    let mut values = Array2::from_elem((k, k), f64::NAN);
    for a in 0..k {
        for b in a..k {
            let r = pairwise_pearson(&columns[a], &columns[b]);
            values[[a, b]] = r;
            values[[b, a]] = r;
        }
    }
    CorrelationMatrix { labels, values }
}

/// Pearson correlation over rows where both entries are observed. NaN when
/// fewer than two complete pairs exist or either side is constant.
fn pairwise_pearson(a: &[f64], b: &[f64]) -> f64 {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .zip(b.iter())
        .filter(|(x, y)| !x.is_nan() && !y.is_nan())
        .map(|(&x, &y)| (x, y))
        .collect();
    if pairs.len() < 2 {
        return f64::NAN;
    }
    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in &pairs {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a) * (x - mean_a);
        var_b += (y - mean_b) * (y - mean_b);
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return f64::NAN;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FieldSpec, Schema};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn dataset() -> Dataset {
        let schema = Schema::new(
            "abst",
            ["ba", "var"],
            vec![
                FieldSpec::continuous("nmr"),
                FieldSpec::continuous("bdi_score"),
                FieldSpec::binary("sex"),
            ],
        )
        .unwrap();
        let values = array![
            [1.0, 0.0, 1.0, 1.0, 2.0, 1.0],
            [0.0, 1.0, 0.0, 2.0, 4.0, 0.0],
            [1.0, 1.0, 1.0, f64::NAN, 6.0, 1.0],
            [0.0, 0.0, 0.0, 4.0, f64::NAN, f64::NAN],
        ];
        Dataset::new(schema, values).unwrap()
    }

    #[test]
    fn summary_counts_and_sorts_by_missingness() {
        let summary = missing_value_summary(&dataset());
        assert_eq!(summary.len(), 6);
        // The three fields with one missing entry each come first.
        assert_eq!(summary[0].missing, 1);
        assert_eq!(summary[1].missing, 1);
        assert_eq!(summary[2].missing, 1);
        assert_eq!(summary[3].missing, 0);
        let nmr = summary.iter().find(|r| r.field == "nmr").unwrap();
        assert_eq!(nmr.total, 4);
        assert_abs_diff_eq!(nmr.percent, 25.0, epsilon = 1e-12);
    }

    #[test]
    fn correlations_cover_outcome_and_continuous_fields_only() {
        let matrix = correlation_matrix(&dataset());
        assert_eq!(matrix.labels, vec!["abst", "nmr", "bdi_score"]);
        assert_eq!(matrix.values.shape(), &[3, 3]);
    }

    #[test]
    fn perfectly_linear_pair_correlates_to_one() {
        let matrix = correlation_matrix(&dataset());
        // Over their pairwise-complete rows, nmr and bdi_score are exactly
        // proportional.
        assert_abs_diff_eq!(matrix.values[[1, 2]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(matrix.values[[2, 1]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn diagonal_is_one_where_defined() {
        let matrix = correlation_matrix(&dataset());
        for i in 1..matrix.labels.len() {
            assert_abs_diff_eq!(matrix.values[[i, i]], 1.0, epsilon = 1e-12);
        }
    }
}

//! # Feature Encoder
//!
//! Converts a completed dataset into the numeric matrix the selectors
//! consume. The mapping is captured in an `EncodingSpec` that is fit once on
//! training data and then applied verbatim to any later dataset:
//!
//! - Treatment indicators and binary fields pass through as 0/1 columns.
//! - Ordinal fields expand to dummy indicator columns anchored to the
//!   canonical level ordering declared in the schema; the first level is the
//!   reference and gets no column.
//! - Continuous fields are centered and scaled by the training mean and
//!   sample standard deviation. A constant training column gets scale 1.0 so
//!   encoding never divides by zero (the centered column is then all-zero).
//!
//! No statistic is ever recomputed from non-training data; reusing the spec
//! is what keeps train and test matrices aligned column for column.
//!
//! Unseen-level policy: a level outside the set recorded at fit time is a
//! data-integrity violation and raises `EncodeError::UnseenLevel`. Zero-fill
//! is reserved for the column-alignment layer at scoring time (see
//! `construction::reindex`); it never applies to out-of-set values.

use crate::data::{CompletedDataset, FieldKind, SchemaError};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scale below which a training column is treated as constant.
const MIN_SCALE: f64 = 1e-12;

/// How one encoded column is derived from a schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnSource {
    /// A 0/1 field copied through unchanged.
    Passthrough { field: String },
    /// An indicator for one ordinal level.
    Dummy { field: String, level: i64 },
    /// A continuous field centered and scaled by training statistics.
    Standardized { field: String, mean: f64, scale: f64 },
}

/// One encoded column: its name and its derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedColumn {
    pub name: String,
    pub source: ColumnSource,
}

/// The canonical level set of one ordinal field, recorded at fit time so
/// encode-time values can be checked against the training-time contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrdinalLevels {
    pub field: String,
    pub levels: Vec<i64>,
}

/// The train-fit encoding: an ordered column list plus the ordinal level
/// sets. Serializable so a fitted model can carry its own encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingSpec {
    pub columns: Vec<EncodedColumn>,
    pub ordinal_levels: Vec<OrdinalLevels>,
}

/// A numeric table with an explicit ordered column-name list. Both the
/// encoded matrix and the interaction design matrix take this shape.
#[derive(Debug, Clone)]
pub struct NamedMatrix {
    pub column_names: Vec<String>,
    pub values: Array2<f64>,
}

impl NamedMatrix {
    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_cols(&self) -> usize {
        self.values.ncols()
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.column_names
            .iter()
            .position(|c| c == name)
            .map(|idx| self.values.column(idx))
    }
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(
        "The field '{field}' contains the level {value}, which was not part of the level set when the encoding was fit. Scoring data must use the training-time levels."
    )]
    UnseenLevel { field: String, value: f64 },
}

impl EncodingSpec {
    /// Fits the encoding on a training dataset: fixes the column list, the
    /// dummy ordering, and the standardization statistics.
    pub fn fit(training: &CompletedDataset) -> Result<Self, EncodeError> {
        let schema = training.schema();
        let mut columns = Vec::new();
        let mut ordinal_levels = Vec::new();

        for treatment in schema.treatments() {
            columns.push(EncodedColumn {
                name: treatment.to_string(),
                source: ColumnSource::Passthrough {
                    field: treatment.to_string(),
                },
            });
        }

        for spec in schema.baseline() {
            match &spec.kind {
                FieldKind::Binary => columns.push(EncodedColumn {
                    name: spec.name.clone(),
                    source: ColumnSource::Passthrough {
                        field: spec.name.clone(),
                    },
                }),
                FieldKind::Ordinal { levels } => {
                    ordinal_levels.push(OrdinalLevels {
                        field: spec.name.clone(),
                        levels: levels.clone(),
                    });
                    // The first canonical level is the reference.
                    for &level in levels.iter().skip(1) {
                        columns.push(EncodedColumn {
                            name: format!("{}={}", spec.name, level),
                            source: ColumnSource::Dummy {
                                field: spec.name.clone(),
                                level,
                            },
                        });
                    }
                }
                FieldKind::Continuous => {
                    let column = training.column(&spec.name)?;
                    let (mean, scale) = mean_and_scale(column);
                    columns.push(EncodedColumn {
                        name: spec.name.clone(),
                        source: ColumnSource::Standardized {
                            field: spec.name.clone(),
                            mean,
                            scale,
                        },
                    });
                }
            }
        }

        log::info!(
            "Fit encoding spec with {} columns over {} baseline fields.",
            columns.len(),
            schema.baseline().len()
        );
        Ok(Self {
            columns,
            ordinal_levels,
        })
    }

    /// Applies the fit encoding to a dataset, producing the encoded matrix.
    /// The dataset may be the training data or any later partition; the
    /// statistics and column order recorded at fit time are used verbatim.
    pub fn encode(&self, dataset: &CompletedDataset) -> Result<NamedMatrix, EncodeError> {
        for recorded in &self.ordinal_levels {
            let column = dataset.column(&recorded.field)?;
            for &v in column.iter() {
                if !recorded.levels.contains(&(v as i64)) || v.fract() != 0.0 {
                    return Err(EncodeError::UnseenLevel {
                        field: recorded.field.clone(),
                        value: v,
                    });
                }
            }
        }

        let n_rows = dataset.n_rows();
        let mut values = Array2::zeros((n_rows, self.columns.len()));
        for (c, encoded) in self.columns.iter().enumerate() {
            match &encoded.source {
                ColumnSource::Passthrough { field } => {
                    let column = dataset.column(field)?;
                    for (r, &v) in column.iter().enumerate() {
                        values[[r, c]] = v;
                    }
                }
                ColumnSource::Dummy { field, level } => {
                    let column = dataset.column(field)?;
                    for (r, &v) in column.iter().enumerate() {
                        values[[r, c]] = if v as i64 == *level { 1.0 } else { 0.0 };
                    }
                }
                ColumnSource::Standardized { field, mean, scale } => {
                    let column = dataset.column(field)?;
                    for (r, &v) in column.iter().enumerate() {
                        values[[r, c]] = (v - mean) / scale;
                    }
                }
            }
        }

        Ok(NamedMatrix {
            column_names: self.columns.iter().map(|c| c.name.clone()).collect(),
            values,
        })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Training mean and sample standard deviation; a constant column gets
/// scale 1.0.
fn mean_and_scale(column: ArrayView1<'_, f64>) -> (f64, f64) {
    let n = column.len() as f64;
    let mean = column.sum() / n;
    if column.len() < 2 {
        return (mean, 1.0);
    }
    let ss: f64 = column.iter().map(|v| (v - mean) * (v - mean)).sum();
    let sd = (ss / (n - 1.0)).sqrt();
    let scale = if sd < MIN_SCALE { 1.0 } else { sd };
    (mean, scale)
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FieldSpec, Schema};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn schema() -> Schema {
        Schema::new(
            "abst",
            ["ba", "var"],
            vec![
                FieldSpec::continuous("nmr"),
                FieldSpec::binary("sex"),
                FieldSpec::ordinal("edu", vec![1, 2, 3]),
            ],
        )
        .unwrap()
    }

    fn training_data() -> CompletedDataset {
        let values = array![
            [1.0, 0.0, 1.0, 0.2, 1.0, 1.0],
            [0.0, 1.0, 0.0, 0.4, 0.0, 2.0],
            [1.0, 1.0, 1.0, 0.6, 1.0, 3.0],
            [0.0, 0.0, 0.0, 0.8, 0.0, 2.0],
        ];
        CompletedDataset::new(schema(), values).unwrap()
    }

    #[test]
    fn column_order_is_treatments_then_baseline_expansion() {
        let spec = EncodingSpec::fit(&training_data()).unwrap();
        assert_eq!(
            spec.column_names(),
            vec!["ba", "var", "nmr", "sex", "edu=2", "edu=3"]
        );
    }

    #[test]
    fn training_standardization_gives_zero_mean_unit_sd() {
        let training = training_data();
        let spec = EncodingSpec::fit(&training).unwrap();
        let encoded = spec.encode(&training).unwrap();
        let nmr = encoded.column("nmr").unwrap();
        let mean = nmr.sum() / nmr.len() as f64;
        let ss: f64 = nmr.iter().map(|v| (v - mean) * (v - mean)).sum();
        let sd = (ss / (nmr.len() as f64 - 1.0)).sqrt();
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sd, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn spec_reuses_training_statistics_on_new_data() {
        let training = training_data();
        let spec = EncodingSpec::fit(&training).unwrap();
        let new = CompletedDataset::new(
            schema(),
            array![[1.0, 1.0, 0.0, 1.0, 0.0, 1.0]],
        )
        .unwrap();
        let encoded = spec.encode(&new).unwrap();
        // Training mean is 0.5 and training sd is sqrt(0.2/3); the new value
        // must be standardized against those, not against its own column.
        let train_sd = (0.2f64 / 3.0).sqrt();
        assert_abs_diff_eq!(
            encoded.column("nmr").unwrap()[0],
            (1.0 - 0.5) / train_sd,
            epsilon = 1e-12
        );
    }

    #[test]
    fn dummy_columns_follow_canonical_level_order() {
        let training = training_data();
        let spec = EncodingSpec::fit(&training).unwrap();
        let encoded = spec.encode(&training).unwrap();
        assert_eq!(encoded.column("edu=2").unwrap().to_vec(), vec![
            0.0, 1.0, 0.0, 1.0
        ]);
        assert_eq!(encoded.column("edu=3").unwrap().to_vec(), vec![
            0.0, 0.0, 1.0, 0.0
        ]);
        // Reference level 1 never gets a column.
        assert!(encoded.column("edu=1").is_none());
    }

    #[test]
    fn constant_continuous_column_encodes_to_zero() {
        let schema = Schema::new(
            "abst",
            ["ba", "var"],
            vec![FieldSpec::continuous("nmr")],
        )
        .unwrap();
        let values = array![
            [1.0, 0.0, 1.0, 0.7],
            [0.0, 1.0, 0.0, 0.7],
            [1.0, 1.0, 1.0, 0.7],
        ];
        let training = CompletedDataset::new(schema, values).unwrap();
        let spec = EncodingSpec::fit(&training).unwrap();
        let encoded = spec.encode(&training).unwrap();
        assert!(encoded.column("nmr").unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn unseen_level_is_rejected_at_encode_time() {
        let training = training_data();
        let spec = EncodingSpec::fit(&training).unwrap();
        // A wider schema admits level 4, which the fit spec has never seen.
        let wide_schema = Schema::new(
            "abst",
            ["ba", "var"],
            vec![
                FieldSpec::continuous("nmr"),
                FieldSpec::binary("sex"),
                FieldSpec::ordinal("edu", vec![1, 2, 3, 4]),
            ],
        )
        .unwrap();
        let scoring = CompletedDataset::new(
            wide_schema,
            array![[1.0, 0.0, 1.0, 0.3, 1.0, 4.0]],
        )
        .unwrap();
        let err = spec.encode(&scoring).unwrap_err();
        match err {
            EncodeError::UnseenLevel { field, value } => {
                assert_eq!(field, "edu");
                assert_eq!(value, 4.0);
            }
            other => panic!("Expected UnseenLevel, got {other:?}"),
        }
    }
}

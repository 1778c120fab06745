//! # Schema and Dataset Module
//!
//! This module serves as the exclusive entry point for user-provided trial
//! data. It validates tabular data against a strict, predeclared schema and
//! transforms it into the clean `ndarray` structures required by the
//! statistical core.
//!
//! - Declared Schema: every field's type (continuous, binary, or ordinal with
//!   a canonical level ordering) is stated up front, never inferred from the
//!   data. This keeps encoding reproducible and level-order-stable between
//!   training and scoring.
//! - User-Centric Errors: failures are assumed to be user-input errors. The
//!   `SchemaError` enum is designed to provide clear, actionable feedback
//!   naming the offending field.
//! - Missing values are carried as `f64::NAN` inside the column store and
//!   mirrored by a `MissingnessMask`; everything downstream of the imputation
//!   engine operates on `CompletedDataset`, which is guaranteed NaN-free.

use ndarray::{Array1, Array2, ArrayView1, Axis, ShapeBuilder};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// The declared type of a single schema field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// A real-valued measurement (e.g., NMR, FTCD score).
    Continuous,
    /// A 0/1 indicator.
    Binary,
    /// An ordered categorical field with a canonical level ordering. The
    /// ordering is part of the schema and is the anchor for dummy-column
    /// generation at encode time.
    Ordinal { levels: Vec<i64> },
}

/// A named baseline field together with its declared type.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn continuous(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Continuous,
        }
    }

    pub fn binary(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Binary,
        }
    }

    pub fn ordinal(name: &str, levels: Vec<i64>) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Ordinal { levels },
        }
    }
}

static BINARY_KIND: FieldKind = FieldKind::Binary;

/// The fixed column contract of a trial dataset: one binary outcome, exactly
/// two binary treatment indicators, and a declared set of baseline fields.
///
/// The canonical field order is `[outcome, treatment_a, treatment_b,
/// baseline...]` and every `Dataset` stores its columns in that order.
#[derive(Debug, Clone)]
pub struct Schema {
    outcome: String,
    treatments: [String; 2],
    baseline: Vec<FieldSpec>,
}

impl Schema {
    pub fn new(
        outcome: &str,
        treatments: [&str; 2],
        baseline: Vec<FieldSpec>,
    ) -> Result<Self, SchemaError> {
        let schema = Self {
            outcome: outcome.to_string(),
            treatments: [treatments[0].to_string(), treatments[1].to_string()],
            baseline,
        };
        let mut seen = HashSet::new();
        for name in schema.field_names() {
            if !seen.insert(name.clone()) {
                return Err(SchemaError::DuplicateField(name));
            }
        }
        Ok(schema)
    }

    pub fn outcome(&self) -> &str {
        &self.outcome
    }

    pub fn treatments(&self) -> [&str; 2] {
        [&self.treatments[0], &self.treatments[1]]
    }

    pub fn baseline(&self) -> &[FieldSpec] {
        &self.baseline
    }

    pub fn num_fields(&self) -> usize {
        3 + self.baseline.len()
    }

    /// All field names in canonical order.
    pub fn field_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.num_fields());
        names.push(self.outcome.clone());
        names.push(self.treatments[0].clone());
        names.push(self.treatments[1].clone());
        names.extend(self.baseline.iter().map(|f| f.name.clone()));
        names
    }

    /// The declared kind of the field at canonical index `idx`. The outcome
    /// and both treatment indicators are binary by contract.
    pub fn kind_at(&self, idx: usize) -> &FieldKind {
        if idx < 3 {
            &BINARY_KIND
        } else {
            &self.baseline[idx - 3].kind
        }
    }

    pub fn name_at(&self, idx: usize) -> &str {
        match idx {
            0 => &self.outcome,
            1 => &self.treatments[0],
            2 => &self.treatments[1],
            _ => &self.baseline[idx - 3].name,
        }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        if name == self.outcome {
            return Some(0);
        }
        if name == self.treatments[0] {
            return Some(1);
        }
        if name == self.treatments[1] {
            return Some(2);
        }
        self.baseline
            .iter()
            .position(|f| f.name == name)
            .map(|i| i + 3)
    }
}

/// A comprehensive error type for all data validation failures.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column}' could not be converted to a numeric type. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType { column: String, found_type: String },
    #[error("The schema declares the field '{0}' more than once. Field names must be unique.")]
    DuplicateField(String),
    #[error(
        "The data matrix has {found} columns, but the schema declares {expected} fields. Columns must follow the canonical schema order."
    )]
    DimensionMismatch { found: usize, expected: usize },
    #[error(
        "The binary field '{field}' contains the value {value}, but only 0, 1, or a missing entry are allowed."
    )]
    NotBinary { field: String, value: f64 },
    #[error(
        "The ordinal field '{field}' contains the value {value}, which is not a member of its declared level set {levels:?}."
    )]
    UnknownLevel {
        field: String,
        value: f64,
        levels: Vec<i64>,
    },
    #[error(
        "An infinite value was found in the continuous field '{0}'. All observed entries must be finite; missing entries must be empty or 'NA'."
    )]
    InfiniteValue(String),
    #[error(
        "The outcome field '{0}' contains missing values. The outcome must be fully observed before a model can be scored against it."
    )]
    OutcomeMissing(String),
    #[error(
        "A completed dataset still contains a missing value in field '{0}'. This indicates an imputation defect upstream."
    )]
    StillMissing(String),
}

/// Per-field missingness indicators, computed once at ingestion and consumed
/// only by the imputation engine.
#[derive(Debug, Clone)]
pub struct MissingnessMask {
    /// Shape `[n_rows, n_fields]`, `true` where the entry was absent.
    pub mask: Array2<bool>,
}

impl MissingnessMask {
    pub fn field_missing_count(&self, field_idx: usize) -> usize {
        self.mask.column(field_idx).iter().filter(|&&m| m).count()
    }
}

/// A validated in-memory trial table. Missing entries are stored as NaN.
#[derive(Debug, Clone)]
pub struct Dataset {
    schema: Schema,
    values: Array2<f64>,
}

impl Dataset {
    /// Validates a column-ordered value matrix against the schema. Rejects
    /// any observed value that contradicts a field's declared type; NaN
    /// entries are accepted everywhere (including the outcome, which is only
    /// required to be complete at scoring time).
    pub fn new(schema: Schema, values: Array2<f64>) -> Result<Self, SchemaError> {
        if values.ncols() != schema.num_fields() {
            return Err(SchemaError::DimensionMismatch {
                found: values.ncols(),
                expected: schema.num_fields(),
            });
        }
        for idx in 0..schema.num_fields() {
            validate_column(&schema, idx, values.column(idx))?;
        }
        Ok(Self { schema, values })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>, SchemaError> {
        let idx = self
            .schema
            .index_of(name)
            .ok_or_else(|| SchemaError::ColumnNotFound(name.to_string()))?;
        Ok(self.values.column(idx))
    }

    /// Computes the missingness mask over every field.
    pub fn missingness(&self) -> MissingnessMask {
        let mask = self.values.mapv(|v| v.is_nan());
        MissingnessMask { mask }
    }
}

/// A dataset with zero missing entries, produced by the imputation engine.
#[derive(Debug, Clone)]
pub struct CompletedDataset {
    schema: Schema,
    values: Array2<f64>,
}

impl CompletedDataset {
    /// Wraps a value matrix that is expected to be complete, failing with the
    /// first still-missing field if the expectation is violated.
    pub fn new(schema: Schema, values: Array2<f64>) -> Result<Self, SchemaError> {
        for idx in 0..schema.num_fields() {
            if values.column(idx).iter().any(|v| v.is_nan()) {
                return Err(SchemaError::StillMissing(schema.name_at(idx).to_string()));
            }
        }
        Dataset::new(schema, values).map(|d| Self {
            schema: d.schema,
            values: d.values,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>, SchemaError> {
        let idx = self
            .schema
            .index_of(name)
            .ok_or_else(|| SchemaError::ColumnNotFound(name.to_string()))?;
        Ok(self.values.column(idx))
    }

    /// The outcome vector. Completeness is already guaranteed, so this is the
    /// scoring-ready 0/1 response.
    pub fn outcome(&self) -> Array1<f64> {
        self.values.column(0).to_owned()
    }

    /// A new dataset containing only the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> CompletedDataset {
        CompletedDataset {
            schema: self.schema.clone(),
            values: self.values.select(Axis(0), rows),
        }
    }
}

fn validate_column(
    schema: &Schema,
    idx: usize,
    column: ArrayView1<'_, f64>,
) -> Result<(), SchemaError> {
    let name = schema.name_at(idx);
    match schema.kind_at(idx) {
        FieldKind::Continuous => {
            if column.iter().any(|v| v.is_infinite()) {
                return Err(SchemaError::InfiniteValue(name.to_string()));
            }
        }
        FieldKind::Binary => {
            for &v in column.iter() {
                if !v.is_nan() && v != 0.0 && v != 1.0 {
                    return Err(SchemaError::NotBinary {
                        field: name.to_string(),
                        value: v,
                    });
                }
            }
        }
        FieldKind::Ordinal { levels } => {
            for &v in column.iter() {
                if v.is_nan() {
                    continue;
                }
                let as_level = v as i64;
                if v.fract() != 0.0 || !levels.contains(&as_level) {
                    return Err(SchemaError::UnknownLevel {
                        field: name.to_string(),
                        value: v,
                        levels: levels.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Loads a tab-separated trial file and validates it against the schema.
///
/// Empty cells and the literal marker `NA` are read as missing entries; every
/// observed entry must satisfy its field's declared type.
pub fn load_trial_data(path: &str, schema: Schema) -> Result<Dataset, SchemaError> {
    log::info!("Loading trial data from '{path}'");

    let df = CsvReader::new(File::open(Path::new(path))?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(
                    CsvParseOptions::default()
                        .with_separator(b'\t')
                        .with_null_values(Some(NullValues::AllColumnsSingle("NA".into()))),
                ),
        )
        .finish()?;

    let df_columns: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for name in schema.field_names() {
        if !df_columns.contains(&name) {
            return Err(SchemaError::ColumnNotFound(name));
        }
    }

    let n_rows = df.height();
    let n_fields = schema.num_fields();
    let mut buffer = Vec::with_capacity(n_rows * n_fields);
    for name in schema.field_names() {
        buffer.extend(extract_column_with_missing(&df, &name)?);
    }
    let values = Array2::from_shape_vec((n_rows, n_fields).f(), buffer)
        .expect("column buffers have consistent lengths");

    let dataset = Dataset::new(schema, values)?;
    log::info!(
        "Loaded {} rows over {} schema fields.",
        dataset.n_rows(),
        dataset.schema().num_fields()
    );
    Ok(dataset)
}

/// Extracts one numeric column, preserving nulls as NaN.
fn extract_column_with_missing(df: &DataFrame, name: &str) -> Result<Vec<f64>, SchemaError> {
    let series = df
        .column(name)
        .map_err(|_| SchemaError::ColumnNotFound(name.to_string()))?;
    let casted = series.cast(&DataType::Float64).map_err(|_| {
        SchemaError::ColumnWrongType {
            column: name.to_string(),
            found_type: format!("{:?}", series.dtype()),
        }
    })?;
    let chunked = casted.f64()?.rechunk();
    Ok(chunked.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    pub(crate) fn toy_schema() -> Schema {
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

    #[test]
    fn canonical_field_order_is_outcome_treatments_baseline() {
        let schema = toy_schema();
        assert_eq!(
            schema.field_names(),
            vec!["abst", "ba", "var", "nmr", "sex", "edu"]
        );
        assert_eq!(schema.index_of("var"), Some(2));
        assert_eq!(schema.index_of("edu"), Some(5));
        assert_eq!(schema.index_of("unknown"), None);
    }

    #[test]
    fn duplicate_field_name_is_rejected() {
        let err = Schema::new(
            "abst",
            ["ba", "var"],
            vec![FieldSpec::continuous("ba")],
        )
        .unwrap_err();
        match err {
            SchemaError::DuplicateField(name) => assert_eq!(name, "ba"),
            other => panic!("Expected DuplicateField, got {other:?}"),
        }
    }

    #[test]
    fn binary_field_rejects_non_indicator_values() {
        let schema = toy_schema();
        let values = array![
            [1.0, 0.0, 1.0, 0.5, 2.0, 1.0],
            [0.0, 1.0, 0.0, 0.1, 0.0, 2.0],
        ];
        let err = Dataset::new(schema, values).unwrap_err();
        match err {
            SchemaError::NotBinary { field, value } => {
                assert_eq!(field, "sex");
                assert_eq!(value, 2.0);
            }
            other => panic!("Expected NotBinary, got {other:?}"),
        }
    }

    #[test]
    fn ordinal_field_rejects_undeclared_level() {
        let schema = toy_schema();
        let values = array![
            [1.0, 0.0, 1.0, 0.5, 1.0, 4.0],
            [0.0, 1.0, 0.0, 0.1, 0.0, 2.0],
        ];
        let err = Dataset::new(schema, values).unwrap_err();
        match err {
            SchemaError::UnknownLevel { field, value, levels } => {
                assert_eq!(field, "edu");
                assert_eq!(value, 4.0);
                assert_eq!(levels, vec![1, 2, 3]);
            }
            other => panic!("Expected UnknownLevel, got {other:?}"),
        }
    }

    #[test]
    fn missing_entries_are_tolerated_and_masked() {
        let schema = toy_schema();
        let values = array![
            [1.0, 0.0, 1.0, f64::NAN, 1.0, 3.0],
            [f64::NAN, 1.0, 0.0, 0.1, f64::NAN, 2.0],
        ];
        let dataset = Dataset::new(schema, values).unwrap();
        let mask = dataset.missingness();
        assert!(mask.mask[[0, 3]]);
        assert!(mask.mask[[1, 0]]);
        assert!(mask.mask[[1, 4]]);
        assert_eq!(mask.field_missing_count(3), 1);
        assert_eq!(mask.field_missing_count(5), 0);
    }

    #[test]
    fn completed_dataset_rejects_residual_missingness() {
        let schema = toy_schema();
        let values = array![
            [1.0, 0.0, 1.0, 0.5, 1.0, 3.0],
            [0.0, 1.0, 0.0, f64::NAN, 0.0, 2.0],
        ];
        let err = CompletedDataset::new(schema, values).unwrap_err();
        match err {
            SchemaError::StillMissing(field) => assert_eq!(field, "nmr"),
            other => panic!("Expected StillMissing, got {other:?}"),
        }
    }

    #[test]
    fn select_rows_preserves_order_and_schema() {
        let schema = toy_schema();
        let values = array![
            [1.0, 0.0, 1.0, 0.5, 1.0, 3.0],
            [0.0, 1.0, 0.0, 0.1, 0.0, 2.0],
            [1.0, 1.0, 1.0, 0.9, 1.0, 1.0],
        ];
        let completed = CompletedDataset::new(schema, values).unwrap();
        let subset = completed.select_rows(&[2, 0]);
        assert_eq!(subset.n_rows(), 2);
        assert_eq!(subset.values()[[0, 3]], 0.9);
        assert_eq!(subset.values()[[1, 3]], 0.5);
        assert_eq!(subset.outcome().to_vec(), vec![1.0, 1.0]);
    }

    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{content}")?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn load_trial_data_reads_na_as_missing() {
        let content = "abst\tba\tvar\tnmr\tsex\tedu\n\
                       1\t0\t1\t0.5\t1\t3\n\
                       0\t1\t0\tNA\t0\t2\n\
                       1\t1\t1\t0.9\tNA\t1";
        let file = create_test_tsv(content).unwrap();
        let dataset = load_trial_data(file.path().to_str().unwrap(), toy_schema()).unwrap();
        assert_eq!(dataset.n_rows(), 3);
        let mask = dataset.missingness();
        assert!(mask.mask[[1, 3]]);
        assert!(mask.mask[[2, 4]]);
        assert_eq!(mask.field_missing_count(0), 0);
    }

    #[test]
    fn load_trial_data_reports_missing_column() {
        let content = "abst\tba\tvar\tnmr\tsex\n1\t0\t1\t0.5\t1";
        let file = create_test_tsv(content).unwrap();
        let err = load_trial_data(file.path().to_str().unwrap(), toy_schema()).unwrap_err();
        match err {
            SchemaError::ColumnNotFound(col) => assert_eq!(col, "edu"),
            other => panic!("Expected ColumnNotFound, got {other:?}"),
        }
    }
}

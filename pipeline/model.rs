//! # Fitted Model Artifact
//!
//! The self-contained result of the second selection pass: intercept,
//! coefficient vector, chosen penalty, the exact ordered column list the
//! model was trained on, the encoding that produced those columns, and the
//! interaction terms to rebuild on new data. Everything needed to score a
//! new dataset travels with the model, and the artifact serializes to a
//! human-readable TOML file.
//!
//! Scoring is a fast, non-iterative process: encode, rebuild interactions,
//! reindex onto the training column list (zero-filling anything absent), and
//! apply the inverse logit.

use crate::construction::{self, InteractionTerm};
use crate::data::CompletedDataset;
use crate::encode::{EncodeError, EncodingSpec, NamedMatrix};
use crate::lasso::LassoFit;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// The trained moderation model, ready for persistence and scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedModel {
    pub intercept: f64,
    /// The penalty the model was refit at.
    pub lambda: f64,
    /// The exact ordered column list the model was trained on. Scoring any
    /// other matrix starts by reindexing onto this list.
    pub column_names: Vec<String>,
    /// One coefficient per entry of `column_names`.
    pub coefficients: Vec<f64>,
    /// The train-fit encoding, reused verbatim on scoring data.
    pub encoding: EncodingSpec,
    /// The interaction terms appended after encoding.
    pub interactions: Vec<InteractionTerm>,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write the model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse the TOML model file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize the model to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error(
        "The model file lists {names} column names but {coefficients} coefficients; the artifact is corrupt."
    )]
    CoefficientMismatch { names: usize, coefficients: usize },
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Construction(#[from] construction::ConstructionError),
}

impl FittedModel {
    /// Assembles a model from a selection-pass fit over a named design.
    pub fn from_fit(
        fit: &LassoFit,
        design: &NamedMatrix,
        encoding: EncodingSpec,
        interactions: Vec<InteractionTerm>,
    ) -> Self {
        Self {
            intercept: fit.intercept,
            lambda: fit.lambda,
            column_names: design.column_names.clone(),
            coefficients: fit.beta.to_vec(),
            encoding,
            interactions,
        }
    }

    /// Scores a named matrix. The matrix is reindexed onto the training
    /// column list first: absent columns count as zero, surplus columns are
    /// ignored, and every row is scored.
    pub fn predict_matrix(&self, matrix: &NamedMatrix) -> Array1<f64> {
        let aligned = construction::reindex(matrix, &self.column_names);
        let beta = Array1::from_vec(self.coefficients.clone());
        let eta = aligned.values.dot(&beta) + self.intercept;
        let eta = eta.mapv(|e| e.clamp(-700.0, 700.0));
        let mut probs = eta.mapv(|e| 1.0 / (1.0 + f64::exp(-e)));
        probs.mapv_inplace(|p| p.clamp(1e-8, 1.0 - 1e-8));
        probs
    }

    /// Scores a completed dataset end to end: encode with the train-fit
    /// spec, rebuild the interaction columns, and score.
    pub fn predict(&self, dataset: &CompletedDataset) -> Result<Array1<f64>, ModelError> {
        let encoded = self.encoding.encode(dataset)?;
        let design = construction::apply_interactions(&encoded, &self.interactions)?;
        Ok(self.predict_matrix(&design))
    }

    /// Saves the model to a human-readable TOML file.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let file = fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(toml_string.as_bytes())?;
        writer.flush()?;
        log::info!("Saved fitted model to '{path}'.");
        Ok(())
    }

    /// Loads a model from a TOML file, validating the artifact's internal
    /// consistency.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let contents = fs::read_to_string(path)?;
        let model: FittedModel = toml::from_str(&contents)?;
        if model.column_names.len() != model.coefficients.len() {
            return Err(ModelError::CoefficientMismatch {
                names: model.column_names.len(),
                coefficients: model.coefficients.len(),
            });
        }
        Ok(model)
    }
}

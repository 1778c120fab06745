//! # Design Matrix Construction
//!
//! Builds the moderation design matrix for the second selection pass and owns
//! the column-alignment rules used at scoring time. The layout is an
//! explicit, programmatically generated ordered column list — never an
//! implicit formula expansion — so the exact column set driving every fit is
//! inspectable and testable:
//!
//! ```text
//! [treat_a, treat_b, baseline columns..., treat_a:c1, treat_b:c1, treat_a:c2, ...]
//! ```
//!
//! Both treatments and every baseline column stay in as main effects; only
//! the interaction terms are restricted, to the covariates screened by the
//! first selection pass. Interaction-term count grows multiplicatively with
//! covariate count, so the restriction is what keeps the second-stage design
//! tractable and interpretable.

use crate::encode::NamedMatrix;
use crate::lasso::PredictorSet;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One treatment × covariate product column. Serializable so a fitted model
/// can rebuild its own interaction columns on new data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionTerm {
    pub treatment: String,
    pub covariate: String,
}

impl InteractionTerm {
    /// The design-matrix column name of this term.
    pub fn column_name(&self) -> String {
        format!("{}:{}", self.treatment, self.covariate)
    }
}

#[derive(Error, Debug)]
pub enum ConstructionError {
    #[error(
        "The interaction term references the covariate '{0}', which is absent from the encoded matrix."
    )]
    MissingCovariate(String),
    #[error("The treatment column '{0}' is absent from the encoded matrix.")]
    MissingTreatment(String),
}

/// The moderation candidates: covariates selected by the first pass, in
/// selection order, with treatment main effects screened out (a treatment
/// cannot moderate itself).
pub fn moderation_candidates(selected: &PredictorSet, treatments: [&str; 2]) -> Vec<String> {
    selected
        .names()
        .into_iter()
        .filter(|name| name != treatments[0] && name != treatments[1])
        .collect()
}

/// The interaction terms for a candidate list: both treatments crossed with
/// each candidate, candidate-major so related columns stay adjacent.
pub fn interaction_terms(treatments: [&str; 2], candidates: &[String]) -> Vec<InteractionTerm> {
    let mut terms = Vec::with_capacity(2 * candidates.len());
    for covariate in candidates {
        for treatment in treatments {
            terms.push(InteractionTerm {
                treatment: treatment.to_string(),
                covariate: covariate.clone(),
            });
        }
    }
    terms
}

/// Appends the given interaction columns to a named matrix. Every referenced
/// treatment and covariate must already be a column of the input.
pub fn apply_interactions(
    matrix: &NamedMatrix,
    terms: &[InteractionTerm],
) -> Result<NamedMatrix, ConstructionError> {
    let n_rows = matrix.n_rows();
    let base_cols = matrix.n_cols();
    let mut values = Array2::zeros((n_rows, base_cols + terms.len()));
    values
        .slice_mut(ndarray::s![.., ..base_cols])
        .assign(&matrix.values);

    let mut column_names = matrix.column_names.clone();
    for (k, term) in terms.iter().enumerate() {
        let treatment = matrix
            .column(&term.treatment)
            .ok_or_else(|| ConstructionError::MissingTreatment(term.treatment.clone()))?;
        let covariate = matrix
            .column(&term.covariate)
            .ok_or_else(|| ConstructionError::MissingCovariate(term.covariate.clone()))?;
        for i in 0..n_rows {
            values[[i, base_cols + k]] = treatment[i] * covariate[i];
        }
        column_names.push(term.column_name());
    }

    Ok(NamedMatrix {
        column_names,
        values,
    })
}

/// Builds the full moderation design from an encoded matrix and the pass-1
/// predictor set: main effects stay as encoded, interactions are appended
/// for the screened candidates only.
pub fn build_design(
    encoded: &NamedMatrix,
    treatments: [&str; 2],
    selected: &PredictorSet,
) -> Result<(NamedMatrix, Vec<InteractionTerm>), ConstructionError> {
    let candidates = moderation_candidates(selected, treatments);
    let terms = interaction_terms(treatments, &candidates);
    let design = apply_interactions(encoded, &terms)?;
    log::info!(
        "Built moderation design: {} main-effect columns plus {} interaction columns.",
        encoded.n_cols(),
        terms.len()
    );
    Ok((design, terms))
}

/// Reindexes a named matrix onto a target column list. A target column
/// absent from the input is zero-filled; an input column absent from the
/// target is dropped. This is the scoring-time alignment contract: a
/// mismatch is resolved, never a crash and never a silent row drop.
pub fn reindex(matrix: &NamedMatrix, target: &[String]) -> NamedMatrix {
    let n_rows = matrix.n_rows();
    let mut values = Array2::zeros((n_rows, target.len()));
    for (c, name) in target.iter().enumerate() {
        if let Some(source) = matrix.column(name) {
            for i in 0..n_rows {
                values[[i, c]] = source[i];
            }
        }
    }
    NamedMatrix {
        column_names: target.to_vec(),
        values,
    }
}

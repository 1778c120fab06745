#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::Parser;
use std::process;

use abstain::data::{self, FieldSpec, Schema};
use abstain::diagnostics::CorrelationMatrix;
use abstain::lasso::PredictorSet;
use abstain::run::{PipelineConfig, run_pipeline};

/// Predictor selection and treatment moderation for smoking-cessation trial
/// data: impute, screen, fit the moderation model, and evaluate out of
/// sample.
#[derive(Parser)]
#[command(name = "abstain", version)]
struct Cli {
    /// Path to the trial TSV file (tab-separated, 'NA' or empty = missing)
    data: String,

    /// Seed every random decision in the pipeline derives from
    #[arg(long, default_value = "500")]
    seed: u64,

    /// Number of imputation draws (m)
    #[arg(long, default_value = "5")]
    imputations: usize,

    /// Chained-equation sweeps per imputation draw (maxit)
    #[arg(long, default_value = "50")]
    imputation_iterations: usize,

    /// Donor pool size for predictive mean matching
    #[arg(long, default_value = "5")]
    donors: usize,

    /// Cross-validation fold count for both selection passes
    #[arg(long, default_value = "10")]
    folds: usize,

    /// Number of penalty-grid points per selection pass
    #[arg(long, default_value = "100")]
    lambda_count: usize,

    /// Training share of the evaluation split
    #[arg(long, default_value = "0.8")]
    train_fraction: f64,

    /// Write the fitted model to this TOML file
    #[arg(long)]
    model_out: Option<String>,

    /// Write the held-out ROC curve to this TSV file
    #[arg(long)]
    roc_out: Option<String>,
}

/// The fixed column contract of the trial file. Column names are not
/// configurable; enforcing the schema here eliminates a whole class of
/// configuration errors.
fn trial_schema() -> Result<Schema, data::SchemaError> {
    Schema::new(
        "abst",
        ["ba", "var"],
        vec![
            FieldSpec::continuous("age"),
            FieldSpec::binary("sex"),
            FieldSpec::binary("nhw"),
            FieldSpec::binary("black"),
            FieldSpec::binary("hisp"),
            FieldSpec::ordinal("inc", vec![1, 2, 3, 4, 5]),
            FieldSpec::ordinal("edu", vec![1, 2, 3, 4, 5]),
            FieldSpec::continuous("ftcd_score"),
            FieldSpec::binary("ftcd_5_mins"),
            FieldSpec::continuous("bdi_score"),
            FieldSpec::continuous("cpd"),
            FieldSpec::continuous("crv_total"),
            FieldSpec::continuous("hedonsum_n"),
            FieldSpec::continuous("hedonsum_y"),
            FieldSpec::continuous("shaps_score"),
            FieldSpec::binary("otherdiag"),
            FieldSpec::binary("antidepmed"),
            FieldSpec::binary("mde_curr"),
            FieldSpec::continuous("nmr"),
            FieldSpec::binary("only_menthol"),
            FieldSpec::ordinal("readiness", vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]),
        ],
    )
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let schema = match trial_schema() {
        Ok(schema) => schema,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let dataset = match data::load_trial_data(&cli.data, schema) {
        Ok(dataset) => dataset,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let config = PipelineConfig {
        imputation_draws: cli.imputations,
        imputation_iterations: cli.imputation_iterations,
        donors: cli.donors,
        cv_folds: cli.folds,
        n_lambda: cli.lambda_count,
        train_fraction: cli.train_fraction,
        seed: cli.seed,
    };

    let report = match run_pipeline(&dataset, &config) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    println!("\n=== Missing values (pre-imputation) ===");
    println!("{:<16} {:>8} {:>8} {:>8}", "field", "missing", "total", "pct");
    for row in &report.missing_summary {
        if row.missing == 0 {
            continue;
        }
        println!(
            "{:<16} {:>8} {:>8} {:>7.1}%",
            row.field, row.missing, row.total, row.percent
        );
    }

    print_correlations(&report.correlations);
    print_predictor_set("Pass 1: main-effects screen", &report.screened);
    print_predictor_set("Pass 2: moderation model", &report.moderation);

    println!("\n=== Held-out evaluation ===");
    println!(
        "train n = {}, test n = {}",
        report.evaluation.n_train, report.evaluation.n_test
    );
    println!("AUC = {:.4}", report.evaluation.auc);
    println!("ROC curve ({} points):", report.evaluation.roc.len());
    println!("{:>8} {:>8}", "fpr", "tpr");
    for point in &report.evaluation.roc {
        println!("{:>8.4} {:>8.4}", point.fpr, point.tpr);
    }

    if let Some(path) = &cli.model_out {
        if let Err(e) = report.model.save(path) {
            eprintln!("Error: {e}");
            process::exit(1);
        }
        println!("\nFitted model written to '{path}'.");
    }

    if let Some(path) = &cli.roc_out {
        if let Err(e) = write_roc_tsv(path, &report.evaluation) {
            eprintln!("Error: {e}");
            process::exit(1);
        }
        println!("ROC curve written to '{path}'.");
    }
}

fn write_roc_tsv(
    path: &str,
    evaluation: &abstain::evaluate::EvaluationResult,
) -> std::io::Result<()> {
    use std::io::Write;
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    writeln!(writer, "fpr\ttpr")?;
    for point in &evaluation.roc {
        writeln!(writer, "{}\t{}", point.fpr, point.tpr)?;
    }
    writer.flush()
}

fn print_correlations(correlations: &CorrelationMatrix) {
    println!("\n=== Correlations (continuous fields and outcome) ===");
    print!("{:<14}", "");
    for label in &correlations.labels {
        print!("{label:>12}");
    }
    println!();
    for (i, label) in correlations.labels.iter().enumerate() {
        print!("{label:<14}");
        for j in 0..correlations.labels.len() {
            let value = correlations.values[[i, j]];
            if value.is_nan() {
                print!("{:>12}", "-");
            } else {
                print!("{value:>12.3}");
            }
        }
        println!();
    }
}

fn print_predictor_set(title: &str, set: &PredictorSet) {
    println!("\n=== {title} (lambda = {:.4e}) ===", set.lambda);
    if set.is_empty() {
        println!("(no predictors survived the penalty)");
        return;
    }
    println!("{:<20} {:>12}", "predictor", "coefficient");
    for predictor in &set.predictors {
        println!("{:<20} {:>12.5}", predictor.name, predictor.coefficient);
    }
}

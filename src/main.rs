//! medsurvive CLI - cohort survival reports from a patient csv

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use medsurvive::{
    export, loader, pipeline, reference, Covariate, Dataset, DiagnosisReference, GroupBy, Importance,
    PipelineConfig,
};

#[derive(Parser)]
#[command(name = "medsurvive")]
#[command(author, version)]
#[command(
    about = "Survival analysis for patient cohorts - Kaplan-Meier curves, Cox models, feature importance"
)]
#[command(long_about = "medsurvive: filter a patient table and analyse time-to-event outcomes.

The input is a delimited file with the columns
  patient_id, age, sex, diagnosis_code, treatment_type, duration, event
in any order; additional columns are carried through to the cohort export.

EXAMPLES:
  # Curves by sex for patients aged 40-65
  medsurvive report --input patients.csv --age-min 40 --age-max 65 --group-by sex

  # Two diagnoses, ridge-penalized model, write the coefficient table
  medsurvive report --input patients.csv --diagnosis I10 --diagnosis E11 \\
      --penalizer 0.1 --summary-out summary.csv

  # What does a code mean?
  medsurvive lookup J44")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Filter, estimate survival curves, fit the hazard model and rank features
    Report(ReportArgs),
    /// Describe a diagnosis code
    Lookup {
        /// Diagnosis code (e.g., I10)
        code: String,
    },
    /// Describe the treatment categories
    Treatments,
}

#[derive(clap::Args)]
struct ReportArgs {
    /// Patient table (csv)
    #[arg(long, value_name = "FILE")]
    input: PathBuf,

    /// JSON pipeline configuration; flags below override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Minimum age (inclusive)
    #[arg(long, value_name = "N")]
    age_min: Option<f64>,

    /// Maximum age (inclusive)
    #[arg(long, value_name = "N")]
    age_max: Option<f64>,

    /// Accepted sex values (repeatable)
    #[arg(long, value_name = "V")]
    sex: Vec<String>,

    /// Accepted diagnosis codes (repeatable)
    #[arg(long, value_name = "CODE")]
    diagnosis: Vec<String>,

    /// Accepted treatment types (repeatable)
    #[arg(long, value_name = "T")]
    treatment: Vec<String>,

    /// Split curves by: none, sex, diagnosis_code, treatment_type
    #[arg(long, value_name = "KEY")]
    group_by: Option<GroupBy>,

    /// Covariates for the hazard model (repeatable, default: all)
    #[arg(long, value_name = "NAME")]
    covariate: Vec<Covariate>,

    /// L2 penalty strength
    #[arg(long, value_name = "LAMBDA")]
    penalizer: Option<f64>,

    /// Write the filtered cohort here
    #[arg(long, value_name = "FILE")]
    cohort_out: Option<PathBuf>,

    /// Write the coefficient table here
    #[arg(long, value_name = "FILE")]
    summary_out: Option<PathBuf>,

    /// Write the survival curves here
    #[arg(long, value_name = "FILE")]
    curves_out: Option<PathBuf>,

    /// Write the feature ranking here
    #[arg(long, value_name = "FILE")]
    importance_out: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    match cli.command {
        Commands::Report(args) => handle_report(args),
        Commands::Lookup { code } => handle_lookup(&code),
        Commands::Treatments => handle_treatments(),
    }
}

fn build_config(args: &ReportArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("Failed to open config {}", path.display()))?;
            PipelineConfig::from_json_reader(file)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };

    if let Some(min) = args.age_min {
        config.criteria.age_min = Some(min);
    }
    if let Some(max) = args.age_max {
        config.criteria.age_max = Some(max);
    }
    if !args.sex.is_empty() {
        config.criteria.sex = Some(args.sex.iter().cloned().collect());
    }
    if !args.diagnosis.is_empty() {
        config.criteria.diagnosis_code = Some(args.diagnosis.iter().cloned().collect());
    }
    if !args.treatment.is_empty() {
        config.criteria.treatment_type = Some(args.treatment.iter().cloned().collect());
    }
    if let Some(group_by) = args.group_by {
        config.group_by = group_by;
    }
    if !args.covariate.is_empty() {
        config.covariates = args.covariate.clone();
    }
    if let Some(penalizer) = args.penalizer {
        config.penalizer = penalizer;
    }

    config.validate().context("Invalid report options")?;
    Ok(config)
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn handle_report(args: ReportArgs) -> Result<()> {
    let config = build_config(&args)?;
    let dataset = loader::load_path(&args.input)
        .with_context(|| format!("Failed to load {}", args.input.display()))?;

    println!("Loaded {} patients from {}", dataset.len(), args.input.display());
    if dataset.dropped_rows > 0 {
        println!(
            "Dropped {} of {} rows with missing or invalid values",
            dataset.dropped_rows, dataset.total_rows
        );
    }
    print_filter_values(&dataset);

    let report = pipeline::run(&dataset, &config)?;
    println!("Cohort: {} patients\n", report.cohort.len());

    println!("Survival curves");
    println!("─────────────────────────────────────────");
    for curve in &report.curves {
        let median = curve
            .median_survival_time()
            .map(|t| format!("{t:.2}"))
            .unwrap_or_else(|| "not reached".to_string());
        println!(
            "{:<20} n = {:<6} events = {:<6} median = {}",
            curve.label,
            curve.n_subjects,
            curve.n_events(),
            median
        );
    }
    println!();

    match report.fit.model() {
        Some(model) => println!("{model}"),
        None => {
            if let Some(failure) = report.fit.failure() {
                println!("Hazard model: {failure}\n");
            }
        }
    }

    if let Importance::Available(ranking) = &report.importance {
        println!("Feature importance (mean |contribution| to partial hazard)");
        println!("─────────────────────────────────────────");
        for contribution in &ranking.features {
            println!("{:<28} {:>10.4}", contribution.feature, contribution.score);
        }
        if let Some(top) = ranking.top() {
            println!("Most influential: {} (base hazard {:.4})", top.feature, ranking.base_value);
        }
        println!();
    }

    for warning in &report.warnings {
        println!("warning: {warning}");
    }

    if let Some(path) = &args.cohort_out {
        export::write_cohort(create(path)?, &dataset.extra_columns, &report.cohort)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Cohort written to {}", path.display());
    }
    if let Some(path) = &args.curves_out {
        export::write_curves(create(path)?, &report.curves)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Curves written to {}", path.display());
    }
    if let Some(path) = &args.summary_out {
        match report.fit.model() {
            Some(model) => {
                export::write_summary(create(path)?, model)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Model summary written to {}", path.display());
            }
            None => println!("No model summary to write"),
        }
    }
    if let Some(path) = &args.importance_out {
        match report.importance.ranking() {
            Some(ranking) => {
                export::write_importance(create(path)?, ranking)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Feature importance written to {}", path.display());
            }
            None => println!("No feature importance to write"),
        }
    }

    Ok(())
}

/// the values the filter flags can take for this table
fn print_filter_values(dataset: &Dataset) {
    if let Some((lo, hi)) = dataset.age_span() {
        println!("Ages {lo} to {hi}");
    }
    println!("Sex: {}", dataset.levels(|r| r.sex.as_str()).join(", "));
    println!("Diagnoses: {}", dataset.levels(|r| r.diagnosis_code.as_str()).join(", "));
    println!("Treatments: {}", dataset.levels(|r| r.treatment_type.as_str()).join(", "));
}

fn handle_lookup(code: &str) -> Result<()> {
    let table = DiagnosisReference::builtin();
    let Some(entry) = table.lookup(code) else {
        println!("No information available for '{}'. Known codes: {}", code, table.codes().join(", "));
        return Ok(());
    };

    println!("{} - {}", entry.code, entry.condition);
    println!("{}", entry.description);
    println!("Treatments: {}", entry.treatments.join(", "));
    println!("Procedures: {}", entry.procedures.join(", "));
    Ok(())
}

fn handle_treatments() -> Result<()> {
    for (kind, text) in reference::TREATMENT_TYPES {
        println!("{kind:<14} {text}");
    }
    Ok(())
}

use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use household_cleaner::{clean, CleanOutcome, PipelineConfig};
use log::info;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "household_cleaner")]
#[command(about = "Select eligible Goiener households and write the cleaned feature table")]
struct Args {
    /// Directory holding the archive and metadata.csv
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Archive file name inside the data directory
    #[arg(short, long, default_value = "imputed_goiener_v7.tar.zst")]
    file_name: String,

    /// JSON file with pipeline options
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Start of the analysis window (YYYY-MM-DD)
    #[arg(long)]
    cutoff_date: Option<NaiveDate>,

    /// Consecutive zero days that disqualify a household
    #[arg(long)]
    min_run_length: Option<usize>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "summary")]
    output: OutputFormat,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Summary,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(cutoff) = args.cutoff_date {
        config.cutoff_date = cutoff;
    }
    if let Some(len) = args.min_run_length {
        config.min_run_length = len;
    }
    config.validate()?;

    info!("Cleaning {} (cutoff {})", args.data_dir.display(), config.cutoff_date);

    let report = match clean(&args.data_dir, &args.file_name, &config)? {
        CleanOutcome::Completed(report) => report,
        CleanOutcome::ExtractionFailed { archive } => {
            bail!("Extraction failed: {} is not a tar archive", archive.display())
        }
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Summary => {
            println!("Post-cutoff households={}", report.eligible_households);
            if let Some(id) = &report.example_household {
                println!("Example household id: {}", id);
            }
            println!("Excluded households: {}", report.excluded_households);
            println!("Feature rows: {}", report.feature_rows);
        }
    }

    Ok(())
}

use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use household_cleaner::{clean, CleanOutcome, CsvMerger, ExtractOutcome, Extractor, PipelineConfig};
use log::info;
use std::path::PathBuf;

mod download;

#[derive(Parser)]
#[command(name = "goiener_pipeline")]
#[command(about = "Prepare the Goiener household consumption dataset for analysis")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract (if needed), select eligible households and build the feature table
    Clean(CleanArgs),
    /// Decompress a .tar.zst archive into a directory
    Extract {
        #[arg(long)]
        archive: PathBuf,
        #[arg(long)]
        dest: PathBuf,
    },
    /// Concatenate per-household CSV files, tagging rows with the file stem
    Merge {
        /// Directory searched for *.csv when no files are listed
        #[arg(long)]
        source_dir: Option<PathBuf>,
        #[arg(long)]
        output: PathBuf,
        files: Vec<PathBuf>,
    },
    /// Fetch the metadata and archive files
    Download {
        #[arg(long = "url")]
        urls: Vec<String>,
        #[arg(long, default_value = "data")]
        dest: PathBuf,
    },
}

#[derive(Args)]
struct CleanArgs {
    /// Directory holding the archive and metadata.csv; outputs land here too
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Name of the .tar.zst archive inside the data directory
    #[arg(long, default_value = "imputed_goiener_v7.tar.zst")]
    file_name: String,

    /// JSON file with pipeline options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start of the analysis window (YYYY-MM-DD)
    #[arg(long)]
    cutoff_date: Option<NaiveDate>,

    /// Consecutive zero days that disqualify a household
    #[arg(long)]
    min_run_length: Option<usize>,

    /// Daily kWh below which a day counts as zero
    #[arg(long)]
    zero_epsilon: Option<f64>,

    /// Minimum days of coverage after the cutoff
    #[arg(long)]
    min_coverage_days: Option<i64>,
}

impl CleanArgs {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(cutoff) = self.cutoff_date {
            config.cutoff_date = cutoff;
        }
        if let Some(len) = self.min_run_length {
            config.min_run_length = len;
        }
        if let Some(eps) = self.zero_epsilon {
            config.zero_epsilon = eps;
        }
        if let Some(days) = self.min_coverage_days {
            config.min_coverage_days = days;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Clean(args) => {
            let config = args.pipeline_config()?;
            info!("Cleaning {} with {:?}", args.data_dir.display(), config);
            match clean(&args.data_dir, &args.file_name, &config)? {
                CleanOutcome::Completed(report) => {
                    println!("Post-cutoff households={}", report.eligible_households);
                    if let Some(id) = report.example_household {
                        println!("Example household id: {}", id);
                    }
                    println!(
                        "Excluded {} households, {} feature rows",
                        report.excluded_households, report.feature_rows
                    );
                }
                CleanOutcome::ExtractionFailed { archive } => {
                    bail!("Extraction failed: {} is not a tar archive", archive.display());
                }
            }
        }
        Command::Extract { archive, dest } => match Extractor::new(&archive, &dest)?.extract()? {
            ExtractOutcome::Extracted { entries } => println!("Extraction complete ({} entries)", entries),
            ExtractOutcome::NotAnArchive => bail!("Extraction failed: {} is not a tar archive", archive.display()),
        },
        Command::Merge { source_dir, output, files } => {
            let summary = CsvMerger::new(files, source_dir, output)
                .with_progress(true)
                .combine_csv_files()?;
            println!(
                "Merged {} files ({} rows, {} skipped, {} with layout mismatches)",
                summary.files_merged,
                summary.rows_written,
                summary.files_skipped,
                summary.schema_mismatches.len()
            );
        }
        Command::Download { urls, dest } => {
            let urls = if urls.is_empty() {
                download::DEFAULT_URLS.iter().map(|u| u.to_string()).collect()
            } else {
                urls
            };
            let client = reqwest::blocking::Client::builder().timeout(None).build()?;
            for url in &urls {
                download::download_file(&client, url, &dest)?;
            }
        }
    }

    Ok(())
}

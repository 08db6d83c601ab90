use crate::assembler::assemble_features;
use crate::csv_merger::{CsvMerger, MergeSummary};
use crate::data_loader::{
    load_raw_metadata, load_readings, readings_frame, write_eligible_metadata, write_frame,
    write_normalized_metadata,
};
use crate::eligibility::EligibilitySelector;
use crate::extractor::{ExtractOutcome, Extractor};
use crate::models::PipelineConfig;
use crate::normalizer::normalize_metadata;
use crate::run_detector::RunDetector;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// File layout of one pipeline run inside `data_dir`.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub archive: PathBuf,
    pub extracted_dir: PathBuf,
    pub raw_metadata: PathBuf,
    pub normalized_metadata: PathBuf,
    pub eligible_metadata: PathBuf,
    pub merged_readings: PathBuf,
    pub window_readings: PathBuf,
    pub features: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: &Path, file_name: &str) -> Self {
        let extracted_name = file_name.split('.').next().unwrap_or(file_name);
        Self {
            archive: data_dir.join(file_name),
            extracted_dir: data_dir.join(extracted_name),
            raw_metadata: data_dir.join("metadata.csv"),
            normalized_metadata: data_dir.join("metadata_normalized.csv"),
            eligible_metadata: data_dir.join("metadata_eligible.csv"),
            merged_readings: data_dir.join("household_kwh.csv"),
            window_readings: data_dir.join("post_cutoff_household_kwh.csv"),
            features: data_dir.join("households_features.csv"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanReport {
    pub eligible_households: usize,
    pub example_household: Option<String>,
    pub excluded_households: usize,
    pub merge: MergeSummary,
    pub feature_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CleanOutcome {
    Completed(CleanReport),
    /// The archive did not contain a tar; nothing past extraction ran.
    ExtractionFailed { archive: PathBuf },
}

/// Extracts the archive when needed, then runs every cleaning stage and
/// writes the intermediate and final tables into `data_dir`.
pub fn clean(data_dir: &Path, file_name: &str, config: &PipelineConfig) -> Result<CleanOutcome> {
    config.validate()?;
    let paths = DataPaths::new(data_dir, file_name);

    if paths.extracted_dir.exists() {
        debug!("{} already extracted, skipping", paths.extracted_dir.display());
    } else {
        let outcome = Extractor::new(&paths.archive, data_dir)?.extract()?;
        if outcome == ExtractOutcome::NotAnArchive {
            return Ok(CleanOutcome::ExtractionFailed { archive: paths.archive });
        }
    }

    let raw = load_raw_metadata(&paths.raw_metadata)?;
    let normalized = normalize_metadata(&raw);
    write_normalized_metadata(&paths.normalized_metadata, &normalized)?;

    let eligibility = EligibilitySelector::new(config.clone()).select(&normalized);
    write_eligible_metadata(&paths.eligible_metadata, &eligibility.metadata)?;
    let example_household = eligibility.ids.first().cloned();
    info!("Eligible households={}", eligibility.ids.len());
    if let Some(id) = &example_household {
        info!("Example household id: {}", id);
    }

    let household_files: Vec<PathBuf> = eligibility
        .ids
        .iter()
        .map(|id| paths.extracted_dir.join(format!("{id}.csv")))
        .collect();
    let merge = CsvMerger::new(household_files, None, paths.merged_readings.clone())
        .with_progress(true)
        .combine_csv_files()
        .context("Merging household readings failed")?;
    if merge.files_skipped > 0 {
        warn!("{} eligible households have no readings file", merge.files_skipped);
    }

    let ids: HashSet<String> = eligibility.ids.iter().cloned().collect();
    let rows = load_readings(&paths.merged_readings, &ids, config)?;
    let mut readings = readings_frame(&rows)?;
    drop(rows);
    write_frame(&paths.window_readings, &mut readings)?;

    let detector = RunDetector::new(config);
    let daily = detector.daily_totals(&readings)?;
    let excluded = detector.exclusion_set(&daily);
    let low = detector.low_reading_counts(&readings)?;
    let households_with_low = low
        .column("low_readings")?
        .i64()?
        .into_iter()
        .filter(|count| count.unwrap_or(0) > 0)
        .count();
    debug!("{} households have single readings below {}", households_with_low, config.zero_epsilon / 10.0);

    let mut features = assemble_features(&readings, &excluded, &eligibility.metadata)?;
    write_frame(&paths.features, &mut features)?;

    Ok(CleanOutcome::Completed(CleanReport {
        eligible_households: eligibility.ids.len(),
        example_household,
        excluded_households: excluded.len(),
        merge,
        feature_rows: features.height(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_follow_archive_name() {
        let paths = DataPaths::new(Path::new("data"), "imputed_goiener_v7.tar.zst");
        assert_eq!(paths.archive, Path::new("data/imputed_goiener_v7.tar.zst"));
        assert_eq!(paths.extracted_dir, Path::new("data/imputed_goiener_v7"));
        assert_eq!(paths.raw_metadata, Path::new("data/metadata.csv"));
    }

    #[test]
    fn test_invalid_config_is_rejected_before_any_io() {
        let config = PipelineConfig {
            min_run_length: 0,
            ..Default::default()
        };
        assert!(clean(Path::new("/nonexistent"), "x.tar.zst", &config).is_err());
    }
}

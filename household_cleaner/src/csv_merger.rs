use anyhow::{Context, Result};
use glob::glob;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeSummary {
    pub files_merged: usize,
    pub files_skipped: usize,
    pub rows_written: usize,
    /// Files whose header or row widths disagree with the first file's header.
    pub schema_mismatches: Vec<PathBuf>,
}

/// Concatenates per-household CSV files into one table, tagging every row
/// with the household id taken from its file stem.
pub struct CsvMerger {
    files: Vec<PathBuf>,
    source_dir: Option<PathBuf>,
    output_file: PathBuf,
    show_progress: bool,
}

impl CsvMerger {
    pub fn new(files: Vec<PathBuf>, source_dir: Option<PathBuf>, output_file: PathBuf) -> Self {
        Self {
            files,
            source_dir,
            output_file,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn combine_csv_files(&self) -> Result<MergeSummary> {
        let inputs = self.input_files()?;
        let out = File::create(&self.output_file)
            .with_context(|| format!("Failed to create {}", self.output_file.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(BufWriter::new(out));

        let pb = if self.show_progress {
            let pb = ProgressBar::new(inputs.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut summary = MergeSummary::default();
        let mut header: Option<csv::StringRecord> = None;

        for path in &inputs {
            pb.inc(1);
            if !path.is_file() {
                debug!("Skipping missing input {}", path.display());
                summary.files_skipped += 1;
                continue;
            }

            let id = household_id(path);
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_path(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let mut records = reader.records();

            let file_header = match records.next() {
                Some(record) => record.with_context(|| format!("Failed to read header of {}", path.display()))?,
                None => csv::StringRecord::new(),
            };

            let expected = match &header {
                None => {
                    let mut with_id = file_header.clone();
                    with_id.push_field("id");
                    writer.write_record(&with_id)?;
                    header = Some(file_header.clone());
                    file_header
                }
                Some(first) => {
                    if *first != file_header {
                        warn!(
                            "Header of {} differs from the first merged file ({} vs {} columns)",
                            path.display(),
                            file_header.len(),
                            first.len()
                        );
                        summary.schema_mismatches.push(path.clone());
                    }
                    first.clone()
                }
            };

            let mut width_mismatch = false;
            for record in records {
                let mut record = record.with_context(|| format!("Failed to read row of {}", path.display()))?;
                if record.len() != expected.len() {
                    width_mismatch = true;
                }
                record.push_field(&id);
                writer.write_record(&record)?;
                summary.rows_written += 1;
            }

            if width_mismatch && summary.schema_mismatches.last() != Some(path) {
                warn!("Rows of {} do not match the merged header width", path.display());
                summary.schema_mismatches.push(path.clone());
            }
            summary.files_merged += 1;
        }

        writer.flush()?;
        pb.finish_and_clear();

        info!(
            "Merged {} files ({} skipped, {} rows) into {}",
            summary.files_merged,
            summary.files_skipped,
            summary.rows_written,
            self.output_file.display()
        );
        if !summary.schema_mismatches.is_empty() {
            warn!("{} merged files disagree with the first file's layout", summary.schema_mismatches.len());
        }
        Ok(summary)
    }

    fn input_files(&self) -> Result<Vec<PathBuf>> {
        if !self.files.is_empty() {
            return Ok(self.files.clone());
        }
        let Some(dir) = &self.source_dir else {
            return Ok(Vec::new());
        };
        let pattern = dir.join("*.csv");
        let pattern = pattern
            .to_str()
            .with_context(|| format!("Non UTF-8 source directory {}", dir.display()))?;
        Ok(glob(pattern)?.filter_map(Result::ok).collect())
    }
}

/// Household id for a per-household file: its base name without extension.
pub fn household_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub mod assembler;
pub mod csv_merger;
pub mod data_loader;
pub mod eligibility;
pub mod error;
pub mod extractor;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod run_detector;

pub use assembler::assemble_features;
pub use csv_merger::{CsvMerger, MergeSummary};
pub use eligibility::{EligibilityResult, EligibilitySelector};
pub use error::ExtractError;
pub use extractor::{ExtractOutcome, Extractor};
pub use models::{DailyTotal, EligibleMetadata, MetadataRecord, PipelineConfig, ReadingRow, ZeroRun};
pub use pipeline::{clean, CleanOutcome, CleanReport, DataPaths};
pub use run_detector::RunDetector;

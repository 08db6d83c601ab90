use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Number of contracted power tiers carried by a metadata row (`p1_kw` .. `p6_kw`).
pub const TIER_COUNT: usize = 6;

/// Far-future upper bound for metadata end dates.
pub fn metadata_window_end() -> NaiveDate {
    NaiveDate::from_ymd_opt(3020, 3, 1).unwrap_or(NaiveDate::MAX)
}

/// Exclusive far-future upper bound for reading timestamps.
pub fn readings_window_end() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(3023, 1, 1)
        .unwrap_or(NaiveDate::MAX)
        .and_hms_opt(0, 0, 0)
        .unwrap_or(NaiveDateTime::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Start of the analysis window (go-live date).
    pub cutoff_date: NaiveDate,
    /// Category codes must compare strictly greater than this.
    pub category_lower_bound: String,
    /// Category codes must compare strictly less than this.
    pub category_upper_bound: String,
    /// A day whose summed consumption is below this is a zero day.
    pub zero_epsilon: f64,
    /// Households with a zero-day run at least this long are excluded.
    pub min_run_length: usize,
    /// Minimum days between the reference date and the end date.
    pub min_coverage_days: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cutoff_date: NaiveDate::from_ymd_opt(2021, 6, 1).unwrap_or_default(),
            category_lower_bound: "9699".to_string(),
            category_upper_bound: "9900".to_string(),
            zero_epsilon: 0.01,
            min_run_length: 2,
            min_coverage_days: 365,
        }
    }
}

impl PipelineConfig {
    /// Loads a JSON config; keys left out keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_run_length == 0 {
            bail!("min_run_length must be at least 1");
        }
        if !self.zero_epsilon.is_finite() || self.zero_epsilon < 0.0 {
            bail!("zero_epsilon must be a finite non-negative number, got {}", self.zero_epsilon);
        }
        if self.category_lower_bound >= self.category_upper_bound {
            bail!(
                "category bounds are empty: '{}' >= '{}'",
                self.category_lower_bound,
                self.category_upper_bound
            );
        }
        Ok(())
    }

    pub fn cutoff_datetime(&self) -> NaiveDateTime {
        self.cutoff_date.and_hms_opt(0, 0, 0).unwrap_or_default()
    }
}

/// Metadata row as it appears in the raw file, every cell still text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMetadata {
    pub cups: Option<String>,
    pub fecha_alta: Option<String>,
    pub fecha_baja: Option<String>,
    pub cnae: Option<String>,
    pub codigo_postal: Option<String>,
    pub tiers: [Option<String>; TIER_COUNT],
    pub tarifa_atr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetadataRecord {
    pub id: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub category_code: Option<String>,
    pub postal_code: Option<String>,
    pub p1_kw: Option<f64>,
    pub p2_kw: Option<f64>,
    pub p3_kw: Option<f64>,
    pub p4_kw: Option<f64>,
    pub p5_kw: Option<f64>,
    pub p6_kw: Option<f64>,
    pub tariff: Option<String>,
}

impl MetadataRecord {
    pub fn tiers(&self) -> [Option<f64>; TIER_COUNT] {
        [self.p1_kw, self.p2_kw, self.p3_kw, self.p4_kw, self.p5_kw, self.p6_kw]
    }

    pub fn set_tiers(&mut self, tiers: [Option<f64>; TIER_COUNT]) {
        [self.p1_kw, self.p2_kw, self.p3_kw, self.p4_kw, self.p5_kw, self.p6_kw] = tiers;
    }
}

/// A metadata row that passed eligibility selection, with its coverage.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibleMetadata {
    pub record: MetadataRecord,
    pub days_from_ref_to_end: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadingRow {
    pub id: String,
    pub timestamp: NaiveDateTime,
    pub kwh: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyTotal {
    pub id: String,
    pub date: NaiveDate,
    pub kwh_day: f64,
    pub zero_day: bool,
}

/// Maximal stretch of calendar-consecutive zero days for one household.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZeroRun {
    pub id: String,
    pub run_id: u32,
    pub start: NaiveDate,
    pub length: usize,
}

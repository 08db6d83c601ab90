use crate::models::{metadata_window_end, EligibleMetadata, MetadataRecord, PipelineConfig};
use chrono::NaiveDate;
use log::info;
use ordered_float::OrderedFloat;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct EligibilityResult {
    /// Sorted, distinct household ids.
    pub ids: Vec<String>,
    /// Exactly one row per id, ordered by id.
    pub metadata: Vec<EligibleMetadata>,
}

/// Every metadata column except the date helpers.
type GroupKey = (
    String,
    Option<String>,
    Option<String>,
    [Option<OrderedFloat<f64>>; 6],
    Option<String>,
);

fn group_key(record: &MetadataRecord) -> GroupKey {
    (
        record.id.clone(),
        record.category_code.clone(),
        record.postal_code.clone(),
        record.tiers().map(|t| t.map(OrderedFloat)),
        record.tariff.clone(),
    )
}

pub struct EligibilitySelector {
    config: PipelineConfig,
}

impl EligibilitySelector {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// End date strictly after the cutoff, up to the far-future sentinel.
    pub fn in_window(&self, record: &MetadataRecord) -> bool {
        record
            .end_date
            .map(|end| end > self.config.cutoff_date && end <= metadata_window_end())
            .unwrap_or(false)
    }

    /// Lexicographic range check on the normalized code, both bounds exclusive.
    pub fn in_category_band(&self, record: &MetadataRecord) -> bool {
        record
            .category_code
            .as_deref()
            .map(|code| {
                code > self.config.category_lower_bound.as_str()
                    && code < self.config.category_upper_bound.as_str()
            })
            .unwrap_or(false)
    }

    /// Clamps the start date to the cutoff and returns the days from the
    /// reference date to the end date. A missing start date counts as the cutoff.
    pub fn coverage(&self, record: &MetadataRecord) -> Option<(MetadataRecord, i64)> {
        let cutoff = self.config.cutoff_date;
        let end = record.end_date?;
        let start = record.start_date.map(|s| s.max(cutoff));
        let reference: NaiveDate = start.unwrap_or(cutoff).max(cutoff);

        let mut clamped = record.clone();
        clamped.start_date = start;
        Some((clamped, (end - reference).num_days()))
    }

    pub fn select(&self, records: &[MetadataRecord]) -> EligibilityResult {
        let covered: Vec<(MetadataRecord, i64)> = records
            .iter()
            .filter(|r| self.in_window(r))
            .filter(|r| self.in_category_band(r))
            .filter_map(|r| self.coverage(r))
            .filter(|(_, days)| *days >= self.config.min_coverage_days)
            .collect();

        let per_group = best_per_group(covered);
        let metadata = best_per_id(per_group);
        let ids: Vec<String> = metadata.iter().map(|m| m.record.id.clone()).collect();

        info!(
            "Eligible households: {} of {} metadata rows (cutoff {}, category band ({}, {}), >= {} days)",
            ids.len(),
            records.len(),
            self.config.cutoff_date,
            self.config.category_lower_bound,
            self.config.category_upper_bound,
            self.config.min_coverage_days
        );

        EligibilityResult { ids, metadata }
    }
}

/// Keeps the row with maximum coverage within each group. After a stable sort
/// ascending by (key, coverage) the last row of a group wins, so ties resolve
/// to the row that came last in input order.
fn best_per_group(mut rows: Vec<(MetadataRecord, i64)>) -> Vec<EligibleMetadata> {
    rows.sort_by_cached_key(|(record, days)| (group_key(record), *days));

    let mut best: BTreeMap<GroupKey, EligibleMetadata> = BTreeMap::new();
    for (record, days) in rows {
        best.insert(
            group_key(&record),
            EligibleMetadata {
                record,
                days_from_ref_to_end: days,
            },
        );
    }
    best.into_values().collect()
}

/// Second pass: one row per id, maximum coverage, same last-wins tie-break.
fn best_per_id(mut rows: Vec<EligibleMetadata>) -> Vec<EligibleMetadata> {
    rows.sort_by(|a, b| {
        a.record
            .id
            .cmp(&b.record.id)
            .then(a.days_from_ref_to_end.cmp(&b.days_from_ref_to_end))
    });

    let mut best: BTreeMap<String, EligibleMetadata> = BTreeMap::new();
    for row in rows {
        best.insert(row.record.id.clone(), row);
    }
    best.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, d)
    }

    fn record(id: &str, start: Option<NaiveDate>, end: Option<NaiveDate>, cnae: &str) -> MetadataRecord {
        MetadataRecord {
            id: id.to_string(),
            start_date: start,
            end_date: end,
            category_code: Some(cnae.to_string()),
            postal_code: Some("20001".to_string()),
            p1_kw: Some(4.6),
            tariff: Some("2.0TD".to_string()),
            ..Default::default()
        }
    }

    fn selector() -> EligibilitySelector {
        EligibilitySelector::new(PipelineConfig::default())
    }

    #[test]
    fn test_category_band_is_lexicographic_and_exclusive() {
        let s = selector();
        let cutoff = date(2021, 6, 1);
        assert!(s.in_category_band(&record("a", cutoff, cutoff, "9820")));
        assert!(!s.in_category_band(&record("a", cutoff, cutoff, "9699")));
        assert!(!s.in_category_band(&record("a", cutoff, cutoff, "9900")));
        // "97" sorts between the bounds even though it is numerically tiny.
        assert!(s.in_category_band(&record("a", cutoff, cutoff, "97")));
        assert!(!s.in_category_band(&record("a", cutoff, cutoff, "10000")));
    }

    #[test]
    fn test_window_requires_end_after_cutoff() {
        let s = selector();
        assert!(!s.in_window(&record("a", None, date(2021, 6, 1), "9820")));
        assert!(s.in_window(&record("a", None, date(2021, 6, 2), "9820")));
        assert!(!s.in_window(&record("a", None, None, "9820")));
    }

    #[test]
    fn test_coverage_clamps_start_to_cutoff() {
        let s = selector();
        let (clamped, days) = s
            .coverage(&record("a", date(2019, 1, 1), date(2022, 6, 1), "9820"))
            .unwrap();
        assert_eq!(clamped.start_date, date(2021, 6, 1));
        assert_eq!(days, 365);

        let (_, days) = s
            .coverage(&record("a", date(2021, 7, 1), date(2022, 6, 1), "9820"))
            .unwrap();
        assert_eq!(days, 335);

        let (clamped, days) = s.coverage(&record("a", None, date(2022, 6, 1), "9820")).unwrap();
        assert_eq!(clamped.start_date, None);
        assert_eq!(days, 365);
    }

    #[test]
    fn test_keeps_row_with_most_coverage() {
        // Same household, two tariffs: 400 vs 500 days after the cutoff.
        let mut short = record("H1", date(2021, 6, 1), date(2022, 7, 6), "9820");
        short.tariff = Some("3.0TD".to_string());
        let long = record("H1", date(2021, 6, 1), date(2022, 10, 14), "9820");

        let result = selector().select(&[long.clone(), short]);
        assert_eq!(result.ids, vec!["H1"]);
        assert_eq!(result.metadata.len(), 1);
        assert_eq!(result.metadata[0].days_from_ref_to_end, 500);
        assert_eq!(result.metadata[0].record.tariff, long.tariff);
    }

    #[test]
    fn test_tie_break_is_stable() {
        let mut a = record("H1", date(2021, 6, 1), date(2022, 10, 14), "9820");
        a.postal_code = Some("11111".to_string());
        let mut b = a.clone();
        b.postal_code = Some("22222".to_string());
        let input = vec![b, a];

        let first = selector().select(&input);
        let second = selector().select(&input);
        assert_eq!(first.metadata, second.metadata);
        assert_eq!(first.metadata.len(), 1);
        // Groups sort by key; the later group in that order wins the tie.
        assert_eq!(first.metadata[0].record.postal_code.as_deref(), Some("22222"));
    }

    #[test]
    fn test_filters_short_coverage_and_foreign_categories() {
        let rows = vec![
            record("ok", date(2020, 1, 1), date(2023, 1, 1), "9820"),
            record("short", date(2020, 1, 1), date(2022, 1, 1), "9820"),
            record("shop", date(2020, 1, 1), date(2023, 1, 1), "4711"),
        ];
        let result = selector().select(&rows);
        assert_eq!(result.ids, vec!["ok"]);
    }
}

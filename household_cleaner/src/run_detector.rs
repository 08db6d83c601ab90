use crate::models::{DailyTotal, PipelineConfig, ZeroRun};
use anyhow::Result;
use chrono::NaiveDate;
use log::{debug, info};
use polars::prelude::*;
use std::collections::BTreeSet;

/// Finds households whose daily consumption drops to (near) zero for several
/// consecutive days.
pub struct RunDetector {
    zero_epsilon: f64,
    min_run_length: usize,
}

impl RunDetector {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            zero_epsilon: config.zero_epsilon,
            min_run_length: config.min_run_length,
        }
    }

    /// Sums readings per `(id, calendar day)` and flags zero days.
    /// The result is sorted by `(id, date)`.
    pub fn daily_totals(&self, readings: &DataFrame) -> Result<Vec<DailyTotal>> {
        let daily = readings
            .clone()
            .lazy()
            .with_column(col("timestamp").dt().date().alias("date"))
            .group_by([col("id"), col("date")])
            .agg([col("kWh").sum().alias("kwh_day")])
            .with_column(col("kwh_day").lt(lit(self.zero_epsilon)).alias("zero_day"))
            .sort(["id", "date"], SortMultipleOptions::default())
            .collect()?;

        let ids = daily.column("id")?.str()?;
        let dates: Vec<Option<NaiveDate>> = daily.column("date")?.date()?.as_date_iter().collect();
        let totals = daily.column("kwh_day")?.f64()?;
        let zero = daily.column("zero_day")?.bool()?;

        let mut out = Vec::with_capacity(daily.height());
        for idx in 0..daily.height() {
            if let (Some(id), Some(date), Some(kwh_day)) = (ids.get(idx), dates[idx], totals.get(idx)) {
                out.push(DailyTotal {
                    id: id.to_string(),
                    date,
                    kwh_day,
                    zero_day: zero.get(idx).unwrap_or(false),
                });
            }
        }

        info!(
            "Aggregated {} readings into {} household-days ({} zero days)",
            readings.height(),
            out.len(),
            out.iter().filter(|d| d.zero_day).count()
        );
        Ok(out)
    }

    /// Splits each household's zero days into runs of calendar-consecutive
    /// dates. Zero days are sorted by `(id, date)` here, so input order does not
    /// matter. A zero day opens a new run when it is the household's first, or
    /// when the previous zero day is not exactly one day earlier.
    pub fn detect_runs(&self, daily: &[DailyTotal]) -> Vec<ZeroRun> {
        let mut zero_days: Vec<&DailyTotal> = daily.iter().filter(|d| d.zero_day).collect();
        zero_days.sort_by(|a, b| a.id.cmp(&b.id).then(a.date.cmp(&b.date)));

        let mut runs: Vec<ZeroRun> = Vec::new();
        let mut previous: Option<&DailyTotal> = None;

        for day in zero_days {
            let continues = previous
                .filter(|p| p.id == day.id)
                .map(|p| (day.date - p.date).num_days() == 1)
                .unwrap_or(false);

            if continues {
                if let Some(run) = runs.last_mut() {
                    run.length += 1;
                }
            } else {
                let run_id = match previous {
                    Some(p) if p.id == day.id => runs.last().map(|r| r.run_id + 1).unwrap_or(1),
                    _ => 1,
                };
                runs.push(ZeroRun {
                    id: day.id.clone(),
                    run_id,
                    start: day.date,
                    length: 1,
                });
            }
            previous = Some(day);
        }
        runs
    }

    /// Households with at least one zero run of `min_run_length` days or more.
    pub fn exclusion_set(&self, daily: &[DailyTotal]) -> BTreeSet<String> {
        let runs = self.detect_runs(daily);
        let excluded: BTreeSet<String> = runs
            .iter()
            .filter(|r| r.length >= self.min_run_length)
            .map(|r| r.id.clone())
            .collect();

        debug!("Detected {} zero-day runs", runs.len());
        info!(
            "Excluding {} households with runs of >= {} zero days",
            excluded.len(),
            self.min_run_length
        );
        excluded
    }

    /// Per household, the number of single readings below a tenth of the
    /// zero-day epsilon.
    pub fn low_reading_counts(&self, readings: &DataFrame) -> Result<DataFrame> {
        let threshold = self.zero_epsilon / 10.0;
        let counts = readings
            .clone()
            .lazy()
            .group_by([col("id")])
            .agg([col("kWh")
                .lt(lit(threshold))
                .cast(DataType::Int64)
                .sum()
                .alias("low_readings")])
            .sort(["id"], SortMultipleOptions::default())
            .collect()?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_loader::readings_frame;
    use crate::models::ReadingRow;
    use chrono::NaiveDate;

    fn zero_day(id: &str, y: i32, m: u32, d: u32) -> DailyTotal {
        DailyTotal {
            id: id.to_string(),
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            kwh_day: 0.0,
            zero_day: true,
        }
    }

    fn busy_day(id: &str, y: i32, m: u32, d: u32) -> DailyTotal {
        DailyTotal {
            kwh_day: 7.5,
            zero_day: false,
            ..zero_day(id, y, m, d)
        }
    }

    fn detector() -> RunDetector {
        RunDetector::new(&PipelineConfig::default())
    }

    #[test]
    fn test_consecutive_zero_days_form_a_run() {
        let daily = vec![
            zero_day("H1", 2021, 6, 1),
            zero_day("H1", 2021, 6, 2),
            busy_day("H1", 2021, 6, 3),
            busy_day("H1", 2021, 6, 4),
            zero_day("H1", 2021, 6, 5),
        ];

        let runs = detector().detect_runs(&daily);
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[0].run_id, runs[0].length), (1, 2));
        assert_eq!((runs[1].run_id, runs[1].length), (2, 1));
        assert_eq!(runs[1].start, NaiveDate::from_ymd_opt(2021, 6, 5).unwrap());

        let excluded = detector().exclusion_set(&daily);
        assert!(excluded.contains("H1"));
    }

    #[test]
    fn test_gap_of_two_days_breaks_run() {
        let daily = vec![zero_day("H2", 2021, 6, 1), zero_day("H2", 2021, 6, 3)];

        let runs = detector().detect_runs(&daily);
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.length == 1));
        assert!(detector().exclusion_set(&daily).is_empty());
    }

    #[test]
    fn test_unsorted_input_is_sorted_before_run_assignment() {
        let daily = vec![
            zero_day("H1", 2021, 6, 2),
            zero_day("H2", 2021, 6, 1),
            zero_day("H1", 2021, 6, 1),
        ];
        let runs = detector().detect_runs(&daily);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, "H1");
        assert_eq!(runs[0].length, 2);
        assert_eq!(runs[1].id, "H2");
        assert_eq!(runs[1].run_id, 1);
    }

    #[test]
    fn test_runs_do_not_cross_households() {
        let daily = vec![zero_day("H1", 2021, 6, 1), zero_day("H2", 2021, 6, 2)];
        assert!(detector().exclusion_set(&daily).is_empty());
    }

    #[test]
    fn test_threshold_is_configurable() {
        let config = PipelineConfig {
            min_run_length: 3,
            ..Default::default()
        };
        let daily = vec![zero_day("H1", 2021, 6, 1), zero_day("H1", 2021, 6, 2)];
        assert!(RunDetector::new(&config).exclusion_set(&daily).is_empty());
    }

    #[test]
    fn test_daily_totals_from_hourly_readings() {
        let at = |d: u32, h: u32| NaiveDate::from_ymd_opt(2021, 6, d).unwrap().and_hms_opt(h, 0, 0).unwrap();
        let rows = vec![
            ReadingRow { id: "H1".into(), timestamp: at(2, 0), kwh: Some(0.004) },
            ReadingRow { id: "H1".into(), timestamp: at(1, 5), kwh: Some(1.0) },
            ReadingRow { id: "H1".into(), timestamp: at(1, 6), kwh: None },
            ReadingRow { id: "H1".into(), timestamp: at(2, 1), kwh: Some(0.004) },
            ReadingRow { id: "H0".into(), timestamp: at(3, 0), kwh: Some(0.0) },
        ];
        let frame = readings_frame(&rows).unwrap();

        let daily = detector().daily_totals(&frame).unwrap();
        let summary: Vec<(&str, u32, bool)> = daily
            .iter()
            .map(|d| (d.id.as_str(), chrono::Datelike::day(&d.date), d.zero_day))
            .collect();
        assert_eq!(summary, vec![("H0", 3, true), ("H1", 1, false), ("H1", 2, true)]);
        assert!((daily[1].kwh_day - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_low_reading_counts() {
        let at = |h: u32| NaiveDate::from_ymd_opt(2021, 6, 1).unwrap().and_hms_opt(h, 0, 0).unwrap();
        let rows = vec![
            ReadingRow { id: "H1".into(), timestamp: at(0), kwh: Some(0.0) },
            ReadingRow { id: "H1".into(), timestamp: at(1), kwh: Some(0.5) },
            ReadingRow { id: "H2".into(), timestamp: at(0), kwh: Some(0.2) },
        ];
        let counts = detector().low_reading_counts(&readings_frame(&rows).unwrap()).unwrap();
        let values: Vec<Option<i64>> = counts.column("low_readings").unwrap().i64().unwrap().into_iter().collect();
        assert_eq!(values, vec![Some(1), Some(0)]);
    }
}

use chrono::{Duration, NaiveDate};
use household_cleaner::{clean, CleanOutcome, PipelineConfig};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const METADATA: &str = "\
cups,fecha_alta,fecha_baja,cnae,codigo_postal,p1_kw,p2_kw,p3_kw,p4_kw,p5_kw,p6_kw,tarifa_atr
H_A,01/01/2020,2023-01-01,9820,20001,4.6,4.6,NA,NA,NA,NA,2.0TD
H_B,2020-05-01,31/12/2022,9820,20002,3.3,NA,NA,NA,NA,NA,2.0TD
H_C,2020-05-01,2023-01-01,4711,20003,10,NA,NA,NA,NA,NA,3.0TD
";

/// Four days of hourly readings starting at the default cutoff; the listed
/// days (0-based) read zero all day.
fn household_csv(zero_days: &[i64]) -> String {
    let start = NaiveDate::from_ymd_opt(2021, 6, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
    let mut out = String::from("index,kWh,imp\n");
    for hour in 0..(4 * 24) {
        let ts = start + Duration::hours(hour);
        let kwh = if zero_days.contains(&(hour / 24)) { 0.0 } else { 0.5 };
        out.push_str(&format!("{}+00:00,{},0\n", ts.format("%Y-%m-%d %H:%M:%S"), kwh));
    }
    out
}

fn write_archive(path: &Path, files: &[(&str, String)]) {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
    }
    let tar_bytes = builder.into_inner().unwrap();
    fs::write(path, zstd::stream::encode_all(&tar_bytes[..], 0).unwrap()).unwrap();
}

fn feature_ids(path: &Path) -> Vec<String> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let id_col = reader.headers().unwrap().iter().position(|h| h == "id").unwrap();
    reader
        .records()
        .map(|r| r.unwrap().get(id_col).unwrap().to_string())
        .collect()
}

#[test]
fn test_end_to_end_keeps_only_clean_eligible_household() {
    let tmp = TempDir::new().unwrap();
    let data = tmp.path();
    fs::write(data.join("metadata.csv"), METADATA).unwrap();
    write_archive(
        &data.join("goiener.tar.zst"),
        &[
            ("goiener/H_A.csv", household_csv(&[3])),
            ("goiener/H_B.csv", household_csv(&[1, 2])),
            ("goiener/H_C.csv", household_csv(&[])),
        ],
    );

    let outcome = clean(data, "goiener.tar.zst", &PipelineConfig::default()).unwrap();
    let CleanOutcome::Completed(report) = outcome else {
        panic!("extraction unexpectedly failed");
    };

    assert_eq!(report.eligible_households, 2);
    assert_eq!(report.example_household.as_deref(), Some("H_A"));
    assert_eq!(report.excluded_households, 1);
    assert_eq!(report.merge.files_merged, 2);
    assert_eq!(report.feature_rows, 4 * 24);

    for name in [
        "metadata_normalized.csv",
        "metadata_eligible.csv",
        "household_kwh.csv",
        "post_cutoff_household_kwh.csv",
        "households_features.csv",
    ] {
        assert!(data.join(name).is_file(), "{name} was not written");
    }
    assert!(!data.join("goiener.tar").exists());

    let ids = feature_ids(&data.join("households_features.csv"));
    assert_eq!(ids.len(), 4 * 24);
    assert!(ids.iter().all(|id| id == "H_A"));

    let features = fs::read_to_string(data.join("households_features.csv")).unwrap();
    assert_eq!(
        features.lines().next(),
        Some("id,timestamp,kWh,start_date,end_date,category_code,postal_code,p1_kw,tariff")
    );
}

#[test]
fn test_existing_extraction_is_reused() {
    let tmp = TempDir::new().unwrap();
    let data = tmp.path();
    fs::write(data.join("metadata.csv"), METADATA).unwrap();
    fs::create_dir(data.join("goiener")).unwrap();
    fs::write(data.join("goiener/H_A.csv"), household_csv(&[])).unwrap();

    // No archive on disk: extraction must not be attempted.
    let outcome = clean(data, "goiener.tar.zst", &PipelineConfig::default()).unwrap();
    let CleanOutcome::Completed(report) = outcome else {
        panic!("extraction should have been skipped");
    };
    assert_eq!(report.merge.files_merged, 1);
    assert_eq!(report.merge.files_skipped, 1);
    assert_eq!(report.excluded_households, 0);
}

#[test]
fn test_invalid_archive_halts_before_merge() {
    let tmp = TempDir::new().unwrap();
    let data = tmp.path();
    fs::write(data.join("metadata.csv"), METADATA).unwrap();
    fs::write(
        data.join("goiener.tar.zst"),
        zstd::stream::encode_all(&b"not a tar"[..], 0).unwrap(),
    )
    .unwrap();

    let outcome = clean(data, "goiener.tar.zst", &PipelineConfig::default()).unwrap();

    assert!(matches!(outcome, CleanOutcome::ExtractionFailed { .. }));
    assert!(!data.join("household_kwh.csv").exists());
    assert!(!data.join("goiener.tar").exists());
}

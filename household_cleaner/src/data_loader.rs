use crate::models::{
    readings_window_end, EligibleMetadata, MetadataRecord, PipelineConfig, RawMetadata, ReadingRow, TIER_COUNT,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use log::{info, warn};
use polars::prelude::*;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

const READ_BATCH: usize = 200_000;
const TIER_COLUMNS: [&str; TIER_COUNT] = ["p1_kw", "p2_kw", "p3_kw", "p4_kw", "p5_kw", "p6_kw"];

pub const FEATURE_COLUMNS: [&str; 9] = [
    "id",
    "timestamp",
    "kWh",
    "start_date",
    "end_date",
    "category_code",
    "postal_code",
    "p1_kw",
    "tariff",
];

/// Reads the raw metadata file with every column as text so nothing is
/// inferred before normalization.
pub fn load_raw_metadata(path: &Path) -> Result<Vec<RawMetadata>> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()
        .with_context(|| format!("Failed to read metadata {}", path.display()))?;

    let text_column = |name: &str| -> Result<Vec<Option<String>>> {
        let column = df
            .column(name)
            .map_err(|_| anyhow!("Metadata {} has no '{}' column", path.display(), name))?;
        Ok(column
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect())
    };

    let cups = text_column("cups")?;
    let fecha_alta = text_column("fecha_alta")?;
    let fecha_baja = text_column("fecha_baja")?;
    let cnae = text_column("cnae")?;
    let codigo_postal = text_column("codigo_postal")?;
    let tarifa_atr = text_column("tarifa_atr")?;
    let tiers = TIER_COLUMNS
        .iter()
        .map(|name| text_column(*name))
        .collect::<Result<Vec<_>>>()?;

    let rows = (0..df.height())
        .map(|idx| RawMetadata {
            cups: cups[idx].clone(),
            fecha_alta: fecha_alta[idx].clone(),
            fecha_baja: fecha_baja[idx].clone(),
            cnae: cnae[idx].clone(),
            codigo_postal: codigo_postal[idx].clone(),
            tiers: std::array::from_fn(|t| tiers[t][idx].clone()),
            tarifa_atr: tarifa_atr[idx].clone(),
        })
        .collect::<Vec<_>>();

    info!("Loaded {} raw metadata rows from {}", rows.len(), path.display());
    Ok(rows)
}

pub fn write_normalized_metadata(path: &Path, records: &[MetadataRecord]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));
    for record in records {
        writer.serialize(record)?;
    }
    if records.is_empty() {
        writer.write_record(metadata_header())?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_eligible_metadata(path: &Path, rows: &[EligibleMetadata]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));

    let mut header = metadata_header();
    header.push("days_from_ref_to_end");
    writer.write_record(&header)?;

    for row in rows {
        let r = &row.record;
        let mut fields = vec![
            r.id.clone(),
            format_opt(r.start_date),
            format_opt(r.end_date),
            r.category_code.clone().unwrap_or_default(),
            r.postal_code.clone().unwrap_or_default(),
        ];
        fields.extend(r.tiers().iter().map(|t| format_opt(*t)));
        fields.push(r.tariff.clone().unwrap_or_default());
        fields.push(row.days_from_ref_to_end.to_string());
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    Ok(())
}

fn metadata_header() -> Vec<&'static str> {
    let mut header = vec!["id", "start_date", "end_date", "category_code", "postal_code"];
    header.extend(TIER_COLUMNS);
    header.push("tariff");
    header
}

fn format_opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Parses the timestamps found in the per-household files. An explicit UTC
/// offset is dropped and the wall-clock time kept.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    for format in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(parsed) = DateTime::parse_from_str(text, format) {
            return Some(parsed.naive_local());
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.naive_local());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn parse_kwh(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() || text == "NA" {
        return None;
    }
    text.parse::<f64>().ok()
}

#[derive(Debug, Clone, Copy)]
struct ReadingColumns {
    timestamp: usize,
    kwh: usize,
    id: usize,
}

impl ReadingColumns {
    fn from_header(header: &csv::StringRecord) -> Result<Self> {
        let position = |name: &str| header.iter().position(|h| h == name);
        let timestamp = position("index").or_else(|| position("timestamp")).unwrap_or(0);
        let kwh = position("kWh").ok_or_else(|| anyhow!("Reading table has no 'kWh' column"))?;
        let id = position("id").ok_or_else(|| anyhow!("Reading table has no 'id' column"))?;
        Ok(Self { timestamp, kwh, id })
    }
}

/// Loads merged readings for the given households inside the analysis window
/// `[cutoff, 3023-01-01)`, dropping the provenance column.
pub fn load_readings(path: &Path, ids: &HashSet<String>, config: &PipelineConfig) -> Result<Vec<ReadingRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open readings {}", path.display()))?;
    if reader.headers()?.is_empty() {
        info!("{} holds no readings", path.display());
        return Ok(Vec::new());
    }
    let columns = ReadingColumns::from_header(reader.headers()?)?;
    let start = config.cutoff_datetime();
    let end = readings_window_end();

    let mut rows = Vec::new();
    let mut unparsed = 0usize;
    let mut batch = Vec::with_capacity(READ_BATCH);
    let mut records = reader.records();

    loop {
        batch.clear();
        for record in records.by_ref().take(READ_BATCH) {
            batch.push(record.with_context(|| format!("Failed to read {}", path.display()))?);
        }
        if batch.is_empty() {
            break;
        }

        let parsed: Vec<Result<Option<ReadingRow>, ()>> = batch
            .par_iter()
            .map(|record| {
                let id = record.get(columns.id).unwrap_or_default();
                if !ids.contains(id) {
                    return Ok(None);
                }
                let timestamp = record
                    .get(columns.timestamp)
                    .and_then(parse_timestamp)
                    .ok_or(())?;
                if timestamp < start || timestamp >= end {
                    return Ok(None);
                }
                Ok(Some(ReadingRow {
                    id: id.to_string(),
                    timestamp,
                    kwh: record.get(columns.kwh).and_then(parse_kwh),
                }))
            })
            .collect();

        for row in parsed {
            match row {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => {}
                Err(()) => unparsed += 1,
            }
        }
    }

    if unparsed > 0 {
        warn!("Skipped {} readings with unparseable timestamps in {}", unparsed, path.display());
    }
    info!("Loaded {} readings for {} households from {}", rows.len(), ids.len(), path.display());
    Ok(rows)
}

/// Columnar view of readings: `id` (str), `timestamp` (datetime ms), `kWh` (f64).
pub fn readings_frame(rows: &[ReadingRow]) -> Result<DataFrame> {
    let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    let timestamps: Vec<i64> = rows.iter().map(|r| r.timestamp.and_utc().timestamp_millis()).collect();
    let kwh: Vec<Option<f64>> = rows.iter().map(|r| r.kwh).collect();

    let df = df!(
        "id" => ids,
        "timestamp" => timestamps,
        "kWh" => kwh
    )?
    .lazy()
    .with_column(col("timestamp").cast(DataType::Datetime(TimeUnit::Milliseconds, None)))
    .collect()?;
    Ok(df)
}

/// One row per eligible household with typed date columns, ready to join.
pub fn metadata_frame(rows: &[EligibleMetadata]) -> Result<DataFrame> {
    let records: Vec<&MetadataRecord> = rows.iter().map(|r| &r.record).collect();
    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    let categories: Vec<Option<&str>> = records.iter().map(|r| r.category_code.as_deref()).collect();
    let postal_codes: Vec<Option<&str>> = records.iter().map(|r| r.postal_code.as_deref()).collect();
    let p1_kw: Vec<Option<f64>> = records.iter().map(|r| r.p1_kw).collect();
    let tariffs: Vec<Option<&str>> = records.iter().map(|r| r.tariff.as_deref()).collect();
    let coverage: Vec<i64> = rows.iter().map(|r| r.days_from_ref_to_end).collect();

    let mut df = df!(
        "id" => ids,
        "category_code" => categories,
        "postal_code" => postal_codes,
        "p1_kw" => p1_kw,
        "tariff" => tariffs,
        "days_from_ref_to_end" => coverage
    )?;
    df.with_column(
        DateChunked::from_naive_date_options("start_date".into(), records.iter().map(|r| r.start_date))
            .into_series(),
    )?;
    df.with_column(
        DateChunked::from_naive_date_options("end_date".into(), records.iter().map(|r| r.end_date))
            .into_series(),
    )?;

    Ok(df.select([
        "id",
        "start_date",
        "end_date",
        "category_code",
        "postal_code",
        "p1_kw",
        "tariff",
        "days_from_ref_to_end",
    ])?)
}

pub fn write_frame(path: &Path, df: &mut DataFrame) -> Result<()> {
    let mut file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_datetime_format(Some("%Y-%m-%d %H:%M:%S".to_string()))
        .finish(df)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {} rows to {}", df.height(), path.display());
    Ok(())
}

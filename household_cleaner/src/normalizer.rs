use crate::models::{MetadataRecord, RawMetadata};
use chrono::NaiveDate;
use log::{info, warn};
use std::collections::HashSet;

/// Literal the source uses for a missing cell.
pub const NULL_SENTINEL: &str = "NA";

/// Normalizes a raw date cell.
///
/// Text containing `/` is read as `DD/MM/YYYY`, text containing `-` as ISO
/// `YYYY-MM-DD`; anything else, and anything that fails to parse, is null.
pub fn normalize_date(raw: Option<&str>) -> Option<NaiveDate> {
    let text = raw?.trim();
    if text.contains('/') {
        NaiveDate::parse_from_str(text, "%d/%m/%Y").ok()
    } else if text.contains('-') {
        NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
    } else {
        None
    }
}

/// Non-strict float coercion: the null sentinel and unparseable text are null.
pub fn normalize_tier(raw: Option<&str>) -> Option<f64> {
    let text = raw?.trim();
    if text == NULL_SENTINEL {
        return None;
    }
    text.parse::<f64>().ok()
}

pub fn normalize_code(raw: Option<&str>) -> Option<String> {
    let text = raw?.trim();
    if text == NULL_SENTINEL || text.is_empty() {
        return None;
    }
    Some(text.to_string())
}

pub fn normalize_record(raw: &RawMetadata) -> Option<MetadataRecord> {
    let id = normalize_code(raw.cups.as_deref())?;
    let mut record = MetadataRecord {
        id,
        start_date: normalize_date(raw.fecha_alta.as_deref()),
        end_date: normalize_date(raw.fecha_baja.as_deref()),
        category_code: normalize_code(raw.cnae.as_deref()),
        postal_code: normalize_code(raw.codigo_postal.as_deref()),
        tariff: normalize_code(raw.tarifa_atr.as_deref()),
        ..Default::default()
    };
    record.set_tiers(raw.tiers.each_ref().map(|t| normalize_tier(t.as_deref())));
    Some(record)
}

/// Normalizes every raw row, dropping rows without an id and exact duplicates
/// (first occurrence wins, input order kept).
pub fn normalize_metadata(raw: &[RawMetadata]) -> Vec<MetadataRecord> {
    let mut seen = HashSet::new();
    let mut missing_id = 0usize;
    let mut normalized = Vec::with_capacity(raw.len());

    for row in raw {
        let Some(record) = normalize_record(row) else {
            missing_id += 1;
            continue;
        };
        if seen.insert(dedup_key(&record)) {
            normalized.push(record);
        }
    }

    if missing_id > 0 {
        warn!("Dropped {} metadata rows without an id", missing_id);
    }
    info!(
        "Normalized {} metadata rows ({} after removing duplicates)",
        raw.len(),
        normalized.len()
    );
    normalized
}

type DedupKey = (
    String,
    Option<NaiveDate>,
    Option<NaiveDate>,
    Option<String>,
    Option<String>,
    [Option<u64>; 6],
    Option<String>,
);

fn dedup_key(record: &MetadataRecord) -> DedupKey {
    (
        record.id.clone(),
        record.start_date,
        record.end_date,
        record.category_code.clone(),
        record.postal_code.clone(),
        record.tiers().map(|t| t.map(f64::to_bits)),
        record.tariff.clone(),
    )
}

use crate::data_loader::{metadata_frame, FEATURE_COLUMNS};
use crate::models::EligibleMetadata;
use anyhow::Result;
use log::info;
use polars::prelude::*;
use std::collections::BTreeSet;

/// Builds the final feature table: readings of households outside the
/// exclusion set, left-joined with their selected metadata row.
pub fn assemble_features(
    readings: &DataFrame,
    excluded: &BTreeSet<String>,
    metadata: &[EligibleMetadata],
) -> Result<DataFrame> {
    let excluded_ids: Vec<&str> = excluded.iter().map(String::as_str).collect();
    let excluded_df = df!("id" => excluded_ids)?;
    let metadata_df = metadata_frame(metadata)?;

    let features = readings
        .clone()
        .lazy()
        .join(
            excluded_df.lazy(),
            [col("id")],
            [col("id")],
            JoinArgs::new(JoinType::Anti),
        )
        .left_join(metadata_df.lazy(), col("id"), col("id"))
        .select(FEATURE_COLUMNS.iter().map(|name| col(*name)).collect::<Vec<_>>())
        .sort(["id", "timestamp"], SortMultipleOptions::default())
        .collect()?;

    info!(
        "Feature table: {} rows after removing {} excluded households",
        features.height(),
        excluded.len()
    );
    Ok(features)
}

//! Staging of raw price report CSVs.
//!
//! Feed format: one row per station and report time carrying current
//! prices for all three fuels plus 0/1 change flags. Only fuels whose
//! flag is set actually changed at that time; the other cells repeat
//! the standing price and are dropped here. Files parse in parallel,
//! then all rows are staged into the given collection in one append.

use super::{ImportError, ImportOutcome};
use chrono::{DateTime, NaiveDateTime};
use forecourt_core::domain::{Fuel, PriceRecord, RecordId, StationId};
use forecourt_core::store::DocumentStore;
use rayon::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

const FUEL_COLUMNS: [(Fuel, &str, &str); 3] = [
    (Fuel::Diesel, "diesel", "dieselchange"),
    (Fuel::E5, "e5", "e5change"),
    (Fuel::E10, "e10", "e10change"),
];

/// Parses every CSV under `paths` and appends the changed-price rows
/// to `collection` as staged [`PriceRecord`] documents.
pub fn stage_price_reports(
    store: &DocumentStore,
    collection: &str,
    paths: &[PathBuf],
    minimum_price: f64,
) -> Result<ImportOutcome, ImportError> {
    let files = collect_csv_files(paths)?;
    let parsed: Vec<(Vec<Value>, ImportOutcome)> = files
        .par_iter()
        .map(|path| parse_file(path, minimum_price))
        .collect::<Result<Vec<_>, _>>()?;

    let mut outcome = ImportOutcome {
        files: files.len(),
        ..ImportOutcome::default()
    };
    let mut staged = Vec::new();
    for (docs, file_outcome) in parsed {
        outcome.absorb(file_outcome);
        staged.extend(docs);
    }
    if !staged.is_empty() {
        store.insert_many(collection, staged)?;
    }
    tracing::info!(
        collection,
        files = outcome.files,
        rows = outcome.rows,
        staged = outcome.imported,
        skipped = outcome.skipped,
        "price reports staged"
    );
    Ok(outcome)
}

/// Expands the given paths into a sorted list of CSV files. Files are
/// taken as given; directories are walked recursively for `.csv`.
pub fn collect_csv_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>, ImportError> {
    let mut files = Vec::new();
    for path in paths {
        let meta = fs::metadata(path).map_err(|source| ImportError::Io {
            path: path.clone(),
            source,
        })?;
        if meta.is_dir() {
            walk(path, &mut files)?;
        } else {
            files.push(path.clone());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn walk(dir: &Path, into: &mut Vec<PathBuf>) -> Result<(), ImportError> {
    let entries = fs::read_dir(dir).map_err(|source| ImportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ImportError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, into)?;
        } else if path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("csv"))
        {
            into.push(path);
        }
    }
    Ok(())
}

fn parse_file(
    path: &Path,
    minimum_price: f64,
) -> Result<(Vec<Value>, ImportOutcome), ImportError> {
    let csv_err = |source| ImportError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;

    let headers = reader.headers().map_err(csv_err)?.clone();
    let column = |name: &'static str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ImportError::MissingColumn {
                path: path.to_path_buf(),
                column: name,
            })
    };
    let date_col = column("date")?;
    let station_col = column("station_uuid")?;
    let mut fuel_cols = Vec::with_capacity(FUEL_COLUMNS.len());
    for (fuel, price_name, flag_name) in FUEL_COLUMNS {
        fuel_cols.push((fuel, column(price_name)?, column(flag_name)?));
    }

    let mut outcome = ImportOutcome::default();
    let mut docs = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        outcome.rows += 1;

        let Some(reported_at) = record.get(date_col).and_then(parse_report_time) else {
            outcome.skipped += 1;
            continue;
        };
        let Some(station) = record.get(station_col).filter(|s| !s.is_empty()) else {
            outcome.skipped += 1;
            continue;
        };
        let station_id = StationId::new(station);

        for &(fuel, price_col, flag_col) in &fuel_cols {
            if record.get(flag_col) != Some("1") {
                continue;
            }
            let Some(price) = record.get(price_col).and_then(|s| s.parse::<f64>().ok()) else {
                outcome.skipped += 1;
                continue;
            };
            if price < minimum_price {
                tracing::debug!(
                    station,
                    price,
                    fuel = fuel.key(),
                    "price below sanity floor, dropped"
                );
                outcome.skipped += 1;
                continue;
            }
            let row = PriceRecord {
                record_id: RecordId::random(),
                station_id: station_id.clone(),
                fuel,
                price,
                reported_at,
            };
            docs.push(serde_json::to_value(&row).map_err(ImportError::Encode)?);
            outcome.imported += 1;
        }
    }
    Ok((docs, outcome))
}

/// Feed timestamps carry a zone offset (`2024-11-19 03:07:29+01`); the
/// day bucketing works on the wall-clock time they encode.
fn parse_report_time(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%#z") {
        return Some(dt.naive_local());
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

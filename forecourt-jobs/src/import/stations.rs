//! Station master data import.
//!
//! One CSV row per station. Rows replace the master data fields of an
//! existing station and leave its latest-price cache alone.

use super::{ImportError, ImportOutcome};
use forecourt_core::domain::{GeoLocation, Station, StationAddress, StationId};
use forecourt_core::repo::StationRepository;
use forecourt_core::store::DocumentStore;
use std::collections::BTreeMap;
use std::path::Path;

/// Reads one master data CSV and upserts every station in it.
pub fn import_stations(store: &DocumentStore, path: &Path) -> Result<ImportOutcome, ImportError> {
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
    let uuid_col = column("uuid")?;
    let name_col = column("name")?;
    let brand_col = column("brand")?;
    let street_col = column("street")?;
    let house_col = column("house_number")?;
    let post_code_col = column("post_code")?;
    let city_col = column("city")?;
    let lat_col = column("latitude")?;
    let lon_col = column("longitude")?;

    let mut outcome = ImportOutcome {
        files: 1,
        ..ImportOutcome::default()
    };
    let mut stations = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        outcome.rows += 1;

        let Some(uuid) = record.get(uuid_col).filter(|s| !s.is_empty()) else {
            outcome.skipped += 1;
            continue;
        };
        let cell = |idx: usize| record.get(idx).unwrap_or_default();

        let location = parse_location(cell(lat_col), cell(lon_col));
        if location.is_none() {
            tracing::debug!(station = uuid, "no usable coordinates, importing without location");
        }
        stations.push(Station {
            id: StationId::new(uuid),
            name: title_case(cell(name_col)),
            brand: cell(brand_col).to_string(),
            address: StationAddress {
                street: title_case(cell(street_col)),
                house_number: cell(house_col).to_string(),
                post_code: cell(post_code_col).to_string(),
                city: title_case(cell(city_col)),
            },
            location,
            latest_price: BTreeMap::new(),
            latest_prices: BTreeMap::new(),
        });
    }

    outcome.imported = StationRepository::new(store).upsert_master_data(stations)?;
    tracing::info!(
        rows = outcome.rows,
        imported = outcome.imported,
        skipped = outcome.skipped,
        "stations imported"
    );
    Ok(outcome)
}

/// The feed contains stations with junk coordinates (0/0, swapped
/// axes, plain garbage); those import without a location.
fn parse_location(latitude: &str, longitude: &str) -> Option<GeoLocation> {
    let location = GeoLocation {
        latitude: latitude.parse().ok()?,
        longitude: longitude.parse().ok()?,
    };
    location.is_valid().then_some(location)
}

/// The feed shouts. Names, streets and cities are title-cased for
/// display; brands stay verbatim since many are initialisms.
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_word_start = true;
    for c in text.chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = !c.is_ascii_digit();
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

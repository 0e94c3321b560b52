//! Station master data and the per-station latest-price cache.

use crate::domain::fuel::Fuel;
use crate::domain::ids::StationId;
use crate::domain::price::DailyPriceSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Postal address of a station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationAddress {
    pub street: String,
    pub house_number: String,
    pub post_code: String,
    pub city: String,
}

/// The slice of station identity denormalized into each price bucket, so a
/// bucket can render and group without a join.
///
/// A summary holding only the id is the seed state of a freshly upserted
/// bucket; the remaining fields are copied in by the first-report repair or
/// the batch station lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationSummary {
    pub id: StationId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub post_code: String,
}

/// WGS84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    pub longitude: f64,
    pub latitude: f64,
}

impl GeoLocation {
    /// True when both coordinates lie inside the valid WGS84 ranges. The
    /// master data feed contains stations with junk coordinates.
    pub fn is_valid(&self) -> bool {
        (-180.0..=180.0).contains(&self.longitude) && (-90.0..=90.0).contains(&self.latitude)
    }
}

/// A fuel station: master data plus the latest-price cache.
///
/// `latest_price` holds the most recent day snapshot per fuel, and
/// `latest_prices` a bounded day-descending trailing list per fuel. Both
/// are maintained incrementally by `apply_snapshot` and rebuilt wholesale
/// by the batch cache refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub id: StationId,
    pub name: String,
    #[serde(default)]
    pub brand: String,
    pub address: StationAddress,
    #[serde(default)]
    pub location: Option<GeoLocation>,
    #[serde(default)]
    pub latest_price: BTreeMap<Fuel, DailyPriceSnapshot>,
    #[serde(default)]
    pub latest_prices: BTreeMap<Fuel, Vec<DailyPriceSnapshot>>,
}

impl Station {
    /// The identity slice copied into price buckets.
    pub fn summary(&self) -> StationSummary {
        StationSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            brand: self.brand.clone(),
            post_code: self.address.post_code.clone(),
        }
    }

    /// Most recent snapshot for a fuel, if any day has been reported.
    pub fn latest_for(&self, fuel: Fuel) -> Option<&DailyPriceSnapshot> {
        self.latest_price.get(&fuel)
    }

    /// Trailing day-descending snapshots for a fuel.
    pub fn history_for(&self, fuel: Fuel) -> &[DailyPriceSnapshot] {
        self.latest_prices.get(&fuel).map_or(&[], Vec::as_slice)
    }

    /// Merges a freshly computed day snapshot into the cache.
    ///
    /// The single slot only moves forward in time. The per-fuel history is
    /// deduplicated by day (a recomputed day replaces its older snapshot),
    /// kept day-descending and truncated to `capacity`.
    pub fn apply_snapshot(&mut self, snapshot: DailyPriceSnapshot, capacity: usize) {
        let fuel = snapshot.fuel;

        match self.latest_price.get(&fuel) {
            Some(current) if current.day > snapshot.day => {}
            _ => {
                self.latest_price.insert(fuel, snapshot.clone());
            }
        }

        let history = self.latest_prices.entry(fuel).or_default();
        history.retain(|s| s.day != snapshot.day);
        history.push(snapshot);
        history.sort_by(|a, b| b.day.cmp(&a.day));
        history.truncate(capacity);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

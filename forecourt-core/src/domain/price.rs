//! Price reports and per-day price buckets.

use crate::domain::fuel::Fuel;
use crate::domain::ids::{RecordId, StationId};
use crate::domain::station::StationSummary;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// One timestamped price report, as staged by the batch importer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRecord {
    pub record_id: RecordId,
    pub station_id: StationId,
    pub fuel: Fuel,
    pub price: f64,
    pub reported_at: NaiveDateTime,
}

/// One entry in a bucket's ordered price list.
///
/// `previous_price` is the price in effect just before this report — for the
/// first entry of a day, the opening price once that is known — and `change`
/// is the signed difference. Both are absent until they can be determined,
/// and `change` is only ever present together with `previous_price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceEntry {
    pub record_id: RecordId,
    pub reported_at: NaiveDateTime,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<f64>,
}

/// Extreme-value marker: the report holding the day's lowest or highest
/// price. Ties keep the incumbent, so the record id is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub record_id: RecordId,
    pub reported_at: NaiveDateTime,
    pub price: f64,
}

/// One price bucket per (station, fuel, day).
///
/// Buckets are created by the first report of a day carrying nothing but
/// their key fields; the update pipeline fills in defaults and running
/// values. A bucket whose station summary still lacks a name has not had
/// its denormalized identity and opening price copied in yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPriceAggregate {
    pub station: StationSummary,
    pub fuel: Fuel,
    pub day: NaiveDate,
    #[serde(default)]
    pub opening_price: Option<f64>,
    #[serde(default)]
    pub closing_price: Option<f64>,
    #[serde(default)]
    pub lowest_price: Option<PricePoint>,
    #[serde(default)]
    pub highest_price: Option<PricePoint>,
    #[serde(default)]
    pub weighted_average_price: Option<f64>,
    #[serde(default)]
    pub prices: Vec<PriceEntry>,
}

impl DailyPriceAggregate {
    /// Whether the denormalized station identity has been filled in.
    pub fn has_station_identity(&self) -> bool {
        !self.station.name.is_empty()
    }

    pub fn latest_entry(&self) -> Option<&PriceEntry> {
        self.prices.last()
    }

    /// Projects the bucket down to what the station cache stores.
    pub fn snapshot(&self) -> DailyPriceSnapshot {
        DailyPriceSnapshot {
            fuel: self.fuel,
            day: self.day,
            opening_price: self.opening_price,
            closing_price: self.closing_price,
            lowest_price: self.lowest_price.clone(),
            highest_price: self.highest_price.clone(),
            weighted_average_price: self.weighted_average_price,
        }
    }
}

/// A bucket minus its price list and station summary — the shape cached on
/// stations, where the owner is implied and the full report log would bloat
/// every station read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPriceSnapshot {
    pub fuel: Fuel,
    pub day: NaiveDate,
    #[serde(default)]
    pub opening_price: Option<f64>,
    #[serde(default)]
    pub closing_price: Option<f64>,
    #[serde(default)]
    pub lowest_price: Option<PricePoint>,
    #[serde(default)]
    pub highest_price: Option<PricePoint>,
    #[serde(default)]
    pub weighted_average_price: Option<f64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! Fleet-wide daily statistics per fuel.

use crate::domain::fuel::Fuel;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Approximate percentile cut-points over a day's weighted averages.
/// Monotone by construction: p50 <= p90 <= p95 <= p99.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Statistics for one fuel on one day, fleet-wide or per post code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyFuelStatistics {
    pub day: NaiveDate,
    pub fuel: Fuel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_code: Option<String>,
    pub num_stations: u64,
    /// Average number of price changes per station.
    pub num_changes: f64,
    /// Minimum of the buckets' lowest traded prices.
    pub lowest_price: f64,
    /// Maximum of the buckets' highest traded prices.
    pub highest_price: f64,
    /// Average of the buckets' weighted averages.
    pub weighted_average_price: f64,
    pub percentiles: Percentiles,
}

impl DailyFuelStatistics {
    /// Classifies a weighted average against this day's cut-points.
    pub fn band(&self, price: f64) -> PercentileBand {
        let p = &self.percentiles;
        if price > p.p99 {
            PercentileBand::Top1
        } else if price > p.p95 {
            PercentileBand::Top5
        } else if price > p.p90 {
            PercentileBand::Top10
        } else if price > p.p50 {
            PercentileBand::Top50
        } else {
            PercentileBand::Bottom50
        }
    }
}

/// How expensive a station is relative to the fleet on a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercentileBand {
    Top1,
    Top5,
    Top10,
    Top50,
    Bottom50,
}

impl PercentileBand {
    pub fn label(self) -> &'static str {
        match self {
            PercentileBand::Top1 => "> 99%",
            PercentileBand::Top5 => "> 95%",
            PercentileBand::Top10 => "> 90%",
            PercentileBand::Top50 => "> 50%",
            PercentileBand::Bottom50 => "< 50%",
        }
    }
}

impl fmt::Display for PercentileBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The most recent statistics day with all fuels pivoted into fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundDailyAggregate {
    pub day: NaiveDate,
    #[serde(default)]
    pub diesel: Option<DailyFuelStatistics>,
    #[serde(default)]
    pub e5: Option<DailyFuelStatistics>,
    #[serde(default)]
    pub e10: Option<DailyFuelStatistics>,
}

impl CompoundDailyAggregate {
    pub fn for_fuel(&self, fuel: Fuel) -> Option<&DailyFuelStatistics> {
        match fuel {
            Fuel::Diesel => self.diesel.as_ref(),
            Fuel::E5 => self.e5.as_ref(),
            Fuel::E10 => self.e10.as_ref(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

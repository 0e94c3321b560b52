//! Domain types for the fuel-price aggregation engine

pub mod fuel;
pub mod ids;
pub mod price;
pub mod station;
pub mod statistics;

pub use fuel::{Fuel, UnknownFuel};
pub use ids::{RecordId, StationId};
pub use price::{DailyPriceAggregate, DailyPriceSnapshot, PriceEntry, PricePoint, PriceRecord};
pub use station::{GeoLocation, Station, StationAddress, StationSummary};
pub use statistics::{CompoundDailyAggregate, DailyFuelStatistics, PercentileBand, Percentiles};
